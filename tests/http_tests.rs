//! HTTP API tests: in-process with `oneshot`, plus one live round trip.

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::Fixture;
use ondevice_session::config::Config;
use ondevice_session::engine::reference::write_adapter_file;
use ondevice_session::engine::ModelSpec;
use ondevice_session::server::http_api::{build_router, AppState};

const UI_ORIGIN: &str = "http://localhost:3000";

fn app(fx: &Fixture) -> Router {
    let mut config = Config::default();
    config.snapshot.dir = fx.path("snapshots");
    config.server.cors_origins = vec![UI_ORIGIN.to_string()];
    let state = Arc::new(AppState::new(fx.manager.clone(), Arc::new(config)));
    build_router(state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(app: &Router, fx: &Fixture, config: Value) -> String {
    let (status, body) = send_json(
        app,
        "POST",
        "/v1/sessions",
        Some(json!({ "model_path": fx.model, "config": config })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().to_string()
}

fn small() -> Value {
    json!({ "context_length": 256, "batch_size": 64, "micro_batch_size": 64 })
}

#[tokio::test]
async fn test_health_and_metrics() {
    let fx = Fixture::scripted("ok");
    let app = app(&fx);

    let (status, body) = send_json(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "reference");
    assert_eq!(body["sessions"], 0);

    create(&app, &fx, small()).await;
    let (status, text) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains("ondevice_live_sessions 1"));
}

#[tokio::test]
async fn test_session_lifecycle() {
    let fx = Fixture::scripted("ok");
    let app = app(&fx);
    let id = create(&app, &fx, small()).await;

    let (status, info) = send_json(&app, "GET", &format!("/v1/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["config"]["context_length"], 256);
    assert_eq!(info["activity"], "idle");

    let (_, list) = send_json(&app, "GET", "/v1/sessions", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "DELETE", &format!("/v1/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send_json(&app, "GET", &format!("/v1/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_create_errors() {
    let fx = Fixture::scripted("ok");
    let app = app(&fx);

    let (status, body) = send_json(
        &app,
        "POST",
        "/v1/sessions",
        Some(json!({ "model_path": fx.path("missing.gguf") })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "model_load");

    let (status, body) = send_json(
        &app,
        "POST",
        "/v1/sessions",
        Some(json!({ "model_path": fx.model, "config": { "context_length": 2 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "configuration");
}

#[tokio::test]
async fn test_completion_json() {
    let fx = Fixture::scripted("hello there");
    let app = app(&fx);
    let id = create(&app, &fx, small()).await;

    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/completions"),
        Some(json!({ "prompt": "> ", "temperature": 0.0, "stop": [" "] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["text"], "hello");
    assert_eq!(body["stop_reason"], "stop_word");
    assert_eq!(body["final_state"], "completed");

    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/completions"),
        Some(json!({ "prompt": "> ", "top_p": 0.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "configuration");
}

#[tokio::test]
async fn test_completion_stream() {
    let fx = Fixture::scripted("streamed");
    let app = app(&fx);
    let id = create(&app, &fx, small()).await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/completions"),
        Some(json!({ "prompt": "> ", "temperature": 0.0, "stream": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = String::from_utf8(body).unwrap();

    let events: Vec<&str> = body
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    assert_eq!(*events.last().unwrap(), "[DONE]");

    let chunks: Vec<Value> = events[..events.len() - 1]
        .iter()
        .map(|e| serde_json::from_str(e).unwrap())
        .collect();
    let text: String = chunks
        .iter()
        .filter(|c| c["stop"] == false)
        .map(|c| c["content"].as_str().unwrap())
        .collect();
    assert_eq!(text, "streamed");
    let last = chunks.last().unwrap();
    assert_eq!(last["stop"], true);
    assert_eq!(last["result"]["text"], "streamed");
}

#[tokio::test]
async fn test_stream_unknown_session_is_404() {
    let fx = Fixture::scripted("x");
    let app = app(&fx);
    let (status, _) = send(
        &app,
        "POST",
        "/v1/sessions/00000000-0000-4000-8000-000000000000/completions",
        Some(json!({ "prompt": "a", "stream": true })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tokenize_roundtrip_and_cancel() {
    let fx = Fixture::scripted("x");
    let app = app(&fx);
    let id = create(&app, &fx, small()).await;

    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/tokenize"),
        Some(json!({ "content": "hi", "add_special": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokens"], json!([256, 104, 105]));

    let (_, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/detokenize"),
        Some(json!({ "tokens": [104, 105] })),
    )
    .await;
    assert_eq!(body["content"], "hi");

    let (status, _) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/detokenize"),
        Some(json!({ "tokens": [100000] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) =
        send_json(&app, "POST", &format!("/v1/sessions/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_embeddings_capability() {
    let fx = Fixture::scripted("x");
    let app = app(&fx);
    let plain = create(&app, &fx, small()).await;
    let embed = create(
        &app,
        &fx,
        json!({ "context_length": 256, "batch_size": 64, "micro_batch_size": 64, "embedding": true }),
    )
    .await;

    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{plain}/embeddings"),
        Some(json!({ "content": "text" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "capability");

    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{embed}/embeddings"),
        Some(json!({ "content": "text", "normalize": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["embedding"].as_array().unwrap().len(), 16);

    let (status, _) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{embed}/embeddings"),
        Some(json!({ "content": "text", "normalize": 7 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_snapshot_and_adapters() {
    let fx = Fixture::scripted("abc");
    let app = app(&fx);
    let id = create(&app, &fx, small()).await;

    send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/completions"),
        Some(json!({ "prompt": "prefix", "n_predict": 0 })),
    )
    .await;

    let snap = "nested/http.snap";
    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/snapshot/save"),
        Some(json!({ "path": snap })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["tokens_saved"], 7);
    assert!(fx.path("snapshots/nested/http.snap").exists());

    let other = create(&app, &fx, small()).await;
    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{other}/snapshot/load"),
        Some(json!({ "path": snap })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokens_loaded"], 7);
    assert_eq!(body["prompt"], "prefix");

    let adapter = fx.path("a.lora");
    write_adapter_file(&adapter, b"a").unwrap();
    let uri = format!("/v1/sessions/{id}/adapters");
    let (status, _) = send_json(
        &app,
        "PUT",
        &uri,
        Some(json!({ "adapters": [{ "path": adapter, "scale": 0.5 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send_json(&app, "GET", &uri, None).await;
    assert_eq!(body["adapters"][0]["scale"], 0.5);

    let (status, _) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send_json(&app, "GET", &uri, None).await;
    assert_eq!(body["adapters"], json!([]));

    let (status, body) = send_json(
        &app,
        "PUT",
        &uri,
        Some(json!({ "adapters": [{ "path": fx.path("nope.lora") }] })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "adapter_load");
}

#[tokio::test]
async fn test_snapshot_paths_stay_in_snapshot_dir() {
    let fx = Fixture::scripted("abc");
    let app = app(&fx);
    let id = create(&app, &fx, small()).await;
    let outside = fx.path("outside.snap");

    for (route, path) in [
        ("save", json!(&outside)),
        ("save", json!("../outside.snap")),
        ("load", json!("a/../../outside.snap")),
        ("load", json!("/etc/hostname")),
    ] {
        let (status, body) = send_json(
            &app,
            "POST",
            &format!("/v1/sessions/{id}/snapshot/{route}"),
            Some(json!({ "path": path })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{route} {path}");
        assert_eq!(body["kind"], "configuration");
    }
    assert!(!outside.exists());
}

#[tokio::test]
async fn test_cors_only_for_configured_origins() {
    let fx = Fixture::scripted("ok");
    let app = app(&fx);

    for (origin, allowed) in [(UI_ORIGIN, true), ("http://evil.example", false)] {
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/v1/sessions")
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let header = response.headers().get("access-control-allow-origin");
        assert_eq!(header.is_some(), allowed, "{origin}");
        if allowed {
            assert_eq!(header.unwrap(), UI_ORIGIN);
        }
    }
}

#[tokio::test]
async fn test_chat_format() {
    let fx = Fixture::new(ModelSpec {
        chat_template: Some("<|im_start|>{{role}}\n{{content}}<|im_end|>".to_string()),
        ..common::scripted("hi")
    });
    let app = app(&fx);
    let id = create(&app, &fx, small()).await;
    let uri = format!("/v1/sessions/{id}/chat/format");
    let messages = json!([{ "role": "user", "content": "Hello" }]);

    let (status, body) = send_json(&app, "POST", &uri, Some(json!({ "messages": messages }))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["format"], "chat_ml");
    assert_eq!(body["source"], "model");
    assert_eq!(body["prompt"], "<|im_start|>user\nHello<|im_end|>\n<|im_start|>assistant\n");
    assert_eq!(body["stop"], json!(["<|im_end|>"]));

    let (status, body) = send_json(
        &app,
        "POST",
        &uri,
        Some(json!({ "messages": messages, "chat_template": "gemma" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "request");
    assert_eq!(body["prompt"], "<start_of_turn>user\nHello<end_of_turn>\n<start_of_turn>model\n");

    let (status, body) = send_json(&app, "POST", &uri, Some(json!({ "messages": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "configuration");
}

#[tokio::test]
async fn test_bench_and_model_info() {
    let fx = Fixture::scripted("x");
    let app = app(&fx);
    let id = create(&app, &fx, small()).await;

    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/sessions/{id}/bench"),
        Some(json!({ "pp": 16, "tg": 4 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["repetitions"], 1);

    let (status, body) = send_json(
        &app,
        "POST",
        "/v1/models/info",
        Some(json!({ "model_path": fx.model })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["architecture"], "llama");
    assert_eq!(body["n_vocab"], 258);

    let (status, body) = send_json(
        &app,
        "POST",
        "/v1/models/info",
        Some(json!({ "model_path": fx.path("missing.gguf") })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "io");
}

#[tokio::test]
async fn test_live_server_roundtrip() {
    let fx = Fixture::scripted("over the wire");
    let app = app(&fx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");
    let created: Value = client
        .post(format!("{base}/v1/sessions"))
        .json(&json!({ "model_path": fx.model, "config": small() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap();

    let response = client
        .post(format!("{base}/v1/sessions/{id}/completions"))
        .json(&json!({ "prompt": "> ", "temperature": 0.0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let result: Value = response.json().await.unwrap();
    assert_eq!(result["text"], "over the wire");

    server.abort();
}

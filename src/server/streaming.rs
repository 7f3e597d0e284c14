//! SSE (Server-Sent Events) streaming for token-by-token completions.
//!
//! Every accepted token becomes one `data:` event; the terminal event carries the
//! full result (or the error) and the stream ends with `[DONE]`.

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::engine::TokenId;
use crate::gateway::GenerationEvent;
use crate::generation::{GenerationResult, TokenProbs};
use crate::server::http_api::ErrorBody;

/// One streamed completion chunk.
#[derive(Debug, Serialize)]
pub struct CompletionChunk {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probs: Option<TokenProbs>,
    pub stop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
}

/// Convert a generation event receiver into an SSE stream.
pub fn generation_to_sse_stream(
    rx: mpsc::Receiver<GenerationEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    ReceiverStream::new(rx)
        .map(|event| {
            let event = match event {
                GenerationEvent::Chunk(chunk) => Event::default().json_data(CompletionChunk {
                    content: chunk.text,
                    token: chunk.token,
                    probs: chunk.probs,
                    stop: false,
                    result: None,
                }),
                GenerationEvent::Done(result) => Event::default().json_data(CompletionChunk {
                    content: String::new(),
                    token: None,
                    probs: None,
                    stop: true,
                    result: Some(result),
                }),
                GenerationEvent::Error(e) => Event::default()
                    .event("error")
                    .json_data(ErrorBody::from(&e)),
            };
            Ok(event.unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
        })
        // Append the [DONE] sentinel after all events.
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}

//! Applying and removing LoRA adapters.

mod common;

use common::{small_config, Fixture};
use ondevice_session::config::SessionConfig;
use ondevice_session::engine::reference::write_adapter_file;
use ondevice_session::engine::{AdapterSpec, TokenId};
use ondevice_session::generation::{GenerationRequest, SamplingParams};
use ondevice_session::{ErrorKind, Session};

fn tokens(session: &Session) -> Vec<TokenId> {
    let params = SamplingParams {
        ignore_eos: true,
        ..SamplingParams::greedy()
    };
    session
        .complete(GenerationRequest::new("adapt: ").with_params(params).with_n_predict(8))
        .unwrap()
        .tokens
}

#[test]
fn test_apply_and_remove() {
    let fx = Fixture::new(Default::default());
    let adapter = fx.path("style.lora");
    write_adapter_file(&adapter, b"style").unwrap();
    let session = fx.session();

    let baseline = tokens(&session);
    assert!(session.cached_tokens() > 0);

    session
        .apply_adapters(vec![AdapterSpec::new(&adapter, 50.0)])
        .unwrap();
    assert_eq!(session.cached_tokens(), 0);
    assert_eq!(session.adapters(), vec![AdapterSpec::new(&adapter, 50.0)]);
    let adapted = tokens(&session);
    assert_ne!(adapted, baseline);

    session.remove_adapters().unwrap();
    assert!(session.adapters().is_empty());
    assert_eq!(session.cached_tokens(), 0);
    assert_eq!(tokens(&session), baseline);

    // Removing again is a no-op.
    session.remove_adapters().unwrap();
}

#[test]
fn test_failed_apply_keeps_previous_state() {
    let fx = Fixture::new(Default::default());
    let good = fx.path("good.lora");
    write_adapter_file(&good, b"good").unwrap();
    let bad = fx.path("bad.lora");
    std::fs::write(&bad, b"NOPE").unwrap();
    let session = fx.session();

    session.apply_adapters(vec![AdapterSpec::new(&good, 1.0)]).unwrap();
    let before = tokens(&session);
    let cached = session.cached_tokens();

    let err = session
        .apply_adapters(vec![AdapterSpec::new(&good, 1.0), AdapterSpec::new(&bad, 1.0)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterLoad);
    assert!(err.to_string().contains("bad.lora"));

    let missing = fx.path("missing.lora");
    let err = session
        .apply_adapters(vec![AdapterSpec::new(&missing, 1.0)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterLoad);

    assert_eq!(session.adapters(), vec![AdapterSpec::new(&good, 1.0)]);
    assert_eq!(session.cached_tokens(), cached);
    assert_eq!(tokens(&session), before);
}

#[test]
fn test_non_finite_scale_is_rejected() {
    let fx = Fixture::new(Default::default());
    let adapter = fx.path("a.lora");
    write_adapter_file(&adapter, b"a").unwrap();
    let session = fx.session();

    let err = session
        .apply_adapters(vec![AdapterSpec::new(&adapter, f32::NAN)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_initial_adapters_match_applied() {
    let fx = Fixture::new(Default::default());
    let adapter = fx.path("init.lora");
    write_adapter_file(&adapter, b"init").unwrap();
    let spec = AdapterSpec::new(&adapter, 20.0);

    let preloaded = fx.session_with(SessionConfig {
        initial_adapters: vec![spec.clone()],
        ..small_config()
    });
    assert_eq!(preloaded.info().adapters, vec![spec.clone()]);

    let applied = fx.session();
    applied.apply_adapters(vec![spec]).unwrap();
    assert_eq!(tokens(&preloaded), tokens(&applied));
}

#[test]
fn test_missing_initial_adapter_fails_creation() {
    let fx = Fixture::new(Default::default());
    let config = SessionConfig {
        initial_adapters: vec![AdapterSpec::new(fx.path("absent.lora"), 1.0)],
        ..small_config()
    };
    let err = fx.manager.create_session(&fx.model, config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterLoad);
    assert_eq!(fx.manager.session_count(), 0);
}

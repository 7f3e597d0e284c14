//! Shared fixtures: reference model files in a temp dir and a session manager.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use ondevice_session::config::{SessionConfig, SnapshotConfig};
use ondevice_session::engine::model_file::write_model_file;
use ondevice_session::engine::{ModelSpec, ReferenceBackend};
use ondevice_session::generation::{GenerationRequest, SamplingParams};
use ondevice_session::session::{Session, SessionManager};
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub model: PathBuf,
    pub manager: Arc<SessionManager>,
}

impl Fixture {
    pub fn new(spec: ModelSpec) -> Self {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("model.gguf");
        write_model_file(&model, &spec).unwrap();
        let manager = Arc::new(
            SessionManager::new(Arc::new(ReferenceBackend::new()), SnapshotConfig::default())
                .unwrap(),
        );
        Self { dir, model, manager }
    }

    pub fn scripted(script: &str) -> Self {
        Self::new(scripted(script))
    }

    pub fn session(&self) -> Arc<Session> {
        self.session_with(small_config())
    }

    pub fn session_with(&self, config: SessionConfig) -> Arc<Session> {
        self.manager.create_session(&self.model, config).unwrap()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn scripted(script: &str) -> ModelSpec {
    ModelSpec {
        script: Some(script.to_string()),
        ..Default::default()
    }
}

pub fn small_config() -> SessionConfig {
    SessionConfig {
        context_length: 256,
        batch_size: 64,
        micro_batch_size: 64,
        ..Default::default()
    }
}

pub fn greedy(prompt: &str) -> GenerationRequest {
    GenerationRequest::new(prompt).with_params(SamplingParams::greedy())
}

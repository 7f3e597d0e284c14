//! Async front for the blocking session operations.
//!
//! Engine work is CPU-bound and holds the session lock for its whole run, so
//! every call is moved onto tokio's blocking pool. Streaming generations report
//! through an mpsc channel; when the receiver goes away the run is stopped at the
//! next token.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::engine::{AdapterSpec, ModelMetadata};
use crate::error::{Result, SessionError};
use crate::generation::{
    BenchParams, BenchResult, EmbeddingResult, GenerationRequest, GenerationResult, Normalize,
    StreamChunk, StreamControl,
};
use crate::session::{Session, SessionManager, SnapshotLoad};

/// Event emitted by a streaming generation.
#[derive(Debug)]
pub enum GenerationEvent {
    /// Safe text for one accepted token.
    Chunk(StreamChunk),
    /// Generation reached a terminal state.
    Done(GenerationResult),
    /// Generation could not start or failed mid-run.
    Error(SessionError),
}

#[derive(Clone)]
pub struct Gateway {
    manager: Arc<SessionManager>,
    buffer: usize,
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SessionError::InvalidSession(format!("worker task failed: {e}")))?
}

impl Gateway {
    pub fn new(manager: Arc<SessionManager>, buffer: usize) -> Self {
        Self {
            manager,
            buffer: buffer.max(1),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub async fn create_session(&self, model_path: PathBuf, config: SessionConfig) -> Result<Arc<Session>> {
        let manager = self.manager.clone();
        run_blocking(move || manager.create_session(&model_path, config)).await
    }

    pub async fn model_info(&self, model_path: PathBuf) -> Result<ModelMetadata> {
        let manager = self.manager.clone();
        run_blocking(move || manager.model_info(&model_path)).await
    }

    /// Destroy does not block on engine work: it fails with `Busy` instead.
    pub fn destroy_session(&self, id: Uuid) -> Result<()> {
        self.manager.destroy_session(id)
    }

    pub async fn complete(&self, id: Uuid, request: GenerationRequest) -> Result<GenerationResult> {
        let session = self.manager.get(id)?;
        run_blocking(move || session.complete(request)).await
    }

    /// Start a streaming generation. Events end with exactly one `Done` or `Error`.
    pub fn stream(&self, id: Uuid, request: GenerationRequest) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let session = match self.manager.get(id) {
            Ok(session) => session,
            Err(e) => {
                let _ = tx.try_send(GenerationEvent::Error(e));
                return rx;
            }
        };

        tokio::task::spawn_blocking(move || {
            let mut on_chunk = |chunk: StreamChunk| {
                if tx.blocking_send(GenerationEvent::Chunk(chunk)).is_err() {
                    debug!(session_id = %id, "Stream receiver dropped, stopping generation");
                    return StreamControl::Stop;
                }
                StreamControl::Continue
            };
            let event = match session.generate(request, &mut on_chunk) {
                Ok(result) => GenerationEvent::Done(result),
                Err(e) => GenerationEvent::Error(e),
            };
            let _ = tx.blocking_send(event);
        });
        rx
    }

    pub async fn embed(&self, id: Uuid, text: String, normalize: Normalize) -> Result<EmbeddingResult> {
        let session = self.manager.get(id)?;
        run_blocking(move || session.embed(&text, normalize)).await
    }

    pub fn cancel(&self, id: Uuid) -> Result<bool> {
        Ok(self.manager.get(id)?.cancel())
    }

    pub async fn save_snapshot(&self, id: Uuid, path: PathBuf, max_tokens: i64) -> Result<usize> {
        let session = self.manager.get(id)?;
        run_blocking(move || session.save_snapshot(&path, max_tokens)).await
    }

    pub async fn load_snapshot(&self, id: Uuid, path: PathBuf) -> Result<SnapshotLoad> {
        let session = self.manager.get(id)?;
        run_blocking(move || session.load_snapshot(&path)).await
    }

    pub async fn apply_adapters(&self, id: Uuid, adapters: Vec<AdapterSpec>) -> Result<()> {
        let session = self.manager.get(id)?;
        run_blocking(move || session.apply_adapters(adapters)).await
    }

    pub async fn remove_adapters(&self, id: Uuid) -> Result<()> {
        let session = self.manager.get(id)?;
        run_blocking(move || session.remove_adapters()).await
    }

    pub async fn bench(&self, id: Uuid, params: BenchParams) -> Result<BenchResult> {
        let session = self.manager.get(id)?;
        run_blocking(move || session.bench(params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotConfig;
    use crate::engine::model_file::write_model_file;
    use crate::engine::{ModelSpec, ReferenceBackend};
    use crate::error::ErrorKind;
    use crate::generation::{GenerationState, SamplingParams};
    use tempfile::TempDir;

    fn gateway(dir: &TempDir, script: &str) -> (Gateway, PathBuf) {
        let path = dir.path().join("model.gguf");
        let spec = ModelSpec {
            script: Some(script.to_string()),
            ..Default::default()
        };
        write_model_file(&path, &spec).unwrap();
        let manager =
            SessionManager::new(Arc::new(ReferenceBackend::new()), SnapshotConfig::default()).unwrap();
        (Gateway::new(Arc::new(manager), 8), path)
    }

    fn small() -> SessionConfig {
        SessionConfig {
            context_length: 128,
            batch_size: 32,
            micro_batch_size: 32,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stream_ends_with_done() {
        let dir = TempDir::new().unwrap();
        let (gw, path) = gateway(&dir, "hello");
        let session = gw.create_session(path, small()).await.unwrap();

        let request = GenerationRequest::new("say: ").with_params(SamplingParams::greedy());
        let mut rx = gw.stream(session.id(), request);

        let mut text = String::new();
        let mut done = None;
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Chunk(c) => text.push_str(&c.text),
                GenerationEvent::Done(r) => done = Some(r),
                GenerationEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        let done = done.unwrap();
        assert_eq!(done.final_state, GenerationState::Completed);
        assert_eq!(text, "hello");
        assert_eq!(done.text, "hello");
    }

    #[tokio::test]
    async fn test_stream_unknown_session() {
        let dir = TempDir::new().unwrap();
        let (gw, _) = gateway(&dir, "x");
        let mut rx = gw.stream(Uuid::new_v4(), GenerationRequest::new("a"));
        match rx.recv().await {
            Some(GenerationEvent::Error(e)) => assert_eq!(e.kind(), ErrorKind::NotFound),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_generation() {
        let dir = TempDir::new().unwrap();
        let (gw, path) = gateway(&dir, &"z".repeat(100));
        let session = gw.create_session(path, small()).await.unwrap();

        let request = GenerationRequest::new("go")
            .with_params(SamplingParams::greedy())
            .with_n_predict(-1);
        let mut rx = gw.stream(session.id(), request);
        let first = rx.recv().await;
        assert!(matches!(first, Some(GenerationEvent::Chunk(_))));
        drop(rx);

        // The worker notices on its next send and releases the session.
        for _ in 0..200 {
            if !session.is_busy() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!session.is_busy());
        assert!(session.cached_tokens() < 100);
    }
}

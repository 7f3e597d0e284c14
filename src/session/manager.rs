//! Session registry: creation with progress reporting, lookup, destruction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{SessionConfig, SnapshotConfig};
use crate::engine::{EngineBackend, EngineError, ModelMetadata};
use crate::error::{Result, SessionError};
use crate::metrics::Metrics;
use crate::session::state::{Session, SessionInfo};

/// Share of the progress range spent loading weights.
const LOAD_SHARE: f32 = 0.9;

/// One progress report during session creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadProgress {
    /// Monotonic fraction in `[0, 1]`.
    pub fraction: f32,
    pub status: String,
    pub is_error: bool,
}

impl LoadProgress {
    fn new(fraction: f32, status: impl Into<String>) -> Self {
        Self {
            fraction,
            status: status.into(),
            is_error: false,
        }
    }

    fn error(fraction: f32, status: impl Into<String>) -> Self {
        Self {
            fraction,
            status: status.into(),
            is_error: true,
        }
    }
}

pub struct SessionManager {
    backend: Arc<dyn EngineBackend>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    metrics: Arc<Metrics>,
    snapshot: SnapshotConfig,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn EngineBackend>,
        snapshot: SnapshotConfig,
    ) -> std::result::Result<Self, prometheus::Error> {
        Ok(Self {
            backend,
            sessions: RwLock::new(HashMap::new()),
            metrics: Arc::new(Metrics::new()?),
            snapshot,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Static model metadata without creating a session.
    pub fn model_info(&self, path: &Path) -> Result<ModelMetadata> {
        self.backend.model_info(path).map_err(|e| match e {
            EngineError::ModelNotFound(p) => SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("model file not found: {}", p.display()),
            )),
            EngineError::InvalidModel { reason, .. } => SessionError::Format(reason),
            other => SessionError::from(other),
        })
    }

    pub fn create_session(
        &self,
        model_path: &Path,
        config: SessionConfig,
    ) -> Result<Arc<Session>> {
        self.create_session_with_progress(model_path, config, &mut |_| {})
    }

    /// Load a model and create a session. `progress` sees a non-decreasing
    /// fraction ending at 1.0 on success, or one report with `is_error` set.
    pub fn create_session_with_progress(
        &self,
        model_path: &Path,
        config: SessionConfig,
        progress: &mut dyn FnMut(LoadProgress),
    ) -> Result<Arc<Session>> {
        let start = Instant::now();
        let mut last = 0.0f32;

        let outcome = self.load(model_path, config, progress, &mut last);
        match &outcome {
            Ok(session) => {
                progress(LoadProgress::new(1.0, "ready"));
                info!(
                    session_id = %session.id(),
                    model = %model_path.display(),
                    n_ctx = session.config().context_length,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Session created"
                );
            }
            Err(e) => {
                progress(LoadProgress::error(last, e.to_string()));
                warn!(model = %model_path.display(), error = %e, "Session creation failed");
            }
        }
        outcome
    }

    fn load(
        &self,
        model_path: &Path,
        config: SessionConfig,
        progress: &mut dyn FnMut(LoadProgress),
        last: &mut f32,
    ) -> Result<Arc<Session>> {
        config.validate()?;
        let meta = self
            .backend
            .model_info(model_path)
            .map_err(|e| SessionError::from_load(model_path, e))?;
        config.validate_against(&meta)?;

        progress(LoadProgress::new(0.0, "loading model"));
        let params = config.engine_params();
        let mut engine = self
            .backend
            .load(model_path, &params, &mut |f| {
                let fraction = (f.clamp(0.0, 1.0) * LOAD_SHARE).max(*last);
                if fraction > *last {
                    *last = fraction;
                    progress(LoadProgress::new(fraction, "loading model"));
                }
            })
            .map_err(|e| SessionError::from_load(model_path, e))?;

        if !config.initial_adapters.is_empty() {
            *last = 0.95;
            progress(LoadProgress::new(*last, "applying adapters"));
            engine
                .set_adapters(&config.initial_adapters)
                .map_err(|e| SessionError::from_load(model_path, e))?;
        }

        let adapters = config.initial_adapters.clone();
        let session = Arc::new(Session::new(
            model_path,
            config,
            engine,
            self.snapshot.clone(),
            self.metrics.clone(),
        ));
        if !adapters.is_empty() {
            session.set_initial_adapters(adapters);
        }

        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session.id(), session.clone());
        Ok(session)
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Destroy a session. Fails with `Busy` while an operation is running.
    pub fn destroy_session(&self, id: Uuid) -> Result<()> {
        let session = self.get(id)?;
        session.release()?;
        self.sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        info!(session_id = %id, "Session destroyed");
        Ok(())
    }

    /// Destroy every idle session. Returns how many were left running.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<Uuid> = self
            .sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect();
        let mut busy = 0;
        for id in ids {
            if let Ok(session) = self.get(id) {
                session.cancel();
            }
            if self.destroy_session(id).is_err() {
                busy += 1;
            }
        }
        busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model_file::write_model_file;
    use crate::engine::{ModelSpec, ReferenceBackend};
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(ReferenceBackend::new()), SnapshotConfig::default()).unwrap()
    }

    fn model(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("model.gguf");
        write_model_file(&path, &ModelSpec::default()).unwrap();
        path
    }

    fn small() -> SessionConfig {
        SessionConfig {
            context_length: 64,
            batch_size: 16,
            micro_batch_size: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_progress_is_monotonic_and_ends_at_one() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let mut reports = Vec::new();
        mgr.create_session_with_progress(&model(&dir), small(), &mut |p| reports.push(p))
            .unwrap();

        assert!(reports.len() >= 3);
        assert!(reports.windows(2).all(|w| w[0].fraction <= w[1].fraction));
        let last = reports.last().unwrap();
        assert_eq!(last.fraction, 1.0);
        assert!(!last.is_error);
    }

    #[test]
    fn test_missing_model_reports_error() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let mut reports = Vec::new();
        let err = mgr
            .create_session_with_progress(&dir.path().join("nope.gguf"), small(), &mut |p| {
                reports.push(p)
            })
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::ModelLoad);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_error);
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_model_info_errors() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let missing = mgr.model_info(&dir.path().join("missing.gguf")).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Io);

        let junk = dir.path().join("junk.gguf");
        std::fs::write(&junk, b"not a model at all").unwrap();
        assert_eq!(mgr.model_info(&junk).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn test_destroy_and_lookup() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let session = mgr.create_session(&model(&dir), small()).unwrap();
        let id = session.id();
        assert_eq!(mgr.list().len(), 1);

        mgr.destroy_session(id).unwrap();
        assert_eq!(mgr.get(id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            session.tokenize("x", false).len(),
            1,
            "vocabulary stays usable on a held handle"
        );
        assert_eq!(
            session.complete(crate::generation::GenerationRequest::new("a")).unwrap_err().kind(),
            ErrorKind::InvalidSession
        );
    }

    #[test]
    fn test_live_sessions_gauge() {
        let dir = TempDir::new().unwrap();
        let mgr = manager();
        let session = mgr.create_session(&model(&dir), small()).unwrap();
        assert_eq!(mgr.metrics().live_sessions.get(), 1);
        mgr.destroy_session(session.id()).unwrap();
        drop(session);
        assert_eq!(mgr.metrics().live_sessions.get(), 0);
    }
}

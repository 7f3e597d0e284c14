//! Public error taxonomy of the session layer.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;
use crate::generation::GenerationResult;
use crate::session::snapshot::SnapshotError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("Format error: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session is busy")]
    Busy,

    #[error("Invalid session state: {0}")]
    InvalidSession(String),

    #[error("Capability not available: {0}")]
    Capability(String),

    #[error("Failed to load adapter {path}: {reason}")]
    AdapterLoad { path: PathBuf, reason: String },

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Generation failed after {} tokens: {source}", .partial.tokens_predicted)]
    GenerationFailed {
        source: EngineError,
        partial: Box<GenerationResult>,
    },

    #[error("Session not found: {0}")]
    NotFound(String),
}

/// Stable machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    ModelLoad,
    Format,
    Io,
    Busy,
    InvalidSession,
    Capability,
    AdapterLoad,
    Engine,
    NotFound,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Configuration(_) => ErrorKind::Configuration,
            SessionError::ModelLoad { .. } => ErrorKind::ModelLoad,
            SessionError::Format(_) => ErrorKind::Format,
            SessionError::Io(_) => ErrorKind::Io,
            SessionError::Busy => ErrorKind::Busy,
            SessionError::InvalidSession(_) => ErrorKind::InvalidSession,
            SessionError::Capability(_) => ErrorKind::Capability,
            SessionError::AdapterLoad { .. } => ErrorKind::AdapterLoad,
            SessionError::Engine(_) | SessionError::GenerationFailed { .. } => ErrorKind::Engine,
            SessionError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Output produced before a generation failed.
    pub fn partial_output(&self) -> Option<&GenerationResult> {
        match self {
            SessionError::GenerationFailed { partial, .. } => Some(partial.as_ref()),
            _ => None,
        }
    }

    /// Classify an error raised while loading a model.
    pub(crate) fn from_load(path: &std::path::Path, err: EngineError) -> Self {
        match err {
            EngineError::AdapterLoad { path, reason } => SessionError::AdapterLoad { path, reason },
            other => SessionError::ModelLoad {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::AdapterLoad { path, reason } => SessionError::AdapterLoad { path, reason },
            EngineError::EmbeddingsDisabled => {
                SessionError::Capability("session was not created in embedding mode".to_string())
            }
            EngineError::VocabOnly => {
                SessionError::Capability("session was loaded with vocabulary only".to_string())
            }
            other => SessionError::Engine(other),
        }
    }
}

impl From<SnapshotError> for SessionError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Io(e) => SessionError::Io(e),
            other => SessionError::Format(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        assert_eq!(
            SessionError::from(EngineError::EmbeddingsDisabled).kind(),
            ErrorKind::Capability
        );
        assert_eq!(
            SessionError::from(EngineError::DecodeFailed("x".into())).kind(),
            ErrorKind::Engine
        );
        let adapter = EngineError::AdapterLoad {
            path: PathBuf::from("/a.bin"),
            reason: "bad".into(),
        };
        assert!(SessionError::from(adapter).to_string().contains("/a.bin"));
    }

    #[test]
    fn test_snapshot_error_mapping() {
        let io = SnapshotError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(SessionError::from(io).kind(), ErrorKind::Io);
        assert_eq!(
            SessionError::from(SnapshotError::BadMagic).kind(),
            ErrorKind::Format
        );
    }
}

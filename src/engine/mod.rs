//! Inference engine layer.
//!
//! - [`interface`]: capability traits the session layer drives
//! - [`model_file`]: model container + metadata
//! - [`reference`]: bundled deterministic engine
//! - [`probe`]: process-wide hardware probe
//!
//! The active backend is process-wide and initialized once.

pub mod interface;
pub mod model_file;
pub mod probe;
pub mod reference;

use std::sync::{Arc, OnceLock};

use tracing::info;

pub use interface::{
    AdapterSpec, CacheType, EngineBackend, EngineError, EngineParams, EngineStats,
    GenerationEngine, PoolingType, TokenId, Vocabulary,
};
pub use model_file::{ChatTemplateCaps, ModelMetadata, ModelSpec};
pub use reference::ReferenceBackend;

static BACKEND: OnceLock<Arc<dyn EngineBackend>> = OnceLock::new();

/// Install the process-wide backend. Returns `false` if one was already resolved.
pub fn install_backend(backend: Arc<dyn EngineBackend>) -> bool {
    BACKEND.set(backend).is_ok()
}

/// The process-wide backend, resolving the reference engine on first use.
pub fn backend() -> Arc<dyn EngineBackend> {
    BACKEND
        .get_or_init(|| {
            let caps = probe::capabilities();
            info!(
                backend = "reference",
                cpu_variant = caps.cpu_variant.name(),
                gpus = caps.gpu_count(),
                "Engine backend resolved"
            );
            Arc::new(ReferenceBackend::new())
        })
        .clone()
}

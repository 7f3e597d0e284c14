//! Capability interface to the inference engine.
//!
//! The session manager never does tensor math itself. It drives an engine through
//! two traits:
//! - [`EngineBackend`]: process-wide loader (model info, model + context creation)
//! - [`GenerationEngine`]: one loaded model with its mutable computation cache
//!
//! Vocabulary access is split into [`Vocabulary`] so tokenization can run while a
//! generation holds the engine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::model_file::ModelMetadata;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Invalid model file {path}: {reason}")]
    InvalidModel { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load adapter {path}: {reason}")]
    AdapterLoad { path: PathBuf, reason: String },

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Context is full ({n_ctx} tokens)")]
    ContextFull { n_ctx: usize },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Context not available: model was loaded with vocabulary only")]
    VocabOnly,

    #[error("Embeddings not enabled for this context")]
    EmbeddingsDisabled,

    #[error("State import failed: {0}")]
    StateMismatch(String),

    #[error("Sampling failed: {0}")]
    Sampling(#[from] crate::generation::sampler::SamplingError),
}

/// Token ID type.
pub type TokenId = i32;

/// Numeric type of the computation cache cells (mirrors ggml cache types).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    F32,
    F16,
    Bf16,
    Q8_0,
}

impl CacheType {
    /// Stable numeric tag used in snapshot headers.
    pub fn tag(&self) -> u32 {
        match self {
            CacheType::F32 => 0,
            CacheType::F16 => 1,
            CacheType::Bf16 => 30,
            CacheType::Q8_0 => 8,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(CacheType::F32),
            1 => Some(CacheType::F16),
            30 => Some(CacheType::Bf16),
            8 => Some(CacheType::Q8_0),
            _ => None,
        }
    }

    /// Bytes per element (approximate for block formats).
    pub fn bytes_per_element(&self) -> f64 {
        match self {
            CacheType::F32 => 4.0,
            CacheType::F16 | CacheType::Bf16 => 2.0,
            CacheType::Q8_0 => 34.0 / 32.0,
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheType::F32 => write!(f, "f32"),
            CacheType::F16 => write!(f, "f16"),
            CacheType::Bf16 => write!(f, "bf16"),
            CacheType::Q8_0 => write!(f, "q8_0"),
        }
    }
}

impl FromStr for CacheType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" => Ok(CacheType::F32),
            "f16" => Ok(CacheType::F16),
            "bf16" => Ok(CacheType::Bf16),
            "q8_0" => Ok(CacheType::Q8_0),
            other => Err(format!("Unsupported cache type: {other}")),
        }
    }
}

/// How hidden states are pooled into one embedding vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    /// No pooling: the last token's hidden state.
    #[default]
    None,
    Mean,
    Cls,
    Last,
}

/// A LoRA adapter reference with its blend scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub path: PathBuf,
    #[serde(default = "default_adapter_scale")]
    pub scale: f32,
}

fn default_adapter_scale() -> f32 {
    1.0
}

impl AdapterSpec {
    pub fn new(path: impl Into<PathBuf>, scale: f32) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}

/// Parameters for model + context creation (mirrors llama_model_params and
/// llama_context_params, flattened).
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub n_ctx: usize,
    pub n_batch: usize,
    pub n_ubatch: usize,
    pub n_threads: usize,
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub vocab_only: bool,
    pub cache_type_k: CacheType,
    pub cache_type_v: CacheType,
    pub rope_freq_base: Option<f32>,
    pub rope_freq_scale: Option<f32>,
    pub pooling: PoolingType,
    pub embedding: bool,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_ubatch: 512,
            n_threads: 4,
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            vocab_only: false,
            cache_type_k: CacheType::F16,
            cache_type_v: CacheType::F16,
            rope_freq_base: None,
            rope_freq_scale: None,
            pooling: PoolingType::None,
            embedding: false,
        }
    }
}

/// Engine call counters, used to verify cache reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub decode_calls: u64,
    pub tokens_decoded: u64,
    pub embed_calls: u64,
}

/// Read-only vocabulary of a loaded model.
pub trait Vocabulary: Send + Sync {
    fn n_vocab(&self) -> usize;

    fn bos(&self) -> Option<TokenId>;

    fn eos(&self) -> TokenId;

    /// Encode text. `add_special` prepends BOS when the model uses one.
    fn tokenize(&self, text: &str, add_special: bool) -> Vec<TokenId>;

    /// Raw bytes of one token (may be a partial UTF-8 sequence).
    fn piece(&self, token: TokenId) -> Vec<u8>;

    fn detokenize(&self, tokens: &[TokenId]) -> String {
        let mut bytes = Vec::new();
        for &t in tokens {
            bytes.extend_from_slice(&self.piece(t));
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// One loaded model instance with its computation cache.
///
/// The cache is addressed by position: `decode` appends at `cache_len()`.
pub trait GenerationEngine: Send {
    fn metadata(&self) -> &ModelMetadata;

    fn vocab(&self) -> Arc<dyn Vocabulary>;

    /// Context size the cache was allocated with.
    fn n_ctx(&self) -> usize;

    /// Number of cells currently in the cache.
    fn cache_len(&self) -> usize;

    /// Evaluate a batch, appending it to the cache. Logits are produced for the
    /// last token of the batch.
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), EngineError>;

    /// Logits of the last decoded token.
    fn logits(&self) -> &[f32];

    /// Drop cells at positions `>= len`.
    fn cache_truncate(&mut self, len: usize);

    /// Remove `count` cells starting at `start`, shifting later cells down.
    fn cache_discard(&mut self, start: usize, count: usize);

    /// One forward pass over `tokens` without touching the cache.
    fn embed(&mut self, tokens: &[TokenId], pooling: PoolingType) -> Result<Vec<f32>, EngineError>;

    /// Replace the applied adapter set. An empty slice restores base weights.
    fn set_adapters(&mut self, adapters: &[AdapterSpec]) -> Result<(), EngineError>;

    /// Serialize the first `n_tokens` cache cells.
    fn export_state(&self, n_tokens: usize) -> Result<Vec<u8>, EngineError>;

    /// Replace the cache with `n_tokens` cells from `data`. Must leave the cache
    /// unchanged on error.
    fn import_state(&mut self, data: &[u8], n_tokens: usize) -> Result<(), EngineError>;

    fn stats(&self) -> EngineStats;
}

/// Process-wide engine entry point.
pub trait EngineBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Static metadata without allocating a context.
    fn model_info(&self, path: &Path) -> Result<ModelMetadata, EngineError>;

    /// Load a model and allocate its context. `progress` receives fractions in `[0, 1]`.
    fn load(
        &self,
        path: &Path,
        params: &EngineParams,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Box<dyn GenerationEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_type_parse() {
        assert_eq!("q8_0".parse::<CacheType>().unwrap(), CacheType::Q8_0);
        assert_eq!("F16".parse::<CacheType>().unwrap(), CacheType::F16);
        assert!("q3_k".parse::<CacheType>().is_err());
    }

    #[test]
    fn test_cache_type_tags_roundtrip() {
        for ty in [CacheType::F32, CacheType::F16, CacheType::Bf16, CacheType::Q8_0] {
            assert_eq!(CacheType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(CacheType::from_tag(99), None);
    }
}

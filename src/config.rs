//! Runtime configuration for ondevice-session.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! `SessionConfig` doubles as the per-session creation options accepted by the
//! manager and the HTTP API; every field has a default.

use std::path::{Component, Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::engine::probe;
use crate::engine::{AdapterSpec, CacheType, EngineParams, ModelMetadata, PoolingType};
use crate::error::SessionError;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "ondevice-session", about = "On-device LLM inference session server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Model to load into a session at startup.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Default options for new sessions.
    pub session: SessionConfig,

    /// Snapshot settings.
    pub snapshot: SnapshotConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8080").
    pub listen: String,

    /// Buffered generation events per streaming request.
    pub stream_buffer: usize,

    /// Time limit for non-streaming requests, in seconds.
    pub request_timeout_secs: u64,

    /// Browser origins allowed to call the API. Empty disables CORS.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            stream_buffer: 64,
            request_timeout_secs: 300,
            cors_origins: Vec::new(),
        }
    }
}

/// Snapshot file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Default token cap when a save request does not give one (0 = whole cache).
    pub max_tokens: usize,

    /// Directory HTTP snapshot paths are resolved under.
    pub dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            zstd_level: 3,
            max_tokens: 0,
            dir: PathBuf::from("snapshots"),
        }
    }
}

impl SnapshotConfig {
    /// Resolve a client-supplied snapshot name under `dir`. Absolute paths and
    /// anything but plain components (`..`, `.`, prefixes) are rejected.
    pub fn resolve(&self, requested: &Path) -> Result<PathBuf, SessionError> {
        let plain = requested
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if requested.as_os_str().is_empty() || !plain {
            return Err(SessionError::Configuration(format!(
                "snapshot path {} must be relative to the snapshot directory",
                requested.display()
            )));
        }
        Ok(self.dir.join(requested))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningFormat {
    #[default]
    None,
    Auto,
    Deepseek,
}

/// Immutable per-session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Context length in tokens.
    pub context_length: usize,

    /// Logical batch size for prompt evaluation.
    pub batch_size: usize,

    /// Physical (micro) batch size.
    pub micro_batch_size: usize,

    /// Worker threads (0 = one per logical CPU).
    pub thread_count: usize,

    /// Layers to offload to the GPU (-1 = all).
    pub gpu_offload_layers: i32,

    pub use_memory_lock: bool,
    pub use_memory_map: bool,

    /// Load only the vocabulary (tokenize/detokenize; no generation).
    pub vocabulary_only: bool,

    pub cache_type_k: CacheType,
    pub cache_type_v: CacheType,

    pub rope_freq_base: Option<f32>,
    pub rope_freq_scale: Option<f32>,

    pub pooling: PoolingType,

    /// Create the context in embedding mode.
    pub embedding: bool,

    /// Default L2 normalization for embeddings.
    pub normalize_embeddings: bool,

    /// Chat template (or format name such as `chatml`) used instead of the
    /// model's own. A per-request template still wins.
    pub chat_template_override: Option<String>,
    /// Split `<think>` blocks out of completions into `reasoning`.
    pub reasoning_format: ReasoningFormat,

    /// Adapters applied right after load.
    pub initial_adapters: Vec<AdapterSpec>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_length: 2048,
            batch_size: 512,
            micro_batch_size: 512,
            thread_count: 0,
            gpu_offload_layers: 0,
            use_memory_lock: false,
            use_memory_map: true,
            vocabulary_only: false,
            cache_type_k: CacheType::F16,
            cache_type_v: CacheType::F16,
            rope_freq_base: None,
            rope_freq_scale: None,
            pooling: PoolingType::None,
            embedding: false,
            normalize_embeddings: true,
            chat_template_override: None,
            reasoning_format: ReasoningFormat::None,
            initial_adapters: Vec::new(),
        }
    }
}

/// Smallest usable context (prompt truncation keeps a 4-token margin).
pub const MIN_CONTEXT_LENGTH: usize = 8;

impl SessionConfig {
    /// Static range checks.
    pub fn validate(&self) -> Result<(), SessionError> {
        let bad = |msg: String| Err(SessionError::Configuration(msg));

        if self.context_length < MIN_CONTEXT_LENGTH {
            return bad(format!(
                "context_length must be >= {MIN_CONTEXT_LENGTH}, got {}",
                self.context_length
            ));
        }
        if self.batch_size == 0 || self.batch_size > self.context_length {
            return bad(format!(
                "batch_size must be in 1..={}, got {}",
                self.context_length, self.batch_size
            ));
        }
        if self.micro_batch_size == 0 || self.micro_batch_size > self.batch_size {
            return bad(format!(
                "micro_batch_size must be in 1..={}, got {}",
                self.batch_size, self.micro_batch_size
            ));
        }
        if self.gpu_offload_layers < -1 {
            return bad(format!(
                "gpu_offload_layers must be >= -1, got {}",
                self.gpu_offload_layers
            ));
        }
        for (name, value) in [
            ("rope_freq_base", self.rope_freq_base),
            ("rope_freq_scale", self.rope_freq_scale),
        ] {
            if let Some(v) = value {
                if !(v > 0.0 && v.is_finite()) {
                    return bad(format!("{name} must be > 0, got {v}"));
                }
            }
        }
        if self.vocabulary_only && self.embedding {
            return bad("vocabulary_only sessions cannot compute embeddings".to_string());
        }
        for adapter in &self.initial_adapters {
            if !adapter.scale.is_finite() {
                return bad(format!("adapter scale for {} is not finite", adapter.path.display()));
            }
        }
        Ok(())
    }

    /// Checks that depend on the model.
    pub fn validate_against(&self, meta: &ModelMetadata) -> Result<(), SessionError> {
        let max_ctx = match self.rope_freq_scale {
            Some(scale) if scale < 1.0 => (meta.n_ctx_train as f64 / scale as f64) as usize,
            _ => meta.n_ctx_train,
        };
        if self.context_length > max_ctx {
            return Err(SessionError::Configuration(format!(
                "context_length {} exceeds the model's limit of {max_ctx}",
                self.context_length
            )));
        }
        Ok(())
    }

    /// Threads to actually use.
    pub fn effective_threads(&self) -> usize {
        if self.thread_count == 0 {
            probe::capabilities().logical_cpus
        } else {
            self.thread_count
        }
    }

    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            n_ctx: self.context_length,
            n_batch: self.batch_size,
            n_ubatch: self.micro_batch_size,
            n_threads: self.effective_threads(),
            n_gpu_layers: self.gpu_offload_layers,
            use_mmap: self.use_memory_map,
            use_mlock: self.use_memory_lock,
            vocab_only: self.vocabulary_only,
            cache_type_k: self.cache_type_k,
            cache_type_v: self.cache_type_v,
            rope_freq_base: self.rope_freq_base,
            rope_freq_scale: self.rope_freq_scale,
            pooling: self.pooling,
            embedding: self.embedding,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.session.validate()?;
        if !(1..=22).contains(&config.snapshot.zstd_level) {
            anyhow::bail!("snapshot.zstd_level must be in 1..=22");
        }
        Ok(config)
    }
}

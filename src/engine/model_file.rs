//! Model file container and metadata.
//!
//! The reference engine reads a minimal GGUF-flavoured container:
//! `b"GGUF"`, a u32 version, a u64 header length, a JSON [`ModelSpec`] header,
//! then opaque tensor bytes. Only the header is parsed here; everything the
//! session layer needs is surfaced as [`ModelMetadata`].

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::interface::{EngineError, PoolingType};

pub const MODEL_MAGIC: &[u8; 4] = b"GGUF";
pub const MODEL_VERSION: u32 = 3;

/// Header limit; anything larger is treated as corruption.
const MAX_HEADER_LEN: u64 = 1 << 20;

/// Reference vocabulary: 256 byte tokens plus BOS and EOS.
pub const REFERENCE_N_VOCAB: usize = 258;

/// Header of a reference model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Architecture name (e.g. "llama", "qwen2").
    pub architecture: String,

    /// Human-readable model name.
    pub name: String,

    /// Parameter count.
    pub n_params: u64,

    /// Hidden size.
    pub n_embd: usize,

    /// Number of layers (drives load progress granularity).
    pub n_layer: usize,

    /// Context length the model was trained with.
    pub n_ctx_train: usize,

    /// Built-in chat template, if any.
    #[serde(default)]
    pub chat_template: Option<String>,

    /// Whether the model ships a tool-use template variant.
    #[serde(default)]
    pub tool_use_template: bool,

    /// Pooling the model was trained with for embeddings.
    #[serde(default)]
    pub pooling: Option<PoolingType>,

    /// Weight seed; different seeds give different (deterministic) models.
    #[serde(default)]
    pub seed: u64,

    /// Continuation the model strongly prefers; used to make outputs predictable.
    #[serde(default)]
    pub script: Option<String>,

    /// Size of the tensor section written after the header.
    #[serde(default)]
    pub tensor_bytes: usize,

    /// Simulated resource exhaustion: decode fails once this many tokens were evaluated.
    #[serde(default)]
    pub fail_after_tokens: Option<u64>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            architecture: "llama".to_string(),
            name: "reference-tiny".to_string(),
            n_params: 1_000_000,
            n_embd: 16,
            n_layer: 4,
            n_ctx_train: 4096,
            chat_template: None,
            tool_use_template: false,
            pooling: None,
            seed: 0,
            script: None,
            tensor_bytes: 1024,
            fail_after_tokens: None,
        }
    }
}

/// Chat-template capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTemplateCaps {
    pub has_default: bool,
    pub has_tool_use: bool,
}

/// Static model information, computed once at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model architecture name (e.g., "llama", "qwen2").
    pub architecture: String,

    /// Description string ("<name> <arch> <params>").
    pub description: String,

    /// Parameter count.
    pub n_params: u64,

    /// Embedding dimensionality.
    pub n_embd: usize,

    /// Vocabulary size.
    pub n_vocab: usize,

    /// Number of transformer layers.
    pub n_layer: usize,

    /// Context length the model was trained with.
    pub n_ctx_train: usize,

    /// File size in bytes.
    pub file_size: u64,

    /// Chat-template capabilities.
    pub chat_templates: ChatTemplateCaps,

    /// The model's own chat template, if it ships one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
}

impl ModelMetadata {
    /// Stable identity of the weights, stored in snapshots.
    pub fn fingerprint(&self) -> u64 {
        // FNV-1a; must not change between builds.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut feed = |bytes: &[u8]| {
            for &b in bytes {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        };
        feed(self.architecture.as_bytes());
        feed(&self.n_params.to_le_bytes());
        feed(&(self.n_embd as u64).to_le_bytes());
        feed(&(self.n_vocab as u64).to_le_bytes());
        feed(&(self.n_layer as u64).to_le_bytes());
        hash
    }

    /// Approximate cache size in bytes per token, given the per-element width.
    pub fn cache_bytes_per_token(&self, bytes_per_element: f64) -> usize {
        (2.0 * self.n_embd as f64 * self.n_layer as f64 * bytes_per_element) as usize
    }
}

impl ModelSpec {
    pub fn metadata(&self, file_size: u64) -> ModelMetadata {
        ModelMetadata {
            architecture: self.architecture.clone(),
            description: format!(
                "{} {} {:.1}M",
                self.name,
                self.architecture,
                self.n_params as f64 / 1e6
            ),
            n_params: self.n_params,
            n_embd: self.n_embd,
            n_vocab: REFERENCE_N_VOCAB,
            n_layer: self.n_layer,
            n_ctx_train: self.n_ctx_train,
            file_size,
            chat_templates: ChatTemplateCaps {
                has_default: self.chat_template.is_some(),
                has_tool_use: self.tool_use_template,
            },
            chat_template: self.chat_template.clone(),
        }
    }
}

/// Write a reference model file.
pub fn write_model_file(path: &Path, spec: &ModelSpec) -> Result<(), EngineError> {
    let header = serde_json::to_vec(spec).map_err(|e| EngineError::InvalidModel {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut file = File::create(path)?;
    file.write_all(MODEL_MAGIC)?;
    file.write_all(&MODEL_VERSION.to_le_bytes())?;
    file.write_all(&(header.len() as u64).to_le_bytes())?;
    file.write_all(&header)?;
    // Deterministic filler standing in for tensor data.
    let tensors: Vec<u8> = (0..spec.tensor_bytes)
        .map(|i| (i as u64 ^ spec.seed) as u8)
        .collect();
    file.write_all(&tensors)?;
    file.flush()?;
    Ok(())
}

/// Read and validate the header of a model file.
pub fn read_model_spec(path: &Path) -> Result<(ModelSpec, u64), EngineError> {
    if !path.exists() {
        return Err(EngineError::ModelNotFound(path.to_path_buf()));
    }

    let invalid = |reason: String| EngineError::InvalidModel {
        path: path.to_path_buf(),
        reason,
    };

    let file_size = std::fs::metadata(path)?.len();
    let mut file = File::open(path)?;

    let mut prefix = [0u8; 16];
    file.read_exact(&mut prefix)
        .map_err(|_| invalid("file too short".to_string()))?;

    if &prefix[0..4] != MODEL_MAGIC {
        return Err(invalid("bad magic".to_string()));
    }
    let version = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
    if version != MODEL_VERSION {
        return Err(invalid(format!("unsupported version {version}")));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&prefix[8..16]);
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len == 0 || header_len > MAX_HEADER_LEN || 16 + header_len > file_size {
        return Err(invalid(format!("bad header length {header_len}")));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let spec: ModelSpec =
        serde_json::from_slice(&header).map_err(|e| invalid(format!("bad header: {e}")))?;

    if spec.n_embd == 0 || spec.n_layer == 0 || spec.n_ctx_train == 0 {
        return Err(invalid("zero-sized dimension in header".to_string()));
    }

    Ok((spec, file_size))
}

/// Load model metadata from a model file.
pub fn load_metadata(path: &Path) -> Result<ModelMetadata, EngineError> {
    let (spec, file_size) = read_model_spec(path)?;
    let metadata = spec.metadata(file_size);

    info!(
        arch = metadata.architecture,
        layers = metadata.n_layer,
        n_embd = metadata.n_embd,
        n_ctx_train = metadata.n_ctx_train,
        "Loaded model metadata"
    );

    Ok(metadata)
}

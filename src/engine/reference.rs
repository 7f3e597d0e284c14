//! Deterministic reference engine.
//!
//! Implements the engine capability without native kernels so the session layer can
//! be exercised end to end:
//! - byte-level vocabulary (256 byte tokens + BOS + EOS)
//! - a recurrent cache: each cell stores a key/value hidden state encoded in the
//!   configured cache type, so truncation, shifting and state export behave like a
//!   real KV cache
//! - logits derived from the last cell, adapter biases and an optional scripted
//!   continuation from the model header
//!
//! Outputs depend only on the cache contents, which makes snapshot round trips and
//! prefix reuse observable.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use half::{bf16, f16};
use tracing::{debug, info};

use crate::engine::interface::{
    AdapterSpec, CacheType, EngineBackend, EngineError, EngineParams, EngineStats,
    GenerationEngine, PoolingType, TokenId, Vocabulary,
};
use crate::engine::model_file::{read_model_spec, ModelMetadata, ModelSpec, REFERENCE_N_VOCAB};

pub const BOS: TokenId = 256;
pub const EOS: TokenId = 257;

/// Magic prefix of reference adapter files.
pub const ADAPTER_MAGIC: &[u8; 4] = b"LORA";

/// Upper bound on cells the reference engine will allocate.
const MAX_CELLS: usize = 1 << 20;

const Q8_BLOCK: usize = 32;

/// Byte-level vocabulary.
#[derive(Debug, Default)]
pub struct ReferenceVocab;

impl Vocabulary for ReferenceVocab {
    fn n_vocab(&self) -> usize {
        REFERENCE_N_VOCAB
    }

    fn bos(&self) -> Option<TokenId> {
        Some(BOS)
    }

    fn eos(&self) -> TokenId {
        EOS
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Vec<TokenId> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(TokenId::from));
        tokens
    }

    fn piece(&self, token: TokenId) -> Vec<u8> {
        match token {
            0..=255 => vec![token as u8],
            _ => Vec::new(),
        }
    }
}

/// Backend producing [`ReferenceEngine`] instances.
#[derive(Debug, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl EngineBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn model_info(&self, path: &Path) -> Result<ModelMetadata, EngineError> {
        crate::engine::model_file::load_metadata(path)
    }

    fn load(
        &self,
        path: &Path,
        params: &EngineParams,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Box<dyn GenerationEngine>, EngineError> {
        let (spec, file_size) = read_model_spec(path)?;
        progress(0.0);

        if params.n_ctx > MAX_CELLS {
            return Err(EngineError::OutOfMemory(format!(
                "cannot allocate {} cache cells",
                params.n_ctx
            )));
        }

        // "Load" one layer at a time.
        for layer in 0..spec.n_layer {
            progress((layer + 1) as f32 / spec.n_layer as f32);
        }

        let engine = ReferenceEngine::new(spec, file_size, params.clone());
        info!(
            model = %path.display(),
            n_ctx = params.n_ctx,
            cache_k = %params.cache_type_k,
            cache_v = %params.cache_type_v,
            "Reference engine context created"
        );
        Ok(Box::new(engine))
    }
}

/// One cache cell: the token and its encoded key/value states.
#[derive(Debug, Clone)]
struct Cell {
    token: TokenId,
    k: Vec<u8>,
    v: Vec<u8>,
}

/// A loaded reference model with its cache.
pub struct ReferenceEngine {
    spec: ModelSpec,
    metadata: ModelMetadata,
    params: EngineParams,
    vocab: Arc<ReferenceVocab>,
    token_vectors: Vec<Vec<f32>>,
    script: Option<Vec<TokenId>>,
    cells: Vec<Cell>,
    logits: Vec<f32>,
    adapter_bias: Vec<f32>,
    stats: EngineStats,
}

impl ReferenceEngine {
    pub fn new(spec: ModelSpec, file_size: u64, params: EngineParams) -> Self {
        let metadata = spec.metadata(file_size);
        let token_vectors = (0..REFERENCE_N_VOCAB)
            .map(|t| token_vector(spec.seed, t as TokenId, spec.n_embd))
            .collect();
        let script = spec
            .script
            .as_ref()
            .map(|s| s.bytes().map(TokenId::from).collect());

        Self {
            spec,
            metadata,
            params,
            vocab: Arc::new(ReferenceVocab),
            token_vectors,
            script,
            cells: Vec::new(),
            logits: vec![0.0; REFERENCE_N_VOCAB],
            adapter_bias: vec![0.0; REFERENCE_N_VOCAB],
            stats: EngineStats::default(),
        }
    }

    fn n_embd(&self) -> usize {
        self.spec.n_embd
    }

    /// Compute the next cell from the previous one.
    fn step(&self, prev: Option<&Cell>, token: TokenId) -> Cell {
        let n_embd = self.n_embd();
        let e = &self.token_vectors[token as usize];
        let prev_k = prev
            .map(|c| decode_values(self.params.cache_type_k, &c.k, n_embd))
            .unwrap_or_else(|| vec![0.0; n_embd]);

        let k: Vec<f32> = prev_k
            .iter()
            .zip(e)
            .map(|(h, x)| (0.6 * h + x).tanh())
            .collect();
        let v: Vec<f32> = e.iter().map(|x| 0.5 * x).collect();

        Cell {
            token,
            k: encode_values(self.params.cache_type_k, &k),
            v: encode_values(self.params.cache_type_v, &v),
        }
    }

    fn refresh_logits(&mut self) {
        let n_embd = self.n_embd();
        let Some(last) = self.cells.last() else {
            self.logits.iter_mut().for_each(|l| *l = 0.0);
            return;
        };
        let k = decode_values(self.params.cache_type_k, &last.k, n_embd);
        let v = decode_values(self.params.cache_type_v, &last.v, n_embd);
        let norm = (n_embd as f32).sqrt();

        for (j, logit) in self.logits.iter_mut().enumerate() {
            let e = &self.token_vectors[j];
            let dk: f32 = k.iter().zip(e).map(|(a, b)| a * b).sum();
            let dv: f32 = v.iter().zip(e).map(|(a, b)| a * b).sum();
            *logit = 3.0 * (2.0 * dk + dv) / norm + self.adapter_bias[j];
        }

        if let Some(next) = self.scripted_next() {
            self.logits[next as usize] += 1000.0;
        }
    }

    /// Next scripted token given the longest script prefix ending the cache.
    fn scripted_next(&self) -> Option<TokenId> {
        let script = self.script.as_ref()?;
        let max = script.len().min(self.cells.len());
        let matched = (1..=max)
            .rev()
            .find(|&len| {
                let tail = &self.cells[self.cells.len() - len..];
                tail.iter().map(|c| c.token).eq(script[..len].iter().copied())
            })
            .unwrap_or(0);
        Some(script.get(matched).copied().unwrap_or(EOS))
    }

    fn check_token(&self, token: TokenId) -> Result<(), EngineError> {
        if token < 0 || token as usize >= REFERENCE_N_VOCAB {
            return Err(EngineError::DecodeFailed(format!("invalid token {token}")));
        }
        Ok(())
    }
}

impl GenerationEngine for ReferenceEngine {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn vocab(&self) -> Arc<dyn Vocabulary> {
        self.vocab.clone()
    }

    fn n_ctx(&self) -> usize {
        self.params.n_ctx
    }

    fn cache_len(&self) -> usize {
        self.cells.len()
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), EngineError> {
        if self.params.vocab_only {
            return Err(EngineError::VocabOnly);
        }
        if tokens.is_empty() {
            return Err(EngineError::DecodeFailed("empty batch".to_string()));
        }
        if tokens.len() > self.params.n_batch {
            return Err(EngineError::DecodeFailed(format!(
                "batch of {} exceeds n_batch {}",
                tokens.len(),
                self.params.n_batch
            )));
        }
        if self.cells.len() + tokens.len() > self.params.n_ctx {
            return Err(EngineError::ContextFull {
                n_ctx: self.params.n_ctx,
            });
        }
        for &t in tokens {
            self.check_token(t)?;
        }
        if let Some(limit) = self.spec.fail_after_tokens {
            if self.stats.tokens_decoded + tokens.len() as u64 > limit {
                return Err(EngineError::OutOfMemory(format!(
                    "cache growth failed after {} tokens",
                    self.stats.tokens_decoded
                )));
            }
        }

        for &t in tokens {
            let cell = self.step(self.cells.last(), t);
            self.cells.push(cell);
        }
        self.refresh_logits();

        self.stats.decode_calls += 1;
        self.stats.tokens_decoded += tokens.len() as u64;
        debug!(n_tokens = tokens.len(), cache_len = self.cells.len(), "decode");
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn cache_truncate(&mut self, len: usize) {
        if len < self.cells.len() {
            self.cells.truncate(len);
            self.refresh_logits();
        }
    }

    fn cache_discard(&mut self, start: usize, count: usize) {
        let start = start.min(self.cells.len());
        let end = (start + count).min(self.cells.len());
        self.cells.drain(start..end);
    }

    fn embed(&mut self, tokens: &[TokenId], pooling: PoolingType) -> Result<Vec<f32>, EngineError> {
        if !self.params.embedding {
            return Err(EngineError::EmbeddingsDisabled);
        }
        if tokens.is_empty() {
            return Err(EngineError::DecodeFailed("empty input".to_string()));
        }
        for &t in tokens {
            self.check_token(t)?;
        }

        let n_embd = self.n_embd();
        let mut h = vec![0.0f32; n_embd];
        let mut states = Vec::with_capacity(tokens.len());
        for &t in tokens {
            let e = &self.token_vectors[t as usize];
            h = h.iter().zip(e).map(|(p, x)| (0.6 * p + x).tanh()).collect();
            states.push(h.clone());
        }

        let pooled = match pooling {
            PoolingType::None | PoolingType::Last => states[states.len() - 1].clone(),
            PoolingType::Cls => states[0].clone(),
            PoolingType::Mean => {
                let mut mean = vec![0.0f32; n_embd];
                for s in &states {
                    for (m, x) in mean.iter_mut().zip(s) {
                        *m += x;
                    }
                }
                let n = states.len() as f32;
                mean.iter_mut().for_each(|m| *m /= n);
                mean
            }
        };

        self.stats.embed_calls += 1;
        Ok(pooled)
    }

    fn set_adapters(&mut self, adapters: &[AdapterSpec]) -> Result<(), EngineError> {
        let mut bias = vec![0.0f32; REFERENCE_N_VOCAB];
        for adapter in adapters {
            let data = fs::read(&adapter.path).map_err(|e| EngineError::AdapterLoad {
                path: adapter.path.clone(),
                reason: e.to_string(),
            })?;
            if data.len() < ADAPTER_MAGIC.len() || &data[..4] != ADAPTER_MAGIC {
                return Err(EngineError::AdapterLoad {
                    path: adapter.path.clone(),
                    reason: "not a LoRA adapter".to_string(),
                });
            }
            let seed = data[4..]
                .iter()
                .fold(0x9e37_79b9_7f4a_7c15u64, |acc, &b| splitmix64(acc ^ b as u64));
            for (j, b) in bias.iter_mut().enumerate() {
                *b += adapter.scale * 2.0 * unit_float(splitmix64(seed ^ j as u64));
            }
        }
        self.adapter_bias = bias;
        self.refresh_logits();
        Ok(())
    }

    fn export_state(&self, n_tokens: usize) -> Result<Vec<u8>, EngineError> {
        if n_tokens > self.cells.len() {
            return Err(EngineError::StateMismatch(format!(
                "requested {n_tokens} cells, cache holds {}",
                self.cells.len()
            )));
        }
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.n_embd() as u32);
        buf.put_u32_le(self.params.cache_type_k.tag());
        buf.put_u32_le(self.params.cache_type_v.tag());
        buf.put_u32_le(n_tokens as u32);
        for cell in &self.cells[..n_tokens] {
            buf.put_i32_le(cell.token);
            buf.put_u32_le(cell.k.len() as u32);
            buf.put_slice(&cell.k);
            buf.put_u32_le(cell.v.len() as u32);
            buf.put_slice(&cell.v);
        }
        Ok(buf.to_vec())
    }

    fn import_state(&mut self, data: &[u8], n_tokens: usize) -> Result<(), EngineError> {
        let mut buf = data;
        let n_embd = take_u32(&mut buf)? as usize;
        let k_tag = take_u32(&mut buf)?;
        let v_tag = take_u32(&mut buf)?;
        let count = take_u32(&mut buf)? as usize;

        if n_embd != self.n_embd() {
            return Err(EngineError::StateMismatch(format!(
                "state n_embd {n_embd} != model n_embd {}",
                self.n_embd()
            )));
        }
        if k_tag != self.params.cache_type_k.tag() || v_tag != self.params.cache_type_v.tag() {
            return Err(EngineError::StateMismatch("cache type mismatch".to_string()));
        }
        if count != n_tokens {
            return Err(EngineError::StateMismatch(format!(
                "state holds {count} cells, expected {n_tokens}"
            )));
        }
        if count > self.params.n_ctx {
            return Err(EngineError::ContextFull {
                n_ctx: self.params.n_ctx,
            });
        }

        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            let token = take_u32(&mut buf)? as TokenId;
            self.check_token(token)?;
            let k = take_bytes(&mut buf)?;
            let v = take_bytes(&mut buf)?;
            cells.push(Cell { token, k, v });
        }
        if buf.has_remaining() {
            return Err(EngineError::StateMismatch("trailing bytes in state".to_string()));
        }

        self.cells = cells;
        self.refresh_logits();
        Ok(())
    }

    fn stats(&self) -> EngineStats {
        self.stats
    }
}

/// Write a reference adapter file. The payload seeds its logit bias.
pub fn write_adapter_file(path: &Path, payload: &[u8]) -> Result<(), EngineError> {
    let mut data = Vec::with_capacity(ADAPTER_MAGIC.len() + payload.len());
    data.extend_from_slice(ADAPTER_MAGIC);
    data.extend_from_slice(payload);
    fs::write(path, data)?;
    Ok(())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, EngineError> {
    if buf.remaining() < 4 {
        return Err(EngineError::StateMismatch("truncated state".to_string()));
    }
    Ok(buf.get_u32_le())
}

fn take_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, EngineError> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(EngineError::StateMismatch("truncated state".to_string()));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

/// Encode values in the cache's numeric type.
pub fn encode_values(ty: CacheType, values: &[f32]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity((values.len() as f64 * ty.bytes_per_element()) as usize + 2);
    match ty {
        CacheType::F32 => values.iter().for_each(|v| buf.put_f32_le(*v)),
        CacheType::F16 => values
            .iter()
            .for_each(|v| buf.put_u16_le(f16::from_f32(*v).to_bits())),
        CacheType::Bf16 => values
            .iter()
            .for_each(|v| buf.put_u16_le(bf16::from_f32(*v).to_bits())),
        CacheType::Q8_0 => {
            for block in values.chunks(Q8_BLOCK) {
                let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
                let d = amax / 127.0;
                let id = if d != 0.0 { 1.0 / d } else { 0.0 };
                buf.put_u16_le(f16::from_f32(d).to_bits());
                for v in block {
                    buf.put_i8((v * id).round().clamp(-127.0, 127.0) as i8);
                }
            }
        }
    }
    buf.to_vec()
}

/// Decode `n` values previously written by [`encode_values`].
pub fn decode_values(ty: CacheType, bytes: &[u8], n: usize) -> Vec<f32> {
    let mut buf = bytes;
    let mut out = Vec::with_capacity(n);
    match ty {
        CacheType::F32 => {
            while out.len() < n && buf.remaining() >= 4 {
                out.push(buf.get_f32_le());
            }
        }
        CacheType::F16 => {
            while out.len() < n && buf.remaining() >= 2 {
                out.push(f16::from_bits(buf.get_u16_le()).to_f32());
            }
        }
        CacheType::Bf16 => {
            while out.len() < n && buf.remaining() >= 2 {
                out.push(bf16::from_bits(buf.get_u16_le()).to_f32());
            }
        }
        CacheType::Q8_0 => {
            while out.len() < n && buf.remaining() >= 2 {
                let d = f16::from_bits(buf.get_u16_le()).to_f32();
                let in_block = Q8_BLOCK.min(n - out.len()).min(buf.remaining());
                for _ in 0..in_block {
                    out.push(d * buf.get_i8() as f32);
                }
            }
        }
    }
    out.resize(n, 0.0);
    out
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Map a hash to `[-1, 1)`.
fn unit_float(x: u64) -> f32 {
    ((x >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

fn token_vector(seed: u64, token: TokenId, n_embd: usize) -> Vec<f32> {
    let base = splitmix64(seed ^ ((token as u64) << 32));
    (0..n_embd)
        .map(|i| unit_float(splitmix64(base ^ i as u64)))
        .collect()
}

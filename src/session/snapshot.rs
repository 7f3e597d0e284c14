//! Cache snapshot files.
//!
//! Layout: a 64-byte little-endian [`SnapshotHeader`] followed by a zstd frame.
//! The frame holds `token_count` u32 token ids, then `state_len` bytes of engine
//! state. The header carries the configuration signature a restoring session
//! must match.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::engine::{CacheType, TokenId};

pub const SNAPSHOT_MAGIC: [u8; 8] = *b"ODSSNAP\0";
pub const SNAPSHOT_VERSION: u32 = 1;
pub const HEADER_LEN: usize = std::mem::size_of::<SnapshotHeader>();
/// Largest decompressed payload a snapshot may describe.
pub const MAX_PAYLOAD_LEN: u64 = 16 << 30;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a session snapshot (bad magic)")]
    BadMagic,

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("Snapshot truncated")]
    Truncated,

    #[error("Corrupt snapshot payload: {0}")]
    Corrupt(String),

    #[error("Snapshot incompatible with session: {0}")]
    Mismatch(String),
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SnapshotHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: u32,
    pub context_length: u32,
    pub n_embd: u32,
    pub n_vocab: u32,
    pub cache_type_k: u32,
    pub cache_type_v: u32,
    pub token_count: u32,
    pub model_fingerprint: u64,
    pub state_len: u64,
    pub payload_len: u64,
}

impl SnapshotHeader {
    /// Byte-swap every integer field between host and little-endian order.
    fn swap_le(mut self) -> Self {
        self.version = self.version.to_le();
        self.flags = self.flags.to_le();
        self.context_length = self.context_length.to_le();
        self.n_embd = self.n_embd.to_le();
        self.n_vocab = self.n_vocab.to_le();
        self.cache_type_k = self.cache_type_k.to_le();
        self.cache_type_v = self.cache_type_v.to_le();
        self.token_count = self.token_count.to_le();
        self.model_fingerprint = self.model_fingerprint.to_le();
        self.state_len = self.state_len.to_le();
        self.payload_len = self.payload_len.to_le();
        self
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let le = self.swap_le();
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(bytemuck::bytes_of(&le));
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::Truncated);
        }
        let header: SnapshotHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        if header.magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        // to_le is its own inverse
        let header = header.swap_le();
        if header.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(header.version));
        }
        Ok(header)
    }

    pub fn signature(&self) -> Result<SnapshotSignature, SnapshotError> {
        let cache_type = |tag: u32| {
            CacheType::from_tag(tag)
                .ok_or_else(|| SnapshotError::Corrupt(format!("unknown cache type tag {tag}")))
        };
        Ok(SnapshotSignature {
            context_length: self.context_length as usize,
            n_embd: self.n_embd as usize,
            n_vocab: self.n_vocab as usize,
            cache_type_k: cache_type(self.cache_type_k)?,
            cache_type_v: cache_type(self.cache_type_v)?,
            model_fingerprint: self.model_fingerprint,
        })
    }
}

/// Configuration a snapshot is only valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSignature {
    pub context_length: usize,
    pub n_embd: usize,
    pub n_vocab: usize,
    pub cache_type_k: CacheType,
    pub cache_type_v: CacheType,
    pub model_fingerprint: u64,
}

impl SnapshotSignature {
    /// Describe the first difference, if any.
    pub fn check(&self, expected: &SnapshotSignature) -> Result<(), SnapshotError> {
        let mismatch = |what: &str, got: String, want: String| {
            Err(SnapshotError::Mismatch(format!("{what} is {got}, session has {want}")))
        };
        if self.model_fingerprint != expected.model_fingerprint {
            return mismatch(
                "model fingerprint",
                format!("{:016x}", self.model_fingerprint),
                format!("{:016x}", expected.model_fingerprint),
            );
        }
        if self.context_length != expected.context_length {
            return mismatch(
                "context length",
                self.context_length.to_string(),
                expected.context_length.to_string(),
            );
        }
        if self.n_embd != expected.n_embd {
            return mismatch("n_embd", self.n_embd.to_string(), expected.n_embd.to_string());
        }
        if self.n_vocab != expected.n_vocab {
            return mismatch("n_vocab", self.n_vocab.to_string(), expected.n_vocab.to_string());
        }
        if self.cache_type_k != expected.cache_type_k || self.cache_type_v != expected.cache_type_v {
            return mismatch(
                "cache type",
                format!("{}/{}", self.cache_type_k, self.cache_type_v),
                format!("{}/{}", expected.cache_type_k, expected.cache_type_v),
            );
        }
        Ok(())
    }
}

/// Decoded snapshot contents.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub tokens: Vec<TokenId>,
    pub state: Vec<u8>,
}

/// Write a snapshot atomically (temp file + rename). Returns bytes written.
pub fn write_snapshot(
    path: &Path,
    signature: &SnapshotSignature,
    tokens: &[TokenId],
    state: &[u8],
    zstd_level: i32,
) -> Result<u64, SnapshotError> {
    let mut payload = BytesMut::with_capacity(tokens.len() * 4 + state.len());
    for &t in tokens {
        payload.put_u32_le(t as u32);
    }
    payload.put_slice(state);
    let compressed = compress(&payload, zstd_level)?;

    let header = SnapshotHeader {
        magic: SNAPSHOT_MAGIC,
        version: SNAPSHOT_VERSION,
        flags: 0,
        context_length: signature.context_length as u32,
        n_embd: signature.n_embd as u32,
        n_vocab: signature.n_vocab as u32,
        cache_type_k: signature.cache_type_k.tag(),
        cache_type_v: signature.cache_type_v.tag(),
        token_count: tokens.len() as u32,
        model_fingerprint: signature.model_fingerprint,
        state_len: state.len() as u64,
        payload_len: compressed.len() as u64,
    };

    let mut file = Vec::with_capacity(HEADER_LEN + compressed.len());
    file.extend_from_slice(&header.to_bytes());
    file.extend_from_slice(&compressed);

    let tmp = temp_path(path);
    fs::write(&tmp, &file)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    debug!(
        path = %path.display(),
        tokens = tokens.len(),
        raw = payload.len(),
        compressed = compressed.len(),
        "Wrote snapshot"
    );
    Ok(file.len() as u64)
}

/// Read the header only.
pub fn read_header(path: &Path) -> Result<SnapshotHeader, SnapshotError> {
    use std::io::Read;
    let mut buf = [0u8; HEADER_LEN];
    let mut file = fs::File::open(path)?;
    file.read_exact(&mut buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => SnapshotError::Truncated,
        _ => SnapshotError::Io(e),
    })?;
    SnapshotHeader::from_bytes(&buf)
}

/// Read and validate a snapshot against the session's signature.
pub fn read_snapshot(path: &Path, expected: &SnapshotSignature) -> Result<SnapshotData, SnapshotError> {
    let bytes = fs::read(path)?;
    let header = SnapshotHeader::from_bytes(&bytes)?;
    header.signature()?.check(expected)?;

    let body = &bytes[HEADER_LEN..];
    if body.len() as u64 != header.payload_len {
        return Err(SnapshotError::Truncated);
    }
    if header.token_count as usize > expected.context_length {
        return Err(SnapshotError::Mismatch(format!(
            "{} tokens exceed context length {}",
            header.token_count, expected.context_length
        )));
    }

    let described = u64::from(header.token_count)
        .checked_mul(4)
        .and_then(|t| t.checked_add(header.state_len))
        .filter(|&n| n <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| {
            SnapshotError::Corrupt(format!("implausible state length {}", header.state_len))
        })?;
    let payload = decompress(body, described)?;
    if payload.len() as u64 != described {
        return Err(SnapshotError::Corrupt(format!(
            "payload is {} bytes, header describes {described}",
            payload.len()
        )));
    }
    let token_bytes = header.token_count as usize * 4;

    let mut buf = &payload[..token_bytes];
    let mut tokens = Vec::with_capacity(header.token_count as usize);
    while buf.has_remaining() {
        let t = buf.get_u32_le() as TokenId;
        if t < 0 || t as usize >= expected.n_vocab {
            return Err(SnapshotError::Corrupt(format!("token {t} out of vocabulary")));
        }
        tokens.push(t);
    }
    let state = payload[token_bytes..].to_vec();

    debug!(path = %path.display(), tokens = tokens.len(), "Read snapshot");
    Ok(SnapshotData { tokens, state })
}

/// zstd frame with a content checksum, so bit flips fail the decode.
fn compress(payload: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::with_capacity(payload.len() / 2), level)?;
    encoder.include_checksum(true)?;
    encoder.write_all(payload)?;
    encoder.finish()
}

/// Decode at most `limit + 1` bytes, so an oversized frame is caught without
/// inflating all of it.
fn decompress(body: &[u8], limit: u64) -> Result<Vec<u8>, SnapshotError> {
    let corrupt = |e: std::io::Error| SnapshotError::Corrupt(e.to_string());
    let decoder = zstd::Decoder::with_buffer(body).map_err(corrupt)?;
    let mut payload = Vec::new();
    decoder
        .take(limit.saturating_add(1))
        .read_to_end(&mut payload)
        .map_err(corrupt)?;
    Ok(payload)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sig() -> SnapshotSignature {
        SnapshotSignature {
            context_length: 512,
            n_embd: 16,
            n_vocab: 258,
            cache_type_k: CacheType::F16,
            cache_type_v: CacheType::Q8_0,
            model_fingerprint: 0xdead_beef,
        }
    }

    #[test]
    fn test_header_is_64_bytes() {
        assert_eq!(HEADER_LEN, 64);
    }

    #[test]
    fn test_write_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s.bin");
        let state = vec![7u8; 300];
        write_snapshot(&path, &sig(), &[256, 1, 2, 3], &state, 3).unwrap();

        let data = read_snapshot(&path, &sig()).unwrap();
        assert_eq!(data.tokens, vec![256, 1, 2, 3]);
        assert_eq!(data.state, state);

        let header = read_header(&path).unwrap();
        assert_eq!(header.token_count, 4);
        assert_eq!(header.signature().unwrap(), sig());
        assert!(!tmp.path().join("s.bin.tmp").exists());
    }

    #[test]
    fn test_signature_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s.bin");
        write_snapshot(&path, &sig(), &[1], &[], 3).unwrap();

        let other = SnapshotSignature {
            context_length: 1024,
            ..sig()
        };
        let err = read_snapshot(&path, &other).unwrap_err();
        assert!(matches!(err, SnapshotError::Mismatch(ref m) if m.contains("context length")));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("junk.bin");
        fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(matches!(read_snapshot(&path, &sig()), Err(SnapshotError::BadMagic)));

        fs::write(&path, b"short").unwrap();
        assert!(matches!(read_snapshot(&path, &sig()), Err(SnapshotError::Truncated)));

        let good = tmp.path().join("good.bin");
        write_snapshot(&good, &sig(), &[1, 2], &[9; 50], 3).unwrap();
        let mut bytes = fs::read(&good).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&good, bytes).unwrap();
        assert!(matches!(read_snapshot(&good, &sig()), Err(SnapshotError::Truncated)));
    }

    #[test]
    fn test_corrupt_payload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s.bin");
        write_snapshot(&path, &sig(), &[1, 2], &[9; 50], 3).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        for b in &mut bytes[HEADER_LEN..] {
            *b ^= 0x5a;
        }
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read_snapshot(&path, &sig()), Err(SnapshotError::Corrupt(_))));
    }

    #[test]
    fn test_tampered_state_len() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s.bin");
        write_snapshot(&path, &sig(), &[1, 2], &[9; 50], 3).unwrap();
        let original = fs::read(&path).unwrap();

        for state_len in [u64::MAX, MAX_PAYLOAD_LEN, 51, 49] {
            let mut bytes = original.clone();
            bytes[48..56].copy_from_slice(&state_len.to_le_bytes());
            fs::write(&path, bytes).unwrap();
            assert!(
                matches!(read_snapshot(&path, &sig()), Err(SnapshotError::Corrupt(_))),
                "state_len {state_len}"
            );
        }
    }
}

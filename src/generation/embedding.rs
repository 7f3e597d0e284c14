//! Embedding extraction: tokenize, one forward pass without touching the cache,
//! pool, optionally L2-normalize.

use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, GenerationEngine, PoolingType, TokenId, Vocabulary};

/// Per-call normalization override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalize {
    /// Use the session's `normalize_embeddings` setting.
    #[default]
    SessionDefault,
    Off,
    On,
}

impl Normalize {
    /// Map the numeric form (-1 default, 0 off, 1 on).
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            -1 => Some(Normalize::SessionDefault),
            0 => Some(Normalize::Off),
            1 => Some(Normalize::On),
            _ => None,
        }
    }

    pub fn resolve(self, session_default: bool) -> bool {
        match self {
            Normalize::SessionDefault => session_default,
            Normalize::Off => false,
            Normalize::On => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embedding: Vec<f32>,
    pub tokens: Vec<TokenId>,
}

pub fn embed(
    engine: &mut dyn GenerationEngine,
    vocab: &dyn Vocabulary,
    text: &str,
    pooling: PoolingType,
    normalize: bool,
) -> Result<EmbeddingResult, EngineError> {
    let tokens = vocab.tokenize(text, true);
    let mut embedding = engine.embed(&tokens, pooling)?;
    if normalize {
        l2_normalize(&mut embedding);
    }
    Ok(EmbeddingResult { embedding, tokens })
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_normalize_override() {
        assert!(Normalize::from_i32(-1).unwrap().resolve(true));
        assert!(!Normalize::from_i32(0).unwrap().resolve(true));
        assert!(Normalize::from_i32(1).unwrap().resolve(false));
        assert_eq!(Normalize::from_i32(2), None);
    }
}

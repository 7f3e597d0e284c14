//! Constrained-decoding hook.
//!
//! Grammars are compiled outside this crate; the controller only needs to ask
//! which tokens are currently legal and to advance the grammar after a token is
//! accepted.

use crate::engine::TokenId;

pub trait Grammar: Send {
    /// Whether `token` (with raw bytes `piece`) may be sampled next.
    fn allows(&self, token: TokenId, piece: &[u8]) -> bool;

    /// Advance past an accepted token.
    fn accept(&mut self, token: TokenId, piece: &[u8]);
}

/// Accepts any sequence of bytes from a fixed set, up to an optional length.
/// Empty pieces (end-of-sequence and control tokens) are always allowed.
#[derive(Debug, Clone)]
pub struct CharClassGrammar {
    allowed: Vec<u8>,
    max_len: Option<usize>,
    emitted: usize,
}

impl CharClassGrammar {
    pub fn new(allowed: impl AsRef<[u8]>) -> Self {
        Self {
            allowed: allowed.as_ref().to_vec(),
            max_len: None,
            emitted: 0,
        }
    }

    /// After `max_len` bytes only empty pieces remain legal.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

impl Grammar for CharClassGrammar {
    fn allows(&self, _token: TokenId, piece: &[u8]) -> bool {
        if piece.is_empty() {
            return true;
        }
        if let Some(max) = self.max_len {
            if self.emitted + piece.len() > max {
                return false;
            }
        }
        piece.iter().all(|b| self.allowed.contains(b))
    }

    fn accept(&mut self, _token: TokenId, piece: &[u8]) {
        self.emitted += piece.len();
    }
}

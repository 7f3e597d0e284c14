//! Token sampling pipeline.
//!
//! Order (per step): repetition/frequency/presence penalties → logit biases →
//! ignore-EOS → grammar mask → then either greedy, mirostat v1/v2, or
//! top-k → typical → top-p → min-p → temperature → seeded draw.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::engine::{TokenId, Vocabulary};
use crate::generation::grammar::Grammar;
use crate::generation::request::{Mirostat, SamplingParams, RANDOM_SEED};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    #[error("Invalid logits: expected {expected} entries, got {got}")]
    InvalidLogits { expected: usize, got: usize },

    #[error("No valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling (xorshift64).
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Spread small seeds across the state; zero state would stick at zero.
        let state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        Self { state }
    }

    /// Next float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// A token under consideration with its (possibly adjusted) logit and probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub token: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Outcome of one sampling step.
#[derive(Debug, Clone)]
pub struct Sampled {
    pub token: TokenId,
    /// Final distribution, most probable first.
    pub candidates: Vec<Candidate>,
}

/// Per-generation sampler state.
pub struct Sampler {
    params: SamplingParams,
    rng: SeededRng,
    history: VecDeque<TokenId>,
    penalty_window: usize,
    mirostat_mu: f32,
    eos: TokenId,
}

impl Sampler {
    pub fn new(params: SamplingParams, n_ctx: usize, eos: TokenId) -> Self {
        let seed = if params.seed == RANDOM_SEED {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x5eed)
        } else {
            params.seed as u64
        };
        let penalty_window = match params.penalty_last_n {
            -1 => n_ctx,
            n => n.max(0) as usize,
        };
        let mirostat_mu = 2.0 * params.mirostat_tau;

        Self {
            params,
            rng: SeededRng::new(seed),
            history: VecDeque::with_capacity(penalty_window),
            penalty_window,
            mirostat_mu,
            eos,
        }
    }

    /// Record a token in the penalty window (prompt and generated tokens alike).
    pub fn accept(&mut self, token: TokenId) {
        if self.penalty_window == 0 {
            return;
        }
        if self.history.len() == self.penalty_window {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    pub fn sample(
        &mut self,
        logits: &[f32],
        vocab: &dyn Vocabulary,
        grammar: Option<&dyn Grammar>,
    ) -> SamplingResult<Sampled> {
        let n_vocab = vocab.n_vocab();
        if logits.len() != n_vocab {
            return Err(SamplingError::InvalidLogits {
                expected: n_vocab,
                got: logits.len(),
            });
        }

        let mut logits = logits.to_vec();
        self.apply_penalties(&mut logits);
        for &(token, bias) in &self.params.logit_bias {
            if let Some(l) = logits.get_mut(token as usize) {
                *l += bias;
            }
        }
        if self.params.ignore_eos {
            if let Some(l) = logits.get_mut(self.eos as usize) {
                *l = f32::NEG_INFINITY;
            }
        }
        if let Some(grammar) = grammar {
            for (token, l) in logits.iter_mut().enumerate() {
                if l.is_finite() && !grammar.allows(token as TokenId, &vocab.piece(token as TokenId)) {
                    *l = f32::NEG_INFINITY;
                }
            }
        }

        let mut cands: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(i, &l)| Candidate {
                token: i as TokenId,
                logit: l,
                p: 0.0,
            })
            .collect();
        if cands.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }
        sort_desc(&mut cands);

        if self.params.temperature <= 0.0 {
            softmax(&mut cands);
            return Ok(Sampled {
                token: cands[0].token,
                candidates: cands,
            });
        }

        let token = match self.params.mirostat {
            Mirostat::Disabled => self.sample_standard(&mut cands)?,
            Mirostat::V1 => self.sample_mirostat_v1(&mut cands, n_vocab)?,
            Mirostat::V2 => self.sample_mirostat_v2(&mut cands)?,
        };
        Ok(Sampled {
            token,
            candidates: cands,
        })
    }

    fn apply_penalties(&self, logits: &mut [f32]) {
        let p = &self.params;
        if self.history.is_empty()
            || (p.penalty_repeat == 1.0 && p.penalty_freq == 0.0 && p.penalty_present == 0.0)
        {
            return;
        }
        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for &t in &self.history {
            *counts.entry(t).or_default() += 1;
        }
        for (token, count) in counts {
            let Some(l) = logits.get_mut(token as usize) else {
                continue;
            };
            if *l <= 0.0 {
                *l *= p.penalty_repeat;
            } else {
                *l /= p.penalty_repeat;
            }
            *l -= count as f32 * p.penalty_freq + p.penalty_present;
        }
    }

    fn sample_standard(&mut self, cands: &mut Vec<Candidate>) -> SamplingResult<TokenId> {
        let p = &self.params;
        if p.top_k > 0 && (p.top_k as usize) < cands.len() {
            cands.truncate(p.top_k as usize);
        }
        if p.typical_p < 1.0 {
            typical(cands, p.typical_p);
        }
        if p.top_p < 1.0 {
            softmax(cands);
            let mut cum = 0.0;
            let mut keep = cands.len();
            for (i, c) in cands.iter().enumerate() {
                cum += c.p;
                if cum >= p.top_p {
                    keep = i + 1;
                    break;
                }
            }
            cands.truncate(keep);
        }
        if p.min_p > 0.0 {
            softmax(cands);
            let threshold = cands[0].p * p.min_p;
            let keep = cands.iter().take_while(|c| c.p >= threshold).count().max(1);
            cands.truncate(keep);
        }
        let temp = p.temperature;
        cands.iter_mut().for_each(|c| c.logit /= temp);
        softmax(cands);
        self.draw(cands)
    }

    /// Mirostat v1: estimate the Zipf exponent from the top candidates, derive k.
    fn sample_mirostat_v1(&mut self, cands: &mut Vec<Candidate>, n_vocab: usize) -> SamplingResult<TokenId> {
        const M: usize = 100;
        let temp = self.params.temperature;
        cands.iter_mut().for_each(|c| c.logit /= temp);
        softmax(cands);

        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..(M.min(cands.len()).saturating_sub(1)) {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (cands[i].p / cands[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = if sum_ti_sq > 0.0 { sum_ti_bi / sum_ti_sq } else { 1.0 };
        let eps_hat = s_hat - 1.0;
        let k = if eps_hat.abs() > f32::EPSILON && s_hat > 0.0 {
            ((eps_hat * 2f32.powf(self.mirostat_mu)) / (1.0 - (n_vocab as f32).powf(-eps_hat)))
                .powf(1.0 / s_hat)
        } else {
            cands.len() as f32
        };
        let k = if k.is_finite() { (k as usize).max(1) } else { cands.len() };
        cands.truncate(k.min(cands.len()));
        softmax(cands);

        let token = self.draw(cands)?;
        self.update_mu(cands, token);
        Ok(token)
    }

    /// Mirostat v2: drop candidates whose surprise exceeds mu.
    fn sample_mirostat_v2(&mut self, cands: &mut Vec<Candidate>) -> SamplingResult<TokenId> {
        let temp = self.params.temperature;
        cands.iter_mut().for_each(|c| c.logit /= temp);
        softmax(cands);

        let mu = self.mirostat_mu;
        let keep = cands.iter().take_while(|c| -c.p.log2() <= mu).count().max(1);
        cands.truncate(keep);
        softmax(cands);

        let token = self.draw(cands)?;
        self.update_mu(cands, token);
        Ok(token)
    }

    fn update_mu(&mut self, cands: &[Candidate], token: TokenId) {
        if let Some(c) = cands.iter().find(|c| c.token == token) {
            let surprise = -c.p.log2();
            self.mirostat_mu -= self.params.mirostat_eta * (surprise - self.params.mirostat_tau);
        }
    }

    fn draw(&mut self, cands: &[Candidate]) -> SamplingResult<TokenId> {
        let last = cands.last().ok_or(SamplingError::NoValidTokens)?;
        let r = self.rng.next_f32();
        let mut cum = 0.0;
        for c in cands {
            cum += c.p;
            if r < cum {
                return Ok(c.token);
            }
        }
        Ok(last.token)
    }
}

fn sort_desc(cands: &mut [Candidate]) {
    cands.sort_by(|a, b| b.logit.total_cmp(&a.logit));
}

/// Softmax over logits into `p`; candidates must be sorted descending.
fn softmax(cands: &mut [Candidate]) {
    let Some(max) = cands.first().map(|c| c.logit) else {
        return;
    };
    let mut sum = 0.0f32;
    for c in cands.iter_mut() {
        c.p = (c.logit - max).exp();
        sum += c.p;
    }
    for c in cands.iter_mut() {
        c.p /= sum;
    }
}

/// Locally typical sampling: keep tokens whose surprise is closest to the entropy.
fn typical(cands: &mut Vec<Candidate>, mass: f32) {
    softmax(cands);
    let entropy: f32 = cands
        .iter()
        .filter(|c| c.p > 0.0)
        .map(|c| -c.p * c.p.ln())
        .sum();

    let mut order: Vec<(usize, f32)> = cands
        .iter()
        .enumerate()
        .map(|(i, c)| (i, (-c.p.ln() - entropy).abs()))
        .collect();
    order.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut cum = 0.0;
    let mut keep = order.len();
    for (n, (i, _)) in order.iter().enumerate() {
        cum += cands[*i].p;
        if cum >= mass {
            keep = n + 1;
            break;
        }
    }
    let mut kept: Vec<Candidate> = order[..keep].iter().map(|(i, _)| cands[*i]).collect();
    sort_desc(&mut kept);
    *cands = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::{ReferenceVocab, EOS};
    use crate::generation::grammar::CharClassGrammar;

    fn logits_with(peaks: &[(usize, f32)]) -> Vec<f32> {
        let mut l = vec![0.0f32; 258];
        for &(i, v) in peaks {
            l[i] = v;
        }
        l
    }

    fn params(temperature: f32) -> SamplingParams {
        SamplingParams {
            temperature,
            seed: 7,
            ..Default::default()
        }
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let mut s = Sampler::new(params(0.0), 64, EOS);
        let out = s.sample(&logits_with(&[(65, 5.0), (66, 3.0)]), &ReferenceVocab, None).unwrap();
        assert_eq!(out.token, 65);
        assert_eq!(out.candidates[0].token, 65);
        assert!(out.candidates[0].p > out.candidates[1].p);
    }

    #[test]
    fn test_seed_is_reproducible() {
        let logits = logits_with(&[(65, 1.0), (66, 1.0), (67, 1.0)]);
        let mut a = Sampler::new(params(1.0), 64, EOS);
        let mut b = Sampler::new(params(1.0), 64, EOS);
        for _ in 0..20 {
            let ta = a.sample(&logits, &ReferenceVocab, None).unwrap().token;
            let tb = b.sample(&logits, &ReferenceVocab, None).unwrap().token;
            assert_eq!(ta, tb);
        }
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let p = SamplingParams { top_k: 1, ..params(1.5) };
        let mut s = Sampler::new(p, 64, EOS);
        for _ in 0..10 {
            let t = s.sample(&logits_with(&[(70, 2.0), (71, 1.9)]), &ReferenceVocab, None).unwrap();
            assert_eq!(t.token, 70);
        }
    }

    #[test]
    fn test_ignore_eos_masks_eos() {
        let p = SamplingParams { ignore_eos: true, ..params(0.0) };
        let mut s = Sampler::new(p, 64, EOS);
        let out = s.sample(&logits_with(&[(EOS as usize, 10.0), (65, 1.0)]), &ReferenceVocab, None).unwrap();
        assert_eq!(out.token, 65);
    }

    #[test]
    fn test_logit_bias_ban() {
        let p = SamplingParams { logit_bias: vec![(65, f32::NEG_INFINITY)], ..params(0.0) };
        let mut s = Sampler::new(p, 64, EOS);
        let out = s.sample(&logits_with(&[(65, 10.0), (66, 1.0)]), &ReferenceVocab, None).unwrap();
        assert_eq!(out.token, 66);
    }

    #[test]
    fn test_repeat_penalty_demotes_history() {
        let p = SamplingParams { penalty_repeat: 4.0, ..params(0.0) };
        let mut s = Sampler::new(p, 64, EOS);
        s.accept(65);
        let out = s.sample(&logits_with(&[(65, 2.0), (66, 1.0)]), &ReferenceVocab, None).unwrap();
        assert_eq!(out.token, 66);
    }

    #[test]
    fn test_grammar_mask() {
        let g = CharClassGrammar::new(b"xyz");
        let mut s = Sampler::new(params(0.0), 64, EOS);
        let out = s
            .sample(&logits_with(&[(65, 9.0), (b'y' as usize, 1.0)]), &ReferenceVocab, Some(&g))
            .unwrap();
        assert_eq!(out.token, b'y' as TokenId);
    }

    #[test]
    fn test_all_masked_is_error() {
        let bias = (0..258).map(|t| (t as TokenId, f32::NEG_INFINITY)).collect();
        let p = SamplingParams { logit_bias: bias, ..params(0.0) };
        let mut s = Sampler::new(p, 64, EOS);
        let err = s.sample(&logits_with(&[]), &ReferenceVocab, None).unwrap_err();
        assert_eq!(err, SamplingError::NoValidTokens);
    }

    #[test]
    fn test_mirostat_v2_prefers_likely_tokens() {
        let p = SamplingParams {
            mirostat: Mirostat::V2,
            mirostat_tau: 1.0,
            ..params(1.0)
        };
        let mut s = Sampler::new(p, 64, EOS);
        let out = s.sample(&logits_with(&[(80, 20.0)]), &ReferenceVocab, None).unwrap();
        assert_eq!(out.token, 80);
    }

    #[test]
    fn test_wrong_logit_count() {
        let mut s = Sampler::new(params(0.0), 64, EOS);
        assert!(matches!(
            s.sample(&[0.0; 3], &ReferenceVocab, None),
            Err(SamplingError::InvalidLogits { expected: 258, got: 3 })
        ));
    }
}

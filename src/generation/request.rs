//! Generation request and result types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::TokenId;
use crate::generation::grammar::Grammar;

/// Seed value meaning "pick a random seed".
pub const RANDOM_SEED: u32 = u32::MAX;

/// Prompt input: raw text (tokenized with BOS) or pre-tokenized ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Tokens(Vec<TokenId>),
}

impl From<&str> for Prompt {
    fn from(s: &str) -> Self {
        Prompt::Text(s.to_string())
    }
}

impl From<String> for Prompt {
    fn from(s: String) -> Self {
        Prompt::Text(s)
    }
}

impl From<Vec<TokenId>> for Prompt {
    fn from(t: Vec<TokenId>) -> Self {
        Prompt::Tokens(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mirostat {
    #[default]
    Disabled,
    V1,
    V2,
}

/// Sampling parameters. Every field has a default so partial JSON bodies work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Softmax temperature; `<= 0` selects greedy decoding.
    pub temperature: f32,
    /// Top-k cutoff (0 = disabled).
    pub top_k: u32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    /// Penalty window in tokens (-1 = whole context, 0 = disabled).
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub mirostat: Mirostat,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// RNG seed; [`RANDOM_SEED`] picks one at random.
    pub seed: u32,
    pub ignore_eos: bool,
    /// Additive logit biases; `f32::NEG_INFINITY` bans a token.
    pub logit_bias: Vec<(TokenId, f32)>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: Mirostat::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            seed: RANDOM_SEED,
            ignore_eos: false,
            logit_bias: Vec::new(),
        }
    }
}

impl SamplingParams {
    /// Greedy decoding with no penalties.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }
}

/// One completion request.
pub struct GenerationRequest {
    pub prompt: Prompt,
    pub params: SamplingParams,
    /// Tokens to generate (-1 = until EOS/stop/context).
    pub n_predict: i32,
    /// Prompt head tokens kept on truncation and context shift (-1 = whole prompt).
    pub n_keep: i32,
    pub stop: Vec<String>,
    /// Number of top candidates reported per generated token (0 = off).
    pub n_probs: usize,
    pub grammar: Option<Box<dyn Grammar>>,
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("prompt", &self.prompt)
            .field("params", &self.params)
            .field("n_predict", &self.n_predict)
            .field("n_keep", &self.n_keep)
            .field("stop", &self.stop)
            .field("n_probs", &self.n_probs)
            .field("grammar", &self.grammar.is_some())
            .finish()
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            params: SamplingParams::default(),
            n_predict: -1,
            n_keep: 0,
            stop: Vec::new(),
            n_probs: 0,
            grammar: None,
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_n_predict(mut self, n: i32) -> Self {
        self.n_predict = n;
        self
    }

    pub fn with_n_keep(mut self, n: i32) -> Self {
        self.n_keep = n;
        self
    }

    pub fn with_stop(mut self, stop: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_n_probs(mut self, n: usize) -> Self {
        self.n_probs = n;
        self
    }

    pub fn with_grammar(mut self, grammar: Box<dyn Grammar>) -> Self {
        self.grammar = Some(grammar);
        self
    }

    /// Range-check every numeric parameter. Runs before the session is touched.
    pub fn validate(&self, n_vocab: usize) -> Result<(), String> {
        let p = &self.params;
        if !p.temperature.is_finite() || p.temperature < 0.0 {
            return Err(format!("temperature must be >= 0, got {}", p.temperature));
        }
        if !(p.top_p > 0.0 && p.top_p <= 1.0) {
            return Err(format!("top_p must be in (0, 1], got {}", p.top_p));
        }
        if !(0.0..=1.0).contains(&p.min_p) {
            return Err(format!("min_p must be in [0, 1], got {}", p.min_p));
        }
        if !(p.typical_p > 0.0 && p.typical_p <= 1.0) {
            return Err(format!("typical_p must be in (0, 1], got {}", p.typical_p));
        }
        if p.penalty_last_n < -1 {
            return Err(format!("penalty_last_n must be >= -1, got {}", p.penalty_last_n));
        }
        if !(p.penalty_repeat > 0.0 && p.penalty_repeat.is_finite()) {
            return Err(format!("penalty_repeat must be > 0, got {}", p.penalty_repeat));
        }
        if !(-2.0..=2.0).contains(&p.penalty_freq) {
            return Err(format!("penalty_freq must be in [-2, 2], got {}", p.penalty_freq));
        }
        if !(-2.0..=2.0).contains(&p.penalty_present) {
            return Err(format!(
                "penalty_present must be in [-2, 2], got {}",
                p.penalty_present
            ));
        }
        if !(p.mirostat_tau > 0.0 && p.mirostat_tau.is_finite()) {
            return Err(format!("mirostat_tau must be > 0, got {}", p.mirostat_tau));
        }
        if !(p.mirostat_eta > 0.0 && p.mirostat_eta <= 1.0) {
            return Err(format!("mirostat_eta must be in (0, 1], got {}", p.mirostat_eta));
        }
        for &(token, bias) in &p.logit_bias {
            if token < 0 || token as usize >= n_vocab {
                return Err(format!("logit_bias token {token} out of range"));
            }
            if bias.is_nan() {
                return Err(format!("logit_bias for token {token} is NaN"));
            }
        }
        if self.n_predict < -1 {
            return Err(format!("n_predict must be >= -1, got {}", self.n_predict));
        }
        if self.n_keep < -1 {
            return Err(format!("n_keep must be >= -1, got {}", self.n_keep));
        }
        if self.stop.iter().any(String::is_empty) {
            return Err("stop sequences must be non-empty".to_string());
        }
        match &self.prompt {
            Prompt::Tokens(tokens) if tokens.is_empty() => {
                return Err("token prompt is empty".to_string());
            }
            Prompt::Tokens(tokens) => {
                if let Some(bad) = tokens.iter().find(|t| **t < 0 || **t as usize >= n_vocab) {
                    return Err(format!("prompt token {bad} out of range"));
                }
            }
            Prompt::Text(_) => {}
        }
        Ok(())
    }
}

/// Lifecycle of one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    PromptIngestion,
    Decoding,
    Completed,
    Stopped,
    Cancelled,
    Failed,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationState::Completed
                | GenerationState::Stopped
                | GenerationState::Cancelled
                | GenerationState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Idle => "idle",
            GenerationState::PromptIngestion => "prompt_ingestion",
            GenerationState::Decoding => "decoding",
            GenerationState::Completed => "completed",
            GenerationState::Stopped => "stopped",
            GenerationState::Cancelled => "cancelled",
            GenerationState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    StopWord,
    Cancelled,
    Limit,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub predicted_per_second: f64,
}

impl Timings {
    pub(crate) fn finish(&mut self) {
        self.prompt_per_second = per_second(self.prompt_n, self.prompt_ms);
        self.predicted_per_second = per_second(self.predicted_n, self.predicted_ms);
    }
}

fn per_second(n: usize, ms: f64) -> f64 {
    if ms > 0.0 {
        n as f64 * 1000.0 / ms
    } else {
        0.0
    }
}

/// One candidate token with its probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProb {
    pub token: TokenId,
    pub text: String,
    pub prob: f32,
}

/// Top-N candidates for one generated token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProbs {
    pub token: TokenId,
    pub text: String,
    pub candidates: Vec<TokenProb>,
}

/// Outcome of one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub tokens: Vec<TokenId>,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    pub final_state: GenerationState,
    pub stop_reason: StopReason,
    pub stopping_word: Option<String>,
    pub truncated: bool,
    pub timings: Timings,
    pub probs: Vec<TokenProbs>,
    /// Thinking text split out of `text` when the session extracts reasoning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl GenerationResult {
    pub(crate) fn empty() -> Self {
        Self {
            text: String::new(),
            tokens: Vec::new(),
            tokens_predicted: 0,
            tokens_evaluated: 0,
            final_state: GenerationState::Idle,
            stop_reason: StopReason::Limit,
            stopping_word: None,
            truncated: false,
            timings: Timings::default(),
            probs: Vec::new(),
            reasoning: None,
        }
    }
}

/// Streamed fragment for one accepted token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// The token accepted at this step (`None` for the final flush).
    pub token: Option<TokenId>,
    /// Text that is safe to show. May be empty while text is held back.
    pub text: String,
    pub probs: Option<TokenProbs>,
}

/// Streaming callback verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

//! Generation controller: drives one completion request against a session's
//! engine and cache.
//!
//! States: `Idle → PromptIngestion → Decoding → {Completed, Stopped, Cancelled, Failed}`.
//!
//! After every accepted token the checks run in a fixed order:
//! 1. end-of-sequence → Completed
//! 2. stop sequence (matched across token boundaries, output cut before it) → Completed
//! 3. `n_predict` reached → Completed (deferred while output ends mid UTF-8 sequence)
//! 4. streaming callback returned `Stop` → Stopped
//!
//! The cancellation flag is polled between prompt batches and at the top of each
//! decode step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::engine::{EngineError, GenerationEngine, TokenId, Vocabulary};
use crate::generation::request::{
    GenerationRequest, GenerationResult, GenerationState, Prompt, StopReason, StreamChunk,
    StreamControl, TokenProb, TokenProbs,
};
use crate::generation::sampler::{Sampled, Sampler};
use crate::generation::stop::{find_partial_stop, find_stop_string, incomplete_utf8_tail};

/// Extra tokens allowed past `n_predict` to finish a UTF-8 sequence.
const MAX_UTF8_EXTENSION: usize = 3;

/// Cancellation check polled by long-running loops.
pub trait Cancellation {
    fn is_cancelled(&self) -> bool;
}

impl Cancellation for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// Engine failure mid-run, with everything produced before it.
#[derive(Debug)]
pub struct GenerationFailure {
    pub source: EngineError,
    pub partial: GenerationResult,
}

/// Borrowed view of a session's mutable core for the duration of one run.
pub struct Controller<'a> {
    engine: &'a mut dyn GenerationEngine,
    /// Tokens mirroring the engine cache cells.
    tokens: &'a mut Vec<TokenId>,
    vocab: &'a dyn Vocabulary,
    cancel: &'a dyn Cancellation,
    n_batch: usize,
    on_state: &'a dyn Fn(GenerationState),
}

impl<'a> Controller<'a> {
    pub fn new(
        engine: &'a mut dyn GenerationEngine,
        tokens: &'a mut Vec<TokenId>,
        vocab: &'a dyn Vocabulary,
        cancel: &'a dyn Cancellation,
        n_batch: usize,
        on_state: &'a dyn Fn(GenerationState),
    ) -> Self {
        Self {
            engine,
            tokens,
            vocab,
            cancel,
            n_batch: n_batch.max(1),
            on_state,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn tokenize_prompt(&self, prompt: &Prompt) -> Vec<TokenId> {
        let mut tokens = match prompt {
            Prompt::Text(text) => self.vocab.tokenize(text, true),
            Prompt::Tokens(tokens) => tokens.clone(),
        };
        if tokens.is_empty() {
            tokens.push(self.vocab.bos().unwrap_or_else(|| self.vocab.eos()));
        }
        tokens
    }

    /// Keep the first `n_keep` tokens and drop whole half-blocks of the rest
    /// until the prompt fits the context.
    fn truncate_prompt(&self, tokens: &mut Vec<TokenId>, n_keep: usize, result: &mut GenerationResult) {
        let n_ctx = self.engine.n_ctx();
        if tokens.len() < n_ctx {
            return;
        }
        let n_left = n_ctx - n_keep;
        let n_block = (n_left / 2).max(1);
        let erased = (tokens.len() - n_keep - n_block) / n_block;
        let original = tokens.len();
        tokens.drain(n_keep..n_keep + erased * n_block);
        result.truncated = true;
        warn!(
            original,
            kept = tokens.len(),
            n_keep,
            n_ctx,
            "Prompt truncated to fit context"
        );
    }

    /// Free room at the end of a full cache, preserving the first `n_keep + 1` cells.
    fn context_shift(&mut self, n_keep: usize) {
        let n_past = self.tokens.len();
        let n_left = n_past.saturating_sub(n_keep + 1);
        let n_discard = (n_left / 2).max(1);
        let start = (n_keep + 1).min(n_past);
        let end = (start + n_discard).min(n_past);

        self.engine.cache_discard(start, end - start);
        self.tokens.drain(start..end);
        info!(n_past, n_keep, n_discard = end - start, "Context shift");
    }

    fn token_probs(&self, token: TokenId, sampled: &Sampled, n_probs: usize) -> TokenProbs {
        let text = |t: TokenId| String::from_utf8_lossy(&self.vocab.piece(t)).into_owned();
        TokenProbs {
            token,
            text: text(token),
            candidates: sampled
                .candidates
                .iter()
                .take(n_probs)
                .map(|c| TokenProb {
                    token: c.token,
                    text: text(c.token),
                    prob: c.p,
                })
                .collect(),
        }
    }

    /// Run a request to a terminal state.
    pub fn run(
        mut self,
        mut request: GenerationRequest,
        on_chunk: &mut dyn FnMut(StreamChunk) -> StreamControl,
    ) -> Result<GenerationResult, GenerationFailure> {
        let mut result = GenerationResult::empty();
        let n_ctx = self.engine.n_ctx();
        let eos = self.vocab.eos();

        (self.on_state)(GenerationState::PromptIngestion);
        let prompt_start = Instant::now();

        let mut prompt = self.tokenize_prompt(&request.prompt);
        let n_keep = match request.n_keep {
            n if n < 0 => prompt.len(),
            n => n as usize,
        }
        .min(n_ctx.saturating_sub(4));
        self.truncate_prompt(&mut prompt, n_keep, &mut result);
        let n_keep = n_keep.min(prompt.len());

        // Reuse the longest common prefix, always re-evaluating at least one token.
        let mut n_past = self
            .tokens
            .iter()
            .zip(&prompt)
            .take_while(|(a, b)| a == b)
            .count();
        if n_past == prompt.len() {
            n_past -= 1;
        }
        self.engine.cache_truncate(n_past);
        self.tokens.truncate(n_past);
        debug!(n_past, prompt_len = prompt.len(), "Prompt prefix reused");

        let mut sampler = Sampler::new(request.params.clone(), n_ctx, eos);
        for &t in &prompt {
            sampler.accept(t);
        }

        for batch in prompt[n_past..].chunks(self.n_batch) {
            if self.cancelled() {
                return Ok(self.finish(result, GenerationState::Cancelled, StopReason::Cancelled));
            }
            if let Err(e) = self.engine.decode(batch) {
                return Err(self.fail(result, e));
            }
            self.tokens.extend_from_slice(batch);
            result.tokens_evaluated += batch.len();
        }
        result.timings.prompt_n = result.tokens_evaluated;
        result.timings.prompt_ms = prompt_start.elapsed().as_secs_f64() * 1000.0;

        if request.n_predict == 0 {
            return Ok(self.finish(result, GenerationState::Completed, StopReason::Limit));
        }

        (self.on_state)(GenerationState::Decoding);
        let decode_start = Instant::now();
        let mut output: Vec<u8> = Vec::new();
        let mut streamed = 0usize;
        let mut n_remain: i64 = request.n_predict as i64;
        let mut utf8_extension = 0usize;
        let mut grammar = request.grammar.take();

        let terminal = loop {
            if self.cancelled() {
                break (GenerationState::Cancelled, StopReason::Cancelled);
            }

            let sampled = match sampler.sample(self.engine.logits(), self.vocab, grammar.as_deref()) {
                Ok(s) => s,
                Err(e) => {
                    result.text = String::from_utf8_lossy(&output).into_owned();
                    return Err(self.fail(result, e.into()));
                }
            };
            let token = sampled.token;
            let piece = self.vocab.piece(token);
            sampler.accept(token);
            if let Some(g) = grammar.as_mut() {
                g.accept(token, &piece);
            }
            result.tokens.push(token);
            result.tokens_predicted += 1;
            let probs = (request.n_probs > 0).then(|| self.token_probs(token, &sampled, request.n_probs));
            if let Some(p) = &probs {
                result.probs.push(p.clone());
            }

            if token == eos {
                let text = flush(&output, &mut streamed);
                on_chunk(StreamChunk { token: Some(token), text, probs });
                break (GenerationState::Completed, StopReason::EndOfSequence);
            }

            if self.tokens.len() >= n_ctx {
                self.context_shift(n_keep);
            }
            if let Err(e) = self.engine.decode(&[token]) {
                result.text = String::from_utf8_lossy(&output).into_owned();
                return Err(self.fail(result, e));
            }
            self.tokens.push(token);
            output.extend_from_slice(&piece);

            if let Some((pos, idx)) = find_stop_string(&output, &request.stop, piece.len()) {
                output.truncate(pos);
                result.stopping_word = Some(request.stop[idx].clone());
                let text = flush(&output, &mut streamed);
                on_chunk(StreamChunk { token: Some(token), text, probs });
                break (GenerationState::Completed, StopReason::StopWord);
            }

            if request.n_predict > 0 {
                n_remain -= 1;
                if n_remain <= 0 {
                    if incomplete_utf8_tail(&output) > 0 && utf8_extension < MAX_UTF8_EXTENSION {
                        utf8_extension += 1;
                        n_remain += 1;
                    } else {
                        let text = flush(&output, &mut streamed);
                        on_chunk(StreamChunk { token: Some(token), text, probs });
                        break (GenerationState::Completed, StopReason::Limit);
                    }
                }
            }

            let mut safe_end = output.len() - incomplete_utf8_tail(&output);
            if let Some(p) = find_partial_stop(&output[..safe_end], &request.stop) {
                safe_end = p;
            }
            let text = if safe_end > streamed {
                let text = String::from_utf8_lossy(&output[streamed..safe_end]).into_owned();
                streamed = safe_end;
                text
            } else {
                String::new()
            };

            if on_chunk(StreamChunk { token: Some(token), text, probs }) == StreamControl::Stop {
                break (GenerationState::Stopped, StopReason::Cancelled);
            }
        };

        result.text = String::from_utf8_lossy(&output).into_owned();
        result.timings.predicted_n = result.tokens_predicted;
        result.timings.predicted_ms = decode_start.elapsed().as_secs_f64() * 1000.0;
        Ok(self.finish(result, terminal.0, terminal.1))
    }

    fn finish(&self, mut result: GenerationResult, state: GenerationState, reason: StopReason) -> GenerationResult {
        result.final_state = state;
        result.stop_reason = reason;
        result.timings.finish();
        (self.on_state)(state);
        info!(
            state = state.as_str(),
            reason = ?reason,
            prompt_tokens = result.tokens_evaluated,
            predicted = result.tokens_predicted,
            truncated = result.truncated,
            "Generation finished"
        );
        result
    }

    fn fail(&self, mut result: GenerationResult, source: EngineError) -> GenerationFailure {
        result.final_state = GenerationState::Failed;
        result.timings.finish();
        (self.on_state)(GenerationState::Failed);
        warn!(error = %source, predicted = result.tokens_predicted, "Generation failed");
        GenerationFailure {
            source,
            partial: result,
        }
    }
}

/// Everything not yet streamed, now that nothing more will arrive.
fn flush(output: &[u8], streamed: &mut usize) -> String {
    if *streamed >= output.len() {
        *streamed = output.len();
        return String::new();
    }
    let text = String::from_utf8_lossy(&output[*streamed..]).into_owned();
    *streamed = output.len();
    text
}

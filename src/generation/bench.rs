//! Throughput benchmark over a session's engine.
//!
//! Each repetition clears the cache, decodes `pp` prompt tokens in batches, then
//! `tg` single-token steps for each of `pl` sequences. Reports tokens/second
//! averages and sample standard deviations.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{EngineError, GenerationEngine, TokenId};
use crate::generation::controller::Cancellation;

/// Upper bound on `nr`.
pub const MAX_BENCH_REPETITIONS: usize = 1000;
/// Upper bound on `pl`.
pub const MAX_BENCH_SEQUENCES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchParams {
    pub pp: usize,
    pub tg: usize,
    pub pl: usize,
    pub nr: usize,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            pp: 512,
            tg: 128,
            pl: 1,
            nr: 1,
        }
    }
}

impl BenchParams {
    /// Check the parameters against a context of `context_length` cells.
    pub fn validate(&self, context_length: usize) -> Result<(), String> {
        if self.pp == 0 || self.pl == 0 || self.nr == 0 {
            return Err("bench pp, pl and nr must be > 0".to_string());
        }
        if self.nr > MAX_BENCH_REPETITIONS {
            return Err(format!("bench nr {} exceeds {MAX_BENCH_REPETITIONS}", self.nr));
        }
        if self.pl > MAX_BENCH_SEQUENCES {
            return Err(format!("bench pl {} exceeds {MAX_BENCH_SEQUENCES}", self.pl));
        }
        let cells = self
            .pp
            .checked_add(self.tg)
            .ok_or_else(|| "bench pp + tg overflows".to_string())?;
        if cells > context_length {
            return Err(format!(
                "bench needs {cells} cells, context holds {context_length}"
            ));
        }
        self.pl
            .checked_mul(self.tg)
            .ok_or_else(|| "bench pl * tg overflows".to_string())?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    pub model_desc: String,
    pub model_size: u64,
    pub model_n_params: u64,
    pub pp_avg: f64,
    pub pp_std: f64,
    pub tg_avg: f64,
    pub tg_std: f64,
    /// Repetitions that finished before cancellation.
    pub repetitions: usize,
}

/// Filler token; content does not matter for throughput.
const BENCH_TOKEN: TokenId = 0;

pub fn run_bench(
    engine: &mut dyn GenerationEngine,
    params: BenchParams,
    n_batch: usize,
    cancel: &dyn Cancellation,
) -> Result<BenchResult, EngineError> {
    info!(pp = params.pp, tg = params.tg, pl = params.pl, nr = params.nr, "Starting benchmark");

    let prompt = vec![BENCH_TOKEN; params.pp];
    let mut pp_speeds = Vec::with_capacity(params.nr);
    let mut tg_speeds = Vec::with_capacity(params.nr);

    let outcome = (|| -> Result<(), EngineError> {
        for _ in 0..params.nr {
            if cancel.is_cancelled() {
                break;
            }
            engine.cache_truncate(0);

            let t_pp = Instant::now();
            for batch in prompt.chunks(n_batch.max(1)) {
                engine.decode(batch)?;
            }
            let t_pp = t_pp.elapsed().as_secs_f64();

            let t_tg = Instant::now();
            let base = engine.cache_len();
            for _ in 0..params.pl {
                engine.cache_truncate(base);
                for _ in 0..params.tg {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    engine.decode(&[BENCH_TOKEN])?;
                }
            }
            let t_tg = t_tg.elapsed().as_secs_f64();

            pp_speeds.push(speed(params.pp, t_pp));
            tg_speeds.push(speed(params.pl.saturating_mul(params.tg), t_tg));
        }
        Ok(())
    })();
    engine.cache_truncate(0);
    outcome?;

    let (pp_avg, pp_std) = mean_std(&pp_speeds);
    let (tg_avg, tg_std) = mean_std(&tg_speeds);
    let meta = engine.metadata();
    let result = BenchResult {
        model_desc: meta.description.clone(),
        model_size: meta.file_size,
        model_n_params: meta.n_params,
        pp_avg,
        pp_std,
        tg_avg,
        tg_std,
        repetitions: pp_speeds.len(),
    };
    info!(pp_avg, tg_avg, repetitions = result.repetitions, "Benchmark finished");
    Ok(result)
}

fn speed(tokens: usize, secs: f64) -> f64 {
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

/// Mean and sample standard deviation (0 for fewer than two samples).
pub fn mean_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.max(0.0).sqrt())
}

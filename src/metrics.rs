//! Session metrics exported in Prometheus text format.
//!
//! Each manager owns its own registry so several managers (and tests) can run in
//! one process without colliding on metric names.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::generation::GenerationState;

/// Standard session-manager metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Sessions currently alive (incremented on create, decremented on drop)
    pub live_sessions: IntGauge,
    /// Finished generations by terminal state
    pub generations: IntCounterVec,
    /// Total tokens generated
    pub tokens_generated: IntCounter,
    /// Total prompt tokens evaluated (excluding reused prefix)
    pub prompt_tokens: IntCounter,
    /// Operations rejected because the session was busy
    pub busy_rejections: IntCounter,
    /// End-to-end generation latency
    pub generation_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("ondevice".to_string()), None)?;

        let live_sessions = IntGauge::new("live_sessions", "Sessions currently alive")?;
        let generations = IntCounterVec::new(
            Opts::new("generations_total", "Finished generations by terminal state"),
            &["state"],
        )?;
        let tokens_generated =
            IntCounter::new("generated_tokens_total", "Total tokens generated")?;
        let prompt_tokens =
            IntCounter::new("prompt_tokens_total", "Total prompt tokens evaluated")?;
        let busy_rejections =
            IntCounter::new("busy_rejections_total", "Operations rejected with Busy")?;
        let generation_seconds = Histogram::with_opts(
            HistogramOpts::new("generation_seconds", "Generation latency in seconds")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;

        registry.register(Box::new(live_sessions.clone()))?;
        registry.register(Box::new(generations.clone()))?;
        registry.register(Box::new(tokens_generated.clone()))?;
        registry.register(Box::new(prompt_tokens.clone()))?;
        registry.register(Box::new(busy_rejections.clone()))?;
        registry.register(Box::new(generation_seconds.clone()))?;

        Ok(Self {
            registry,
            live_sessions,
            generations,
            tokens_generated,
            prompt_tokens,
            busy_rejections,
            generation_seconds,
        })
    }

    pub fn record_generation(
        &self,
        state: GenerationState,
        prompt_tokens: usize,
        predicted: usize,
        seconds: f64,
    ) {
        self.generations.with_label_values(&[state.as_str()]).inc();
        self.prompt_tokens.inc_by(prompt_tokens as u64);
        self.tokens_generated.inc_by(predicted as u64);
        self.generation_seconds.observe(seconds);
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

//! A loaded model with its mutable generation state.
//!
//! The mutable core (engine + cached tokens) sits behind a `Mutex` that is only
//! ever taken with `try_lock`: a second long-running operation fails fast with
//! `Busy` instead of queueing. All engine access goes through [`ActiveGuard`],
//! which resets the activity marker when it drops.
//!
//! Every acquisition gets a fresh run id. `cancel` targets the run id it
//! observed, so a request that races with the end of one run cannot cancel the
//! next one.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SessionConfig, SnapshotConfig};
use crate::engine::{
    AdapterSpec, EngineStats, GenerationEngine, ModelMetadata, TokenId, Vocabulary,
};
use crate::error::{ErrorKind, Result, SessionError};
use crate::generation::bench::{run_bench, BenchParams, BenchResult};
use crate::generation::chat::{self, ChatError, ChatMessage, ChatTemplates, FormattedChat};
use crate::generation::embedding::{self, EmbeddingResult, Normalize};
use crate::generation::{
    Cancellation, Controller, GenerationRequest, GenerationResult, GenerationState, StreamChunk,
    StreamControl,
};
use crate::metrics::Metrics;
use crate::session::snapshot::{self, SnapshotSignature};

/// What a session is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Activity {
    Idle = 0,
    PromptIngestion = 1,
    Decoding = 2,
    Embedding = 3,
    Snapshot = 4,
    Adapters = 5,
    Bench = 6,
}

impl Activity {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Activity::PromptIngestion,
            2 => Activity::Decoding,
            3 => Activity::Embedding,
            4 => Activity::Snapshot,
            5 => Activity::Adapters,
            6 => Activity::Bench,
            _ => Activity::Idle,
        }
    }
}

impl From<GenerationState> for Activity {
    fn from(state: GenerationState) -> Self {
        match state {
            GenerationState::PromptIngestion => Activity::PromptIngestion,
            GenerationState::Decoding => Activity::Decoding,
            _ => Activity::Idle,
        }
    }
}

/// Point-in-time view of a session. Never blocks on a running operation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub model_path: PathBuf,
    pub metadata: ModelMetadata,
    pub config: SessionConfig,
    pub busy: bool,
    pub activity: Activity,
    pub cached_tokens: usize,
    pub adapters: Vec<AdapterSpec>,
    pub invalid: bool,
}

/// Result of restoring a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLoad {
    pub tokens_loaded: usize,
    /// Detokenized text of the restored tokens.
    pub prompt: String,
}

pub(crate) struct SessionInner {
    engine: Option<Box<dyn GenerationEngine>>,
    /// Token ids of the cache cells, in order.
    tokens: Vec<TokenId>,
}

impl SessionInner {
    fn engine(&mut self) -> Result<&mut Box<dyn GenerationEngine>> {
        self.engine
            .as_mut()
            .ok_or_else(|| SessionError::InvalidSession("engine has been released".to_string()))
    }

    fn clear_cache(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.cache_truncate(0);
        }
        self.tokens.clear();
    }
}

/// Cancellation scoped to one run id.
struct RunCancel<'a> {
    target: &'a AtomicU64,
    run: u64,
}

impl Cancellation for RunCancel<'_> {
    fn is_cancelled(&self) -> bool {
        self.target.load(Ordering::Acquire) == self.run
    }
}

/// Exclusive access to a session's mutable core.
pub(crate) struct ActiveGuard<'a> {
    session: &'a Session,
    inner: MutexGuard<'a, SessionInner>,
    run: u64,
}

impl<'a> ActiveGuard<'a> {
    fn cancellation(&self) -> RunCancel<'a> {
        RunCancel {
            target: &self.session.cancel_run,
            run: self.run,
        }
    }
}

impl Deref for ActiveGuard<'_> {
    type Target = SessionInner;

    fn deref(&self) -> &SessionInner {
        &self.inner
    }
}

impl DerefMut for ActiveGuard<'_> {
    fn deref_mut(&mut self) -> &mut SessionInner {
        &mut self.inner
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(engine) = self.inner.engine.as_ref() {
            *self.session.stats.write().unwrap_or_else(|p| p.into_inner()) = engine.stats();
        }
        self.session
            .cached_tokens
            .store(self.inner.tokens.len(), Ordering::Release);
        self.session.current_run.store(0, Ordering::Release);
        self.session
            .activity
            .store(Activity::Idle as u8, Ordering::Release);
    }
}

pub struct Session {
    id: Uuid,
    model_path: PathBuf,
    config: SessionConfig,
    metadata: ModelMetadata,
    vocab: Arc<dyn Vocabulary>,
    inner: Mutex<SessionInner>,
    adapters: RwLock<Vec<AdapterSpec>>,
    /// Engine counters as of the last finished operation.
    stats: RwLock<EngineStats>,
    next_run: AtomicU64,
    /// Id of the run holding the lock, 0 when idle.
    current_run: AtomicU64,
    /// Id of the run asked to stop.
    cancel_run: AtomicU64,
    activity: AtomicU8,
    cached_tokens: AtomicUsize,
    invalid: AtomicBool,
    closed: AtomicBool,
    snapshot: SnapshotConfig,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model_path", &self.model_path)
            .field("activity", &self.activity())
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        model_path: &Path,
        config: SessionConfig,
        engine: Box<dyn GenerationEngine>,
        snapshot: SnapshotConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let metadata = engine.metadata().clone();
        let vocab = engine.vocab();
        let stats = engine.stats();
        metrics.live_sessions.inc();

        Self {
            id: Uuid::new_v4(),
            model_path: model_path.to_path_buf(),
            config,
            metadata,
            vocab,
            inner: Mutex::new(SessionInner {
                engine: Some(engine),
                tokens: Vec::new(),
            }),
            adapters: RwLock::new(Vec::new()),
            stats: RwLock::new(stats),
            next_run: AtomicU64::new(0),
            current_run: AtomicU64::new(0),
            cancel_run: AtomicU64::new(0),
            activity: AtomicU8::new(Activity::Idle as u8),
            cached_tokens: AtomicUsize::new(0),
            invalid: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            snapshot,
            metrics,
        }
    }

    /// Record adapters the engine was loaded with.
    pub(crate) fn set_initial_adapters(&self, adapters: Vec<AdapterSpec>) {
        *self.adapters.write().unwrap_or_else(|p| p.into_inner()) = adapters;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn activity(&self) -> Activity {
        Activity::from_u8(self.activity.load(Ordering::Acquire))
    }

    pub fn is_busy(&self) -> bool {
        self.activity() != Activity::Idle
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Tokens currently held in the cache (as of the last finished operation).
    pub fn cached_tokens(&self) -> usize {
        self.cached_tokens.load(Ordering::Acquire)
    }

    pub fn adapters(&self) -> Vec<AdapterSpec> {
        self.adapters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            model_path: self.model_path.clone(),
            metadata: self.metadata.clone(),
            config: self.config.clone(),
            busy: self.is_busy(),
            activity: self.activity(),
            cached_tokens: self.cached_tokens(),
            adapters: self.adapters(),
            invalid: self.is_invalid(),
        }
    }

    /// Configuration signature snapshots must carry to be restored here.
    pub fn signature(&self) -> SnapshotSignature {
        SnapshotSignature {
            context_length: self.config.context_length,
            n_embd: self.metadata.n_embd,
            n_vocab: self.metadata.n_vocab,
            cache_type_k: self.config.cache_type_k,
            cache_type_v: self.config.cache_type_v,
            model_fingerprint: self.metadata.fingerprint(),
        }
    }

    /// Take the busy flag or fail with `Busy`.
    pub(crate) fn acquire(&self, activity: Activity) -> Result<ActiveGuard<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::InvalidSession("session has been destroyed".to_string()));
        }
        if self.is_invalid() {
            return Err(SessionError::InvalidSession(
                "engine failed; the session must be recreated".to_string(),
            ));
        }

        let inner = match self.inner.try_lock() {
            Ok(inner) => inner,
            Err(TryLockError::WouldBlock) => {
                self.metrics.busy_rejections.inc();
                debug!(session_id = %self.id, activity = ?self.activity(), "Rejected: session busy");
                return Err(SessionError::Busy);
            }
            Err(TryLockError::Poisoned(_)) => {
                self.invalid.store(true, Ordering::Release);
                return Err(SessionError::InvalidSession(
                    "a previous operation panicked".to_string(),
                ));
            }
        };
        if inner.engine.is_none() {
            return Err(SessionError::InvalidSession("engine has been released".to_string()));
        }

        let run = self.next_run.fetch_add(1, Ordering::AcqRel) + 1;
        self.current_run.store(run, Ordering::Release);
        self.activity.store(activity as u8, Ordering::Release);
        Ok(ActiveGuard {
            session: self,
            inner,
            run,
        })
    }

    /// Like [`acquire`](Self::acquire) for maintenance operations, which report a
    /// running generation as an invalid session state.
    fn acquire_idle(&self, activity: Activity, what: &str) -> Result<ActiveGuard<'_>> {
        self.acquire(activity).map_err(|e| match e {
            SessionError::Busy => SessionError::InvalidSession(format!(
                "cannot {what} while an operation is running"
            )),
            other => other,
        })
    }

    fn require_context(&self) -> Result<()> {
        if self.config.vocabulary_only {
            return Err(SessionError::Capability(
                "session was loaded with vocabulary only".to_string(),
            ));
        }
        Ok(())
    }

    fn engine_failed(&self, err: &SessionError) {
        if err.kind() == ErrorKind::Engine {
            self.invalid.store(true, Ordering::Release);
            warn!(session_id = %self.id, error = %err, "Session invalidated by engine error");
        }
    }

    /// Request cancellation of the running operation. No-op when idle.
    pub fn cancel(&self) -> bool {
        let run = self.current_run.load(Ordering::Acquire);
        if run == 0 {
            return false;
        }
        self.cancel_target(run);
        info!(session_id = %self.id, run, activity = ?self.activity(), "Cancellation requested");
        true
    }

    fn cancel_target(&self, run: u64) {
        self.cancel_run.store(run, Ordering::Release);
    }

    pub fn tokenize(&self, text: &str, add_special: bool) -> Vec<TokenId> {
        self.vocab.tokenize(text, add_special)
    }

    pub fn detokenize(&self, tokens: &[TokenId]) -> String {
        self.vocab.detokenize(tokens)
    }

    /// Render chat messages into a prompt. The template is the first usable of
    /// `template`, the session's `chat_template_override` and the model's own.
    /// Does not touch the engine, so it also works while busy.
    pub fn format_chat(
        &self,
        messages: &[ChatMessage],
        template: Option<&str>,
        add_generation_prompt: bool,
    ) -> Result<FormattedChat> {
        let templates = ChatTemplates {
            request: template,
            session: self.config.chat_template_override.as_deref(),
            model: self.metadata.chat_template.as_deref(),
        };
        chat::format_chat(
            messages,
            templates,
            self.config.reasoning_format,
            add_generation_prompt,
        )
        .map_err(|e| match e {
            ChatError::NoMessages => SessionError::Configuration(e.to_string()),
            ChatError::NoTemplate => SessionError::Capability(e.to_string()),
        })
    }

    /// Run a completion to a terminal state, streaming accepted tokens to `on_chunk`.
    pub fn generate(
        &self,
        request: GenerationRequest,
        on_chunk: &mut dyn FnMut(StreamChunk) -> StreamControl,
    ) -> Result<GenerationResult> {
        request
            .validate(self.metadata.n_vocab)
            .map_err(SessionError::Configuration)?;
        self.require_context()?;

        let mut guard = self.acquire(Activity::PromptIngestion)?;
        let start = Instant::now();
        info!(
            session_id = %self.id,
            n_predict = request.n_predict,
            stop = request.stop.len(),
            "Generation started"
        );

        // Terminal states are published by the guard when the lock is released.
        let on_state = |state: GenerationState| {
            if !state.is_terminal() {
                self.activity.store(Activity::from(state) as u8, Ordering::Release);
            }
        };
        let cancel = guard.cancellation();
        let inner = &mut *guard.inner;
        let engine = inner
            .engine
            .as_mut()
            .ok_or_else(|| SessionError::InvalidSession("engine has been released".to_string()))?;
        let outcome = Controller::new(
            engine.as_mut(),
            &mut inner.tokens,
            self.vocab.as_ref(),
            &cancel,
            self.config.batch_size,
            &on_state,
        )
        .run(request, on_chunk);

        let elapsed = start.elapsed().as_secs_f64();
        match outcome {
            Ok(mut result) => {
                let (reasoning, text) =
                    chat::split_reasoning(&result.text, self.config.reasoning_format);
                if reasoning.is_some() {
                    result.reasoning = reasoning;
                    result.text = text;
                }
                self.metrics.record_generation(
                    result.final_state,
                    result.tokens_evaluated,
                    result.tokens_predicted,
                    elapsed,
                );
                Ok(result)
            }
            Err(failure) => {
                let partial = failure.partial;
                self.metrics.record_generation(
                    GenerationState::Failed,
                    partial.tokens_evaluated,
                    partial.tokens_predicted,
                    elapsed,
                );
                let err = SessionError::GenerationFailed {
                    source: failure.source,
                    partial: Box::new(partial),
                };
                self.engine_failed(&err);
                Err(err)
            }
        }
    }

    /// Run a completion without streaming.
    pub fn complete(&self, request: GenerationRequest) -> Result<GenerationResult> {
        self.generate(request, &mut |_| StreamControl::Continue)
    }

    /// Compute an embedding. The cache is not touched.
    pub fn embed(&self, text: &str, normalize: Normalize) -> Result<EmbeddingResult> {
        if !self.config.embedding {
            return Err(SessionError::Capability(
                "session was not created in embedding mode".to_string(),
            ));
        }
        let mut guard = self.acquire(Activity::Embedding)?;
        let normalize = normalize.resolve(self.config.normalize_embeddings);
        let pooling = self.config.pooling;
        let engine = guard.engine()?;

        embedding::embed(engine.as_mut(), self.vocab.as_ref(), text, pooling, normalize).map_err(|e| {
            let err = SessionError::from(e);
            self.engine_failed(&err);
            err
        })
    }

    /// Write up to `max_tokens` cached tokens (`<= 0` = all) and their state to `path`.
    pub fn save_snapshot(&self, path: &Path, max_tokens: i64) -> Result<usize> {
        let mut guard = self.acquire_idle(Activity::Snapshot, "save a snapshot")?;
        let available = guard.tokens.len();
        let n = if max_tokens <= 0 {
            available
        } else {
            (max_tokens as usize).min(available)
        };

        let state = guard.engine()?.export_state(n)?;
        let bytes = snapshot::write_snapshot(
            path,
            &self.signature(),
            &guard.tokens[..n],
            &state,
            self.snapshot.zstd_level,
        )?;

        info!(
            session_id = %self.id,
            path = %path.display(),
            tokens = n,
            bytes,
            "Snapshot saved"
        );
        Ok(n)
    }

    /// Replace the cache with a snapshot's contents. On any error the cache is
    /// left as it was.
    pub fn load_snapshot(&self, path: &Path) -> Result<SnapshotLoad> {
        let mut guard = self.acquire_idle(Activity::Snapshot, "load a snapshot")?;
        let data = snapshot::read_snapshot(path, &self.signature())?;

        guard
            .engine()?
            .import_state(&data.state, data.tokens.len())
            .map_err(|e| SessionError::Format(e.to_string()))?;
        guard.tokens = data.tokens;

        let prompt = self.vocab.detokenize(&guard.tokens);
        info!(
            session_id = %self.id,
            path = %path.display(),
            tokens = guard.tokens.len(),
            "Snapshot loaded"
        );
        Ok(SnapshotLoad {
            tokens_loaded: guard.tokens.len(),
            prompt,
        })
    }

    /// Replace the applied adapter set. Clears the cache.
    pub fn apply_adapters(&self, adapters: Vec<AdapterSpec>) -> Result<()> {
        if let Some(bad) = adapters.iter().find(|a| !a.scale.is_finite()) {
            return Err(SessionError::Configuration(format!(
                "adapter scale for {} is not finite",
                bad.path.display()
            )));
        }
        let mut guard = self.acquire_idle(Activity::Adapters, "change adapters")?;
        guard.engine()?.set_adapters(&adapters)?;
        guard.clear_cache();

        info!(
            session_id = %self.id,
            adapters = adapters.len(),
            paths = ?adapters.iter().map(|a| a.path.display().to_string()).collect::<Vec<_>>(),
            "Adapters applied"
        );
        *self.adapters.write().unwrap_or_else(|p| p.into_inner()) = adapters;
        Ok(())
    }

    /// Restore base weights. Idempotent.
    pub fn remove_adapters(&self) -> Result<()> {
        let mut guard = self.acquire_idle(Activity::Adapters, "change adapters")?;
        let mut adapters = self.adapters.write().unwrap_or_else(|p| p.into_inner());
        if adapters.is_empty() {
            return Ok(());
        }
        guard.engine()?.set_adapters(&[])?;
        guard.clear_cache();
        adapters.clear();
        info!(session_id = %self.id, "Adapters removed");
        Ok(())
    }

    /// Throughput benchmark. Clears the cache afterwards.
    pub fn bench(&self, params: BenchParams) -> Result<BenchResult> {
        self.require_context()?;
        params
            .validate(self.config.context_length)
            .map_err(SessionError::Configuration)?;

        let mut guard = self.acquire(Activity::Bench)?;
        let cancel = guard.cancellation();
        let batch = self.config.batch_size;
        let engine = guard.engine()?;
        let outcome = run_bench(engine.as_mut(), params, batch, &cancel);
        guard.tokens.clear();
        outcome.map_err(|e| {
            let err = SessionError::from(e);
            self.engine_failed(&err);
            err
        })
    }

    /// Release the engine if idle. Later operations fail with `InvalidSession`.
    pub(crate) fn release(&self) -> Result<()> {
        let mut inner = match self.inner.try_lock() {
            Ok(inner) => inner,
            Err(TryLockError::WouldBlock) => {
                self.metrics.busy_rejections.inc();
                return Err(SessionError::Busy);
            }
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        self.closed.store(true, Ordering::Release);
        inner.engine = None;
        inner.tokens.clear();
        self.cached_tokens.store(0, Ordering::Release);
        Ok(())
    }

    /// Engine call counters as of the last finished operation; `None` once the
    /// engine is released. Never contends with a running operation.
    pub fn engine_stats(&self) -> Option<EngineStats> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(*self.stats.read().unwrap_or_else(|p| p.into_inner()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.metrics.live_sessions.dec();
        debug!(session_id = %self.id, "Session dropped");
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Stream registry: the single authoritative owner of in-flight generation
//! state.
//!
//! Consumers hold only a stream id and a read-only queue handle; every
//! lifecycle decision funnels through the registry. Invariants enforced
//! here:
//!
//! - Admission is arrival-ordered and capacity-bounded; there is no
//!   priority at admission time.
//! - Exactly one terminal transition per record. Late runtime events for a
//!   finished stream are dropped idempotently during a grace period, after
//!   which the id is unknown and dropped with a debug log.
//! - The cancel hook fires at most once per stream, whether the cancel came
//!   from a timeout, the consumer, or an explicit call.
//! - TTFT is set exactly once, on the first token.

use crate::config::RegistryConfig;
use crate::errors::{EngineError, Result};
use crate::metrics;
use crate::metrics_constants::{
    METRIC_ACTIVE_STREAMS, METRIC_ADMIT_REJECTS_TOTAL, METRIC_STREAMS_FINISHED_TOTAL,
    METRIC_TTFT_MS,
};
use crate::sync::math::ewma;
use crate::sync::BoundedQueue;
use crate::transport::EventSink;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use weft_protocol::{ChunkEvent, StatsEvent, StreamEvent, StreamEventBody, TerminalEvent, TerminalKind};

static ACTIVE_STREAMS: LazyLock<Gauge> =
    LazyLock::new(|| metrics::gauge(METRIC_ACTIVE_STREAMS, "Streams currently active"));
static STREAMS_FINISHED: LazyLock<CounterVec> = LazyLock::new(|| {
    metrics::counter_vec(
        Opts::new(
            METRIC_STREAMS_FINISHED_TOTAL,
            "Total streams finished, by terminal state",
        ),
        &["state"],
    )
});
static ADMIT_REJECTS: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(
        METRIC_ADMIT_REJECTS_TOTAL,
        "Total admissions rejected at capacity or by the admission guard",
    )
});
static TTFT_HISTOGRAM: LazyLock<Histogram> = LazyLock::new(|| {
    metrics::histogram(
        HistogramOpts::new(METRIC_TTFT_MS, "Time to first token in milliseconds")
            .buckets(metrics::latency_buckets_ms()),
    )
});

/// Weight of a new sample in the rolling TTFT / throughput averages.
const ROLLING_ALPHA: f64 = 0.2;

// ============================================================================
// Stream items and records
// ============================================================================

/// One generated token as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct TokenChunk {
    /// Token text.
    pub token: String,
    /// Vocabulary id.
    pub token_id: u32,
    /// Log-probability, when reported.
    pub logprob: Option<f32>,
}

/// Final metadata delivered after the last token of a successful stream.
#[derive(Debug, Clone)]
pub struct GenerationSummary {
    /// Tokens generated.
    pub tokens_generated: u64,
    /// Decode throughput.
    pub tokens_per_second: f64,
    /// Time to first token in milliseconds.
    pub time_to_first_token_ms: f64,
    /// Total stream wall time in milliseconds.
    pub total_time_ms: f64,
    /// Runtime-reported finish reason.
    pub finish_reason: Option<String>,
}

/// Items flowing through a stream's output queue.
#[derive(Debug, Clone)]
pub enum GenerationItem {
    /// One token.
    Token(TokenChunk),
    /// Terminal metadata for a successful stream.
    Metadata(GenerationSummary),
    /// Terminal error.
    Error(EngineError),
}

/// Terminal state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Events still flowing.
    Active,
    /// Ran to completion.
    Completed,
    /// Cancelled by timeout, consumer, or runtime.
    Cancelled,
    /// Failed.
    Errored,
}

impl StreamPhase {
    fn label(self) -> &'static str {
        match self {
            StreamPhase::Active => "active",
            StreamPhase::Completed => "completed",
            StreamPhase::Cancelled => "cancelled",
            StreamPhase::Errored => "errored",
        }
    }
}

struct TerminalSlot {
    phase: StreamPhase,
    reason: Option<String>,
}

/// The in-flight state of one generation stream.
pub struct StreamRecord {
    stream_id: String,
    model_id: String,
    lane: &'static str,
    admitted_at: Instant,
    timeout: Duration,
    queue: Arc<BoundedQueue<GenerationItem>>,
    last_activity_ms: AtomicU64,
    tokens: AtomicU64,
    ttft: OnceLock<Duration>,
    last_stats: Mutex<Option<StatsEvent>>,
    terminal: Mutex<TerminalSlot>,
    cancel_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl StreamRecord {
    /// Stream id.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Owning model id.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Which runtime lane serves this stream (`baseline` or `variant`).
    #[must_use]
    pub fn lane(&self) -> &'static str {
        self.lane
    }

    /// Current terminal phase.
    #[must_use]
    pub fn phase(&self) -> StreamPhase {
        self.terminal.lock().phase
    }

    /// Time to first token, once observed.
    #[must_use]
    pub fn ttft(&self) -> Option<Duration> {
        self.ttft.get().copied()
    }

    /// Tokens routed so far.
    #[must_use]
    pub fn token_count(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// The record's output queue; consumers shift from this.
    #[must_use]
    pub fn queue(&self) -> Arc<BoundedQueue<GenerationItem>> {
        Arc::clone(&self.queue)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.admitted_at.elapsed().as_millis() as u64, Ordering::Release);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.admitted_at.elapsed().saturating_sub(last)
    }
}

impl std::fmt::Debug for StreamRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRecord")
            .field("stream_id", &self.stream_id)
            .field("model_id", &self.model_id)
            .field("phase", &self.phase())
            .field("tokens", &self.token_count())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Terminal outcome broadcast to QoS and canary observers.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// Stream id.
    pub stream_id: String,
    /// Owning model.
    pub model_id: String,
    /// Runtime lane that served the stream.
    pub lane: &'static str,
    /// How the stream ended.
    pub phase: StreamPhase,
    /// Time to first token, if any token arrived.
    pub ttft_ms: Option<f64>,
    /// Tokens delivered.
    pub tokens: u64,
    /// Total wall time.
    pub total_time_ms: f64,
    /// Decode throughput over the stream's lifetime.
    pub tokens_per_second: f64,
}

#[derive(Debug, Default)]
struct RollingAverages {
    ttft_ms: Option<f64>,
    tokens_per_second: Option<f64>,
}

/// Point-in-time registry statistics.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Streams currently active.
    pub active: usize,
    /// Admission ceiling.
    pub max_active: usize,
    /// Total completed.
    pub completed: u64,
    /// Total cancelled.
    pub cancelled: u64,
    /// Total errored.
    pub errored: u64,
    /// Rolling TTFT average in milliseconds.
    pub avg_ttft_ms: Option<f64>,
    /// Rolling throughput average.
    pub avg_tokens_per_second: Option<f64>,
}

/// Tracks every in-flight generation stream and routes runtime events.
pub struct StreamRegistry {
    config: RegistryConfig,
    records: DashMap<String, Arc<StreamRecord>>,
    active: AtomicUsize,
    admission_open: AtomicBool,
    completed: AtomicU64,
    cancelled: AtomicU64,
    errored: AtomicU64,
    rolling: Mutex<RollingAverages>,
    changes: broadcast::Sender<StreamOutcome>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamRegistry {
    /// Create a registry and start its inactivity sweeper.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        let registry = Arc::new(Self {
            config,
            records: DashMap::new(),
            active: AtomicUsize::new(0),
            admission_open: AtomicBool::new(true),
            completed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            rolling: Mutex::new(RollingAverages::default()),
            changes,
            sweeper: Mutex::new(None),
        });
        let sweep_handle = tokio::spawn(Self::sweep_loop(Arc::clone(&registry)));
        *registry.sweeper.lock() = Some(sweep_handle);
        registry
    }

    /// Admit a new stream.
    ///
    /// `cancel_hook` is invoked at most once, when the stream is cancelled
    /// host-side (timeout, consumer abort, or explicit cancel); it is how
    /// the runtime learns to stop decoding.
    ///
    /// # Errors
    ///
    /// `AdmitRejected` at capacity or while the admission guard is engaged;
    /// `Validation` for a duplicate stream id.
    pub fn admit(
        self: &Arc<Self>,
        stream_id: &str,
        model_id: &str,
        lane: &'static str,
        timeout: Option<Duration>,
        queue: Arc<BoundedQueue<GenerationItem>>,
        cancel_hook: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<StreamRecord>> {
        if !self.admission_open.load(Ordering::Acquire) {
            ADMIT_REJECTS.inc();
            return Err(EngineError::AdmitRejected(
                "admission guard is engaged".into(),
            ));
        }

        // Reserve a slot before inserting so concurrent admissions cannot
        // overshoot the ceiling.
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.config.max_active_streams {
                ADMIT_REJECTS.inc();
                return Err(EngineError::AdmitRejected(format!(
                    "{} active streams at the configured maximum",
                    current
                )));
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let record = Arc::new(StreamRecord {
            stream_id: stream_id.to_string(),
            model_id: model_id.to_string(),
            lane,
            admitted_at: Instant::now(),
            timeout: timeout
                .unwrap_or_else(|| Duration::from_millis(self.config.default_stream_timeout_ms)),
            queue,
            last_activity_ms: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
            ttft: OnceLock::new(),
            last_stats: Mutex::new(None),
            terminal: Mutex::new(TerminalSlot {
                phase: StreamPhase::Active,
                reason: None,
            }),
            cancel_hook: Mutex::new(Some(cancel_hook)),
        });

        if self
            .records
            .insert(stream_id.to_string(), Arc::clone(&record))
            .is_some()
        {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::Validation(format!(
                "duplicate stream id {stream_id}"
            )));
        }

        ACTIVE_STREAMS.set(self.active.load(Ordering::Acquire) as f64);
        Ok(record)
    }

    /// Route one token chunk. Unknown ids and terminal streams drop the
    /// event.
    pub async fn handle_chunk(self: &Arc<Self>, stream_id: &str, chunk: ChunkEvent) {
        let Some(record) = self.lookup_active(stream_id) else {
            return;
        };
        record.touch();
        if record.ttft.get().is_none() {
            let ttft = record.admitted_at.elapsed();
            if record.ttft.set(ttft).is_ok() {
                let ttft_ms = ttft.as_secs_f64() * 1000.0;
                TTFT_HISTOGRAM.observe(ttft_ms);
                let mut rolling = self.rolling.lock();
                rolling.ttft_ms = Some(match rolling.ttft_ms {
                    Some(prev) => ewma(prev, ttft_ms, ROLLING_ALPHA),
                    None => ttft_ms,
                });
            }
        }
        record.tokens.fetch_add(1, Ordering::AcqRel);

        let item = GenerationItem::Token(TokenChunk {
            token: chunk.token,
            token_id: chunk.token_id,
            logprob: chunk.logprob,
        });
        // Suspending here backpressures the transport reader, and through
        // the pipe, the runtime.
        if let Err(err) = record.queue.push(item).await {
            debug!(stream_id, error = %err, "token dropped into failed queue");
        }
    }

    /// Record runtime-reported statistics for a stream.
    pub fn handle_stats(&self, stream_id: &str, stats: StatsEvent) {
        if let Some(record) = self.lookup_active(stream_id) {
            record.touch();
            *record.last_stats.lock() = Some(stats);
        }
    }

    /// Route a terminal lifecycle event from the runtime.
    pub async fn handle_event(self: &Arc<Self>, stream_id: &str, event: TerminalEvent) {
        let Some(record) = self.lookup_active(stream_id) else {
            return;
        };
        match event.event {
            TerminalKind::Completed => {
                let summary = self.build_summary(&record, event.finish_reason.clone());
                // Metadata is the last queue item of a successful stream.
                if let Err(err) = record
                    .queue
                    .push(GenerationItem::Metadata(summary))
                    .await
                {
                    debug!(stream_id, error = %err, "metadata dropped into failed queue");
                }
                self.finish(&record, StreamPhase::Completed, event.finish_reason, None);
            }
            TerminalKind::Cancelled => {
                self.finish(
                    &record,
                    StreamPhase::Cancelled,
                    Some("runtime_cancelled".into()),
                    None,
                );
            }
            TerminalKind::Error => {
                let err = event
                    .error
                    .as_ref()
                    .map(EngineError::from_wire)
                    .unwrap_or_else(|| {
                        EngineError::Generation("runtime reported an unspecified error".into())
                    });
                self.finish(&record, StreamPhase::Errored, None, Some(err));
            }
        }
    }

    /// Cancel a stream host-side. Idempotent; the cancel hook fires on the
    /// first call only.
    pub fn cancel(self: &Arc<Self>, stream_id: &str, reason: &str) {
        let Some(record) = self.records.get(stream_id).map(|r| Arc::clone(&r)) else {
            return;
        };
        self.finish(
            &record,
            StreamPhase::Cancelled,
            Some(reason.to_string()),
            None,
        );
    }

    /// Error one stream host-side. Used for dispatch failures that happen
    /// before the runtime ever saw the stream; the cancel hook does not
    /// fire.
    pub fn fail(self: &Arc<Self>, stream_id: &str, err: EngineError) {
        let Some(record) = self.records.get(stream_id).map(|r| Arc::clone(&r)) else {
            return;
        };
        self.finish(&record, StreamPhase::Errored, None, Some(err));
    }

    /// Error every active stream. Used when the transport dies.
    pub fn fail_all(self: &Arc<Self>, err: &EngineError) {
        let records: Vec<Arc<StreamRecord>> = self
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for record in records {
            self.finish(&record, StreamPhase::Errored, None, Some(err.clone()));
        }
    }

    /// Engage or release the admission guard (QoS `reject` remediation).
    pub fn set_admission_open(&self, open: bool) {
        self.admission_open.store(open, Ordering::Release);
    }

    /// Whether admissions are currently accepted.
    #[must_use]
    pub fn is_admission_open(&self) -> bool {
        self.admission_open.load(Ordering::Acquire)
    }

    /// Active streams over the admission ceiling, 0.0 - 1.0.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.active.load(Ordering::Acquire) as f64 / self.config.max_active_streams as f64
    }

    /// Streams currently active.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let rolling = self.rolling.lock();
        RegistrySnapshot {
            active: self.active.load(Ordering::Acquire),
            max_active: self.config.max_active_streams,
            completed: self.completed.load(Ordering::Acquire),
            cancelled: self.cancelled.load(Ordering::Acquire),
            errored: self.errored.load(Ordering::Acquire),
            avg_ttft_ms: rolling.ttft_ms,
            avg_tokens_per_second: rolling.tokens_per_second,
        }
    }

    /// Subscribe to terminal outcomes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamOutcome> {
        self.changes.subscribe()
    }

    /// Stop the inactivity sweeper.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    fn lookup_active(&self, stream_id: &str) -> Option<Arc<StreamRecord>> {
        match self.records.get(stream_id) {
            Some(record) => {
                let record = Arc::clone(&record);
                if record.phase() == StreamPhase::Active {
                    Some(record)
                } else {
                    // Grace-period drop: the stream finished but its record
                    // has not been reaped yet.
                    None
                }
            }
            None => {
                debug!(stream_id, "event for unknown stream, dropping");
                None
            }
        }
    }

    fn build_summary(
        &self,
        record: &Arc<StreamRecord>,
        finish_reason: Option<String>,
    ) -> GenerationSummary {
        let total_time_ms = record.admitted_at.elapsed().as_secs_f64() * 1000.0;
        let tokens = record.token_count();
        let stats = record.last_stats.lock().clone();
        match stats {
            Some(stats) => GenerationSummary {
                tokens_generated: stats.tokens_generated,
                tokens_per_second: stats.tokens_per_second,
                time_to_first_token_ms: stats.time_to_first_token,
                total_time_ms: stats.total_time,
                finish_reason,
            },
            None => GenerationSummary {
                tokens_generated: tokens,
                tokens_per_second: if total_time_ms > 0.0 {
                    tokens as f64 / (total_time_ms / 1000.0)
                } else {
                    0.0
                },
                time_to_first_token_ms: record
                    .ttft()
                    .map(|d| d.as_secs_f64() * 1000.0)
                    .unwrap_or(0.0),
                total_time_ms,
                finish_reason,
            },
        }
    }

    /// The single terminal transition point. Returns whether this call won.
    fn finish(
        self: &Arc<Self>,
        record: &Arc<StreamRecord>,
        phase: StreamPhase,
        reason: Option<String>,
        error: Option<EngineError>,
    ) -> bool {
        {
            let mut terminal = record.terminal.lock();
            if terminal.phase != StreamPhase::Active {
                return false;
            }
            terminal.phase = phase;
            terminal.reason = reason;
        }

        // Cancellations propagate to the runtime through the hook, exactly
        // once per stream.
        if phase == StreamPhase::Cancelled {
            if let Some(hook) = record.cancel_hook.lock().take() {
                hook();
            }
        } else {
            // Consume the hook so a later cancel cannot fire it.
            record.cancel_hook.lock().take();
        }

        match (&phase, error) {
            (StreamPhase::Errored, Some(err)) => record.queue.fail(err),
            _ => record.queue.close(),
        }

        self.active.fetch_sub(1, Ordering::AcqRel);
        ACTIVE_STREAMS.set(self.active.load(Ordering::Acquire) as f64);
        STREAMS_FINISHED.with_label_values(&[phase.label()]).inc();
        match phase {
            StreamPhase::Completed => self.completed.fetch_add(1, Ordering::AcqRel),
            StreamPhase::Cancelled => self.cancelled.fetch_add(1, Ordering::AcqRel),
            StreamPhase::Errored => self.errored.fetch_add(1, Ordering::AcqRel),
            StreamPhase::Active => 0,
        };

        let total_time_ms = record.admitted_at.elapsed().as_secs_f64() * 1000.0;
        let tokens = record.token_count();
        let tokens_per_second = if total_time_ms > 0.0 {
            tokens as f64 / (total_time_ms / 1000.0)
        } else {
            0.0
        };
        if phase == StreamPhase::Completed && tokens > 0 {
            let mut rolling = self.rolling.lock();
            rolling.tokens_per_second = Some(match rolling.tokens_per_second {
                Some(prev) => ewma(prev, tokens_per_second, ROLLING_ALPHA),
                None => tokens_per_second,
            });
        }

        let _ = self.changes.send(StreamOutcome {
            stream_id: record.stream_id.clone(),
            model_id: record.model_id.clone(),
            lane: record.lane,
            phase,
            ttft_ms: record.ttft().map(|d| d.as_secs_f64() * 1000.0),
            tokens,
            total_time_ms,
            tokens_per_second,
        });

        // Keep the record around for a grace period so late runtime events
        // are dropped quietly instead of logged as unknown.
        let registry = Arc::clone(self);
        let stream_id = record.stream_id.clone();
        let grace = Duration::from_millis(self.config.grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.records.remove(&stream_id);
        });

        true
    }

    async fn sweep_loop(registry: Arc<Self>) {
        let interval = Duration::from_millis(registry.config.sweep_interval_ms.max(10));
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let stale: Vec<String> = registry
                .records
                .iter()
                .filter(|entry| {
                    entry.value().phase() == StreamPhase::Active
                        && entry.value().idle_for() > entry.value().timeout
                })
                .map(|entry| entry.key().clone())
                .collect();
            for stream_id in stale {
                warn!(stream_id = %stream_id, "stream inactive past its timeout, cancelling");
                registry.cancel(&stream_id, "timeout");
            }
        }
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("active", &self.active_count())
            .field("max_active", &self.config.max_active_streams)
            .finish()
    }
}

/// Adapter hanging a registry off a transport as its [`EventSink`].
pub struct RegistrySink(pub Arc<StreamRegistry>);

#[async_trait]
impl EventSink for RegistrySink {
    async fn on_event(&self, event: StreamEvent) {
        match event.body {
            StreamEventBody::Chunk(chunk) => self.0.handle_chunk(&event.stream_id, chunk).await,
            StreamEventBody::Stats(stats) => self.0.handle_stats(&event.stream_id, stats),
            StreamEventBody::Event(terminal) => {
                self.0.handle_event(&event.stream_id, terminal).await;
            }
        }
    }

    async fn on_closed(&self, error: &EngineError) {
        self.0.fail_all(error);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RegistryConfig {
        RegistryConfig {
            max_active_streams: 2,
            default_stream_timeout_ms: 60_000,
            grace_ms: 100,
            queue_capacity: 8,
            sweep_interval_ms: 20,
        }
    }

    fn admit(
        registry: &Arc<StreamRegistry>,
        id: &str,
    ) -> (Arc<StreamRecord>, Arc<std::sync::atomic::AtomicU32>) {
        let cancels = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let cancels2 = Arc::clone(&cancels);
        let queue = Arc::new(BoundedQueue::new(8));
        let record = registry
            .admit(
                id,
                "test-model",
                "baseline",
                None,
                queue,
                Box::new(move || {
                    cancels2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        (record, cancels)
    }

    fn chunk(token: &str) -> ChunkEvent {
        ChunkEvent {
            token: token.to_string(),
            token_id: 1,
            logprob: None,
            is_final: false,
        }
    }

    fn completed_event() -> TerminalEvent {
        TerminalEvent {
            event: TerminalKind::Completed,
            finish_reason: Some("stop".into()),
            error: None,
            is_final: true,
        }
    }

    #[tokio::test]
    async fn test_admission_capacity() {
        let registry = StreamRegistry::new(test_config());
        let (_a, _) = admit(&registry, "a");
        let (_b, _) = admit(&registry, "b");

        let queue = Arc::new(BoundedQueue::new(8));
        let err = registry
            .admit("c", "m", "baseline", None, queue, Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, EngineError::AdmitRejected(_)));
        assert_eq!(registry.active_count(), 2);
    }

    #[tokio::test]
    async fn test_admission_guard() {
        let registry = StreamRegistry::new(test_config());
        registry.set_admission_open(false);
        let queue = Arc::new(BoundedQueue::new(8));
        let err = registry
            .admit("a", "m", "baseline", None, queue, Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, EngineError::AdmitRejected(_)));
        registry.set_admission_open(true);
        let (_record, _) = admit(&registry, "a");
    }

    #[tokio::test]
    async fn test_duplicate_stream_id_rejected() {
        let registry = StreamRegistry::new(test_config());
        let (_a, _) = admit(&registry, "dup");
        let queue = Arc::new(BoundedQueue::new(8));
        let err = registry
            .admit("dup", "m", "baseline", None, queue, Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        // The failed admission must not leak an active slot.
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_chunks_route_and_ttft_sets_once() {
        let registry = StreamRegistry::new(test_config());
        let (record, _) = admit(&registry, "s");

        registry.handle_chunk("s", chunk("H")).await;
        let first_ttft = record.ttft().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.handle_chunk("s", chunk("i")).await;
        assert_eq!(record.ttft().unwrap(), first_ttft, "TTFT must set once");
        assert_eq!(record.token_count(), 2);

        let queue = record.queue();
        match queue.shift().await.unwrap().unwrap() {
            GenerationItem::Token(t) => assert_eq!(t.token, "H"),
            other => panic!("expected token, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completed_pushes_metadata_then_closes() {
        let registry = StreamRegistry::new(test_config());
        let (record, _) = admit(&registry, "s");
        registry.handle_chunk("s", chunk("x")).await;
        registry.handle_event("s", completed_event()).await;

        let queue = record.queue();
        assert!(matches!(
            queue.shift().await.unwrap().unwrap(),
            GenerationItem::Token(_)
        ));
        match queue.shift().await.unwrap().unwrap() {
            GenerationItem::Metadata(summary) => {
                assert_eq!(summary.tokens_generated, 1);
                assert_eq!(summary.finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("expected metadata, got {other:?}"),
        }
        assert!(queue.shift().await.unwrap().is_none());
        assert_eq!(record.phase(), StreamPhase::Completed);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_transition_happens_exactly_once() {
        let registry = StreamRegistry::new(test_config());
        let (record, _) = admit(&registry, "s");
        let mut outcomes = registry.subscribe();

        registry.handle_event("s", completed_event()).await;
        // Second terminal (error) for the same stream must be dropped.
        registry
            .handle_event(
                "s",
                TerminalEvent {
                    event: TerminalKind::Error,
                    finish_reason: None,
                    error: None,
                    is_final: true,
                },
            )
            .await;

        assert_eq!(record.phase(), StreamPhase::Completed);
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.phase, StreamPhase::Completed);
        assert!(
            outcomes.try_recv().is_err(),
            "only one outcome per stream may be broadcast"
        );
        assert_eq!(registry.snapshot().completed, 1);
        assert_eq!(registry.snapshot().errored, 0);
    }

    #[tokio::test]
    async fn test_cancel_fires_hook_once_and_drops_late_tokens() {
        let registry = StreamRegistry::new(test_config());
        let (record, cancels) = admit(&registry, "s");

        registry.cancel("s", "consumer_abort");
        registry.cancel("s", "consumer_abort");
        assert_eq!(cancels.load(Ordering::SeqCst), 1, "hook must fire once");
        assert_eq!(record.phase(), StreamPhase::Cancelled);

        // Late tokens during the grace period disappear quietly.
        registry.handle_chunk("s", chunk("late")).await;
        assert_eq!(record.token_count(), 0);
    }

    #[tokio::test]
    async fn test_runtime_terminal_does_not_fire_cancel_hook() {
        let registry = StreamRegistry::new(test_config());
        let (_record, cancels) = admit(&registry, "s");
        registry.handle_event("s", completed_event()).await;
        registry.cancel("s", "too_late");
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_event_fails_queue() {
        let registry = StreamRegistry::new(test_config());
        let (record, _) = admit(&registry, "s");
        registry
            .handle_event(
                "s",
                TerminalEvent {
                    event: TerminalKind::Error,
                    finish_reason: None,
                    error: Some(weft_protocol::WireError {
                        code: "GENERATION_ERROR".into(),
                        message: "decode blew up".into(),
                    }),
                    is_final: true,
                },
            )
            .await;
        let err = record.queue().shift().await.unwrap_err();
        assert!(matches!(err, EngineError::Generation(_)));
        assert_eq!(record.phase(), StreamPhase::Errored);
    }

    #[tokio::test]
    async fn test_fail_all_errors_every_active_stream() {
        let registry = StreamRegistry::new(test_config());
        let (a, _) = admit(&registry, "a");
        let (b, _) = admit(&registry, "b");
        registry.fail_all(&EngineError::TransportClosed("runtime died".into()));
        assert_eq!(a.phase(), StreamPhase::Errored);
        assert_eq!(b.phase(), StreamPhase::Errored);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_inactivity_timeout_cancels_with_hook() {
        let registry = StreamRegistry::new(test_config());
        let cancels = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let cancels2 = Arc::clone(&cancels);
        let queue = Arc::new(BoundedQueue::new(8));
        let record = registry
            .admit(
                "s",
                "m",
                "baseline",
                Some(Duration::from_millis(40)),
                queue,
                Box::new(move || {
                    cancels2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if record.phase() == StreamPhase::Cancelled {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_reaped_after_grace() {
        let registry = StreamRegistry::new(test_config());
        let (_record, _) = admit(&registry, "s");
        registry.handle_event("s", completed_event()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.records.get("s").is_none());
    }
}

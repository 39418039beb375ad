// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Continuous generate-batcher.
//!
//! Concurrent generate calls are coalesced into per-model micro-batches. A
//! partition flushes when any of the following holds:
//!
//! - partition size reaches the adaptive target,
//! - an `urgent` request arrives (immediate flush, that partition only),
//! - the hold window reaches its maximum,
//! - the minimum batch size is met and the minimum hold has elapsed.
//!
//! Background-priority work extends the partition's hold once, on first
//! visit, to encourage larger batches. After each dispatch the observed
//! wall time adapts the per-model target size toward `target_batch_time`.
//! Dispatch pauses while the stream registry is saturated.

use crate::config::BatcherConfig;
use crate::errors::{EngineError, Result};
use crate::metrics;
use crate::metrics_constants::{
    METRIC_BATCH_DISPATCHES_TOTAL, METRIC_BATCH_PAUSES_TOTAL, METRIC_BATCH_SIZE_COUNT,
};
use crate::registry::StreamRegistry;
use crate::sync::AbortSignal;
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{Counter, Histogram, HistogramOpts};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use weft_protocol::{GenerateAck, GenerateParams, SamplingParams};

static BATCH_SIZES: LazyLock<Histogram> = LazyLock::new(|| {
    metrics::histogram(
        HistogramOpts::new(METRIC_BATCH_SIZE_COUNT, "Dispatched batch sizes")
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
    )
});
static BATCH_DISPATCHES: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(METRIC_BATCH_DISPATCHES_TOTAL, "Total batch dispatches")
});
static BATCH_PAUSES: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(
        METRIC_BATCH_PAUSES_TOTAL,
        "Total dispatch pauses caused by registry backpressure",
    )
});

/// Request priority. `Urgent` flushes its partition immediately;
/// `Background` tolerates longer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Flush immediately.
    Urgent,
    /// Normal traffic.
    Default,
    /// Latency-tolerant traffic.
    Background,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::Default => 1,
            Priority::Background => 2,
        }
    }
}

/// One generate call waiting to be batched.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Host-assigned stream id.
    pub stream_id: String,
    /// Target model; requests batch only with peers on the same model.
    pub model_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Sampling parameters.
    pub params: SamplingParams,
    /// Scheduling priority.
    pub priority: Priority,
    /// Caller abort; a request whose signal has tripped is never
    /// dispatched.
    pub abort: Option<AbortSignal>,
}

/// Where flushed batches go. Production implements this over the runtime
/// transport (with a sequential fallback when the runtime lacks
/// `batch_generate`); tests record batches.
#[async_trait]
pub trait BatchDispatcher: Send + Sync {
    /// Dispatch one batch; results answer requests positionally.
    async fn dispatch(
        &self,
        requests: Vec<GenerateParams>,
    ) -> Result<Vec<std::result::Result<GenerateAck, EngineError>>>;
}

struct PendingEntry {
    request: SubmitRequest,
    respond: oneshot::Sender<Result<GenerateAck>>,
}

struct Partition {
    entries: Vec<PendingEntry>,
    window_opened_at: Instant,
    hold_extended: bool,
}

enum BatcherMsg {
    Submit(PendingEntry),
    Cancel { stream_id: String },
    Feedback { model_id: String, wall: Duration },
}

/// Shared, externally adjustable batcher knobs. The QoS executor's
/// `scale_up` / `scale_down` handlers move `max_batch_size`.
#[derive(Debug)]
pub struct BatcherControl {
    min_batch_size: usize,
    max_batch_size: AtomicUsize,
    targets: Mutex<HashMap<String, usize>>,
}

impl BatcherControl {
    /// Current batch ceiling.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.load(Ordering::Acquire)
    }

    /// Adjust the batch ceiling; clamped to at least the minimum batch
    /// size.
    pub fn set_max_batch_size(&self, size: usize) {
        self.max_batch_size
            .store(size.max(self.min_batch_size), Ordering::Release);
    }

    /// Adaptive target for a model, when one has been learned.
    #[must_use]
    pub fn target_for(&self, model_id: &str) -> Option<usize> {
        self.targets.lock().get(model_id).copied()
    }
}

/// Priority-aware adaptive micro-batcher.
pub struct GenerateBatcher {
    tx: mpsc::Sender<BatcherMsg>,
    control: Arc<BatcherControl>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GenerateBatcher {
    /// Start a batcher worker over the given dispatcher.
    #[must_use]
    pub fn new(
        config: BatcherConfig,
        dispatcher: Arc<dyn BatchDispatcher>,
        registry: Arc<StreamRegistry>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1024);
        let control = Arc::new(BatcherControl {
            min_batch_size: config.min_batch_size,
            max_batch_size: AtomicUsize::new(config.max_batch_size),
            targets: Mutex::new(HashMap::new()),
        });
        let worker = tokio::spawn(run_worker(
            config,
            rx,
            tx.clone(),
            dispatcher,
            registry,
            Arc::clone(&control),
        ));
        Arc::new(Self {
            tx,
            control,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Externally adjustable knobs.
    #[must_use]
    pub fn control(&self) -> Arc<BatcherControl> {
        Arc::clone(&self.control)
    }

    /// Enqueue a generate call and await its dispatch acknowledgement.
    ///
    /// # Errors
    ///
    /// `Aborted` if the caller's signal tripped before dispatch or the
    /// entry was cancelled while held; otherwise the dispatcher's error for
    /// this request.
    pub async fn submit(&self, request: SubmitRequest) -> Result<GenerateAck> {
        if request.abort.as_ref().is_some_and(AbortSignal::is_aborted) {
            return Err(EngineError::Aborted(
                "request aborted before it reached the batcher".into(),
            ));
        }
        let (respond, response) = oneshot::channel();
        self.tx
            .send(BatcherMsg::Submit(PendingEntry { request, respond }))
            .await
            .map_err(|_| EngineError::Aborted("batcher is shut down".into()))?;
        response
            .await
            .map_err(|_| EngineError::Aborted("batcher dropped the request".into()))?
    }

    /// Remove a held request before dispatch. The waiting caller fails with
    /// `ABORTED`. No-op if the request already flushed.
    pub fn cancel(&self, stream_id: &str) {
        let _ = self.tx.try_send(BatcherMsg::Cancel {
            stream_id: stream_id.to_string(),
        });
    }

    /// Stop the worker; held requests fail with `ABORTED`.
    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for GenerateBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateBatcher")
            .field("max_batch_size", &self.control.max_batch_size())
            .finish()
    }
}

#[allow(clippy::too_many_lines)]
async fn run_worker(
    config: BatcherConfig,
    mut rx: mpsc::Receiver<BatcherMsg>,
    tx: mpsc::Sender<BatcherMsg>,
    dispatcher: Arc<dyn BatchDispatcher>,
    registry: Arc<StreamRegistry>,
    control: Arc<BatcherControl>,
) {
    let min_hold = Duration::from_millis(config.min_hold_ms);
    let max_hold = Duration::from_millis(config.max_hold_ms);
    let bg_extension = Duration::from_millis(config.background_hold_extension_ms);
    let mut partitions: HashMap<String, Partition> = HashMap::new();

    loop {
        let next_deadline = partitions
            .values()
            .map(|p| partition_deadline(p, &config, min_hold, max_hold, bg_extension))
            .min();

        let msg = if let Some(deadline) = next_deadline {
            tokio::select! {
                msg = rx.recv() => msg,
                () = tokio::time::sleep_until(deadline) => {
                    flush_due(
                        &mut partitions,
                        &config,
                        min_hold,
                        max_hold,
                        bg_extension,
                        &dispatcher,
                        &registry,
                        &control,
                        &tx,
                    )
                    .await;
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match msg {
            None => {
                // Batcher dropped: everything held fails.
                for (_, partition) in partitions.drain() {
                    for entry in partition.entries {
                        let _ = entry
                            .respond
                            .send(Err(EngineError::Aborted("batcher is shut down".into())));
                    }
                }
                return;
            }
            Some(BatcherMsg::Submit(entry)) => {
                if entry
                    .request
                    .abort
                    .as_ref()
                    .is_some_and(AbortSignal::is_aborted)
                {
                    let _ = entry
                        .respond
                        .send(Err(EngineError::Aborted("request aborted while queued".into())));
                    continue;
                }

                let model_id = entry.request.model_id.clone();
                let priority = entry.request.priority;
                let partition = partitions.entry(model_id.clone()).or_insert_with(|| {
                    Partition {
                        entries: Vec::new(),
                        window_opened_at: Instant::now(),
                        hold_extended: false,
                    }
                });
                if priority == Priority::Background && !partition.hold_extended {
                    // First background visit stretches this window once;
                    // re-enqueues within the same window do not stretch it
                    // again.
                    partition.hold_extended = true;
                }
                partition.entries.push(entry);

                let target = effective_target(&control, &config, &model_id);
                if priority == Priority::Urgent || partition.entries.len() >= target {
                    flush_partition(
                        &mut partitions,
                        &model_id,
                        &config,
                        &dispatcher,
                        &registry,
                        &control,
                        &tx,
                    )
                    .await;
                }
            }
            Some(BatcherMsg::Cancel { stream_id }) => {
                for partition in partitions.values_mut() {
                    if let Some(index) = partition
                        .entries
                        .iter()
                        .position(|e| e.request.stream_id == stream_id)
                    {
                        let entry = partition.entries.remove(index);
                        let _ = entry.respond.send(Err(EngineError::Aborted(
                            "cancelled before dispatch".into(),
                        )));
                        break;
                    }
                }
                partitions.retain(|_, p| !p.entries.is_empty());
            }
            Some(BatcherMsg::Feedback { model_id, wall }) => {
                adapt_target(&control, &config, &model_id, wall);
            }
        }
    }
}

fn effective_target(control: &BatcherControl, config: &BatcherConfig, model_id: &str) -> usize {
    let learned = control
        .target_for(model_id)
        .unwrap_or(config.initial_target_batch_size);
    learned
        .clamp(config.min_batch_size, control.max_batch_size())
        .max(1)
}

fn partition_deadline(
    partition: &Partition,
    config: &BatcherConfig,
    min_hold: Duration,
    max_hold: Duration,
    bg_extension: Duration,
) -> Instant {
    let mut max_deadline = partition.window_opened_at + max_hold;
    if partition.hold_extended {
        max_deadline += bg_extension;
    }
    if partition.entries.len() >= config.min_batch_size {
        (partition.window_opened_at + min_hold).min(max_deadline)
    } else {
        max_deadline
    }
}

#[allow(clippy::too_many_arguments)]
async fn flush_due(
    partitions: &mut HashMap<String, Partition>,
    config: &BatcherConfig,
    min_hold: Duration,
    max_hold: Duration,
    bg_extension: Duration,
    dispatcher: &Arc<dyn BatchDispatcher>,
    registry: &Arc<StreamRegistry>,
    control: &Arc<BatcherControl>,
    tx: &mpsc::Sender<BatcherMsg>,
) {
    let now = Instant::now();
    let due: Vec<String> = partitions
        .iter()
        .filter(|(_, p)| partition_deadline(p, config, min_hold, max_hold, bg_extension) <= now)
        .map(|(model, _)| model.clone())
        .collect();
    for model_id in due {
        flush_partition(partitions, &model_id, config, dispatcher, registry, control, tx).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn flush_partition(
    partitions: &mut HashMap<String, Partition>,
    model_id: &str,
    config: &BatcherConfig,
    dispatcher: &Arc<dyn BatchDispatcher>,
    registry: &Arc<StreamRegistry>,
    control: &Arc<BatcherControl>,
    tx: &mpsc::Sender<BatcherMsg>,
) {
    let Some(partition) = partitions.remove(model_id) else {
        return;
    };

    // Drop anything whose caller has already walked away; a known-cancelled
    // request is never dispatched.
    let mut live: Vec<PendingEntry> = Vec::with_capacity(partition.entries.len());
    for entry in partition.entries {
        if entry
            .request
            .abort
            .as_ref()
            .is_some_and(AbortSignal::is_aborted)
        {
            let _ = entry
                .respond
                .send(Err(EngineError::Aborted("request aborted while queued".into())));
        } else {
            live.push(entry);
        }
    }
    if live.is_empty() {
        return;
    }

    // Stable sort: priority classes order the batch, FIFO within a class.
    live.sort_by_key(|e| e.request.priority.rank());

    if registry.utilization() >= config.backpressure_utilization {
        BATCH_PAUSES.inc();
        debug!(
            utilization = registry.utilization(),
            "registry saturated, pausing dispatch"
        );
        tokio::time::sleep(Duration::from_millis(config.pause_on_backpressure_ms)).await;
    }

    let max_batch = control.max_batch_size().max(1);
    let mut remaining = live;
    while !remaining.is_empty() {
        let batch: Vec<PendingEntry> = remaining
            .drain(..remaining.len().min(max_batch))
            .collect();
        dispatch_batch(model_id, batch, dispatcher, tx);
    }
}

/// Fire one batch without blocking the worker loop; wall-time feedback
/// comes back as a message.
fn dispatch_batch(
    model_id: &str,
    batch: Vec<PendingEntry>,
    dispatcher: &Arc<dyn BatchDispatcher>,
    tx: &mpsc::Sender<BatcherMsg>,
) {
    let model_id = model_id.to_string();
    let dispatcher = Arc::clone(dispatcher);
    let tx = tx.clone();
    BATCH_DISPATCHES.inc();
    BATCH_SIZES.observe(batch.len() as f64);

    tokio::spawn(async move {
        let requests: Vec<GenerateParams> = batch
            .iter()
            .map(|entry| GenerateParams {
                model_id: entry.request.model_id.clone(),
                prompt: entry.request.prompt.clone(),
                stream_id: entry.request.stream_id.clone(),
                params: entry.request.params.clone(),
            })
            .collect();

        let started = Instant::now();
        match dispatcher.dispatch(requests).await {
            Ok(results) => {
                let wall = started.elapsed();
                let mut results = results.into_iter();
                for entry in batch {
                    let outcome = results.next().unwrap_or_else(|| {
                        Err(EngineError::Generation(
                            "runtime returned fewer batch results than requests".into(),
                        ))
                    });
                    let _ = entry.respond.send(outcome);
                }
                let _ = tx.try_send(BatcherMsg::Feedback { model_id, wall });
            }
            Err(err) => {
                warn!(model_id = %model_id, error = %err, "batch dispatch failed");
                for entry in batch {
                    let _ = entry.respond.send(Err(err.clone()));
                }
            }
        }
    });
}

fn adapt_target(
    control: &BatcherControl,
    config: &BatcherConfig,
    model_id: &str,
    wall: Duration,
) {
    let target_time = config.target_batch_time_ms as f64;
    let observed = wall.as_secs_f64() * 1000.0;
    let current = control
        .target_for(model_id)
        .unwrap_or(config.initial_target_batch_size);
    let adjusted = if observed < target_time * 0.8 {
        (current + 1).min(control.max_batch_size())
    } else if observed > target_time * 1.2 {
        current.saturating_sub(1).max(config.min_batch_size)
    } else {
        current
    };
    if adjusted != current {
        debug!(model_id, current, adjusted, observed_ms = observed, "batch target adapted");
    }
    control
        .targets
        .lock()
        .insert(model_id.to_string(), adjusted);
}

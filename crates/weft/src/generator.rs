// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Generator factory: per-request async producers.
//!
//! Each generate call becomes a lazy, finite, non-restartable stream of
//! [`GenerationItem`]s: tokens, then either one `Metadata` item (success)
//! or one `Error` item (failure). An externally aborted consumer simply
//! stops receiving items; the abort cancels the stream record, which in
//! turn notifies the runtime, exactly once.

use crate::batcher::{GenerateBatcher, Priority, SubmitRequest};
use crate::errors::EngineError;
use crate::registry::{GenerationItem, StreamRegistry};
use crate::sync::{AbortSignal, BoundedQueue, ResourcePool};
use async_stream::stream;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use weft_protocol::SamplingParams;

/// Queues pooled across generate calls.
pub type GenerationQueuePool = ResourcePool<BoundedQueue<GenerationItem>>;

/// Tells the runtime to stop decoding a stream. The engine implements this
/// over the supervisor's transport; tests record calls.
pub trait CancelNotifier: Send + Sync {
    /// Fire-and-forget cancel notification for one stream.
    fn notify_cancel(&self, stream_id: &str);
}

/// One generate call as seen by the factory.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Target model id.
    pub model_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Sampling parameters.
    pub params: SamplingParams,
    /// Scheduling priority.
    pub priority: Priority,
    /// Per-stream inactivity timeout override.
    pub timeout: Option<Duration>,
    /// Consumer abort signal.
    pub abort: Option<AbortSignal>,
}

impl GenerateRequest {
    /// Build a request with default priority, timeout, and no abort.
    #[must_use]
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            params: SamplingParams::default(),
            priority: Priority::Default,
            timeout: None,
            abort: None,
        }
    }
}

/// Builds per-request token streams over the registry and batcher. One
/// factory serves one runtime lane.
pub struct GeneratorFactory {
    registry: Arc<StreamRegistry>,
    batcher: Arc<GenerateBatcher>,
    queue_pool: Arc<GenerationQueuePool>,
    notifier: Arc<dyn CancelNotifier>,
    lane: &'static str,
}

impl GeneratorFactory {
    /// Wire a factory. `queue_capacity` bounds each stream's token queue.
    #[must_use]
    pub fn new(
        registry: Arc<StreamRegistry>,
        batcher: Arc<GenerateBatcher>,
        notifier: Arc<dyn CancelNotifier>,
        lane: &'static str,
        queue_capacity: usize,
        pool_size: usize,
    ) -> Self {
        let queue_pool = Arc::new(ResourcePool::new(
            pool_size,
            move || BoundedQueue::new(queue_capacity),
            BoundedQueue::try_reset,
        ));
        Self {
            registry,
            batcher,
            queue_pool,
            notifier,
            lane,
        }
    }

    /// Start one generation.
    ///
    /// The returned stream is lazy: nothing is admitted or dispatched until
    /// it is first polled. It ends after a `Metadata` item (success), after
    /// an `Error` item (failure), or silently when the abort signal trips.
    pub fn generate(
        &self,
        request: GenerateRequest,
    ) -> impl Stream<Item = GenerationItem> + Send + 'static {
        let registry = Arc::clone(&self.registry);
        let batcher = Arc::clone(&self.batcher);
        let pool = Arc::clone(&self.queue_pool);
        let notifier = Arc::clone(&self.notifier);
        let lane = self.lane;

        stream! {
            if request.model_id.is_empty() {
                yield GenerationItem::Error(EngineError::Validation(
                    "model_id must not be empty".into(),
                ));
                return;
            }
            if request.prompt.is_empty() {
                yield GenerationItem::Error(EngineError::Validation(
                    "prompt must not be empty".into(),
                ));
                return;
            }

            let stream_id = Uuid::new_v4().to_string();
            let queue = pool.acquire();

            let hook_notifier = Arc::clone(&notifier);
            let hook_stream_id = stream_id.clone();
            let record = match registry.admit(
                &stream_id,
                &request.model_id,
                lane,
                request.timeout,
                Arc::clone(&queue),
                Box::new(move || hook_notifier.notify_cancel(&hook_stream_id)),
            ) {
                Ok(record) => record,
                Err(err) => {
                    yield GenerationItem::Error(err);
                    pool.release(queue);
                    return;
                }
            };

            let submit = SubmitRequest {
                stream_id: stream_id.clone(),
                model_id: request.model_id.clone(),
                prompt: request.prompt.clone(),
                params: request.params.clone(),
                priority: request.priority,
                abort: request.abort.clone(),
            };

            let ack = tokio::select! {
                result = batcher.submit(submit) => result,
                () = wait_abort(request.abort.as_ref()) => {
                    debug!(stream_id = %stream_id, "consumer aborted before dispatch");
                    batcher.cancel(&stream_id);
                    registry.cancel(&stream_id, "consumer_abort");
                    drop(record);
                    pool.release(queue);
                    return;
                }
            };

            if let Err(err) = ack {
                // Pre-token failure: exactly one error item, no tokens.
                registry.fail(&stream_id, err.clone());
                yield GenerationItem::Error(err);
                drop(record);
                pool.release(queue);
                return;
            }

            loop {
                tokio::select! {
                    () = wait_abort(request.abort.as_ref()) => {
                        // The consumer walked away: no more items, tell the
                        // runtime through the registry's cancel hook.
                        registry.cancel(&stream_id, "consumer_abort");
                        break;
                    }
                    item = queue.shift() => match item {
                        Ok(Some(GenerationItem::Token(token))) => {
                            yield GenerationItem::Token(token);
                        }
                        Ok(Some(GenerationItem::Metadata(summary))) => {
                            yield GenerationItem::Metadata(summary);
                        }
                        Ok(Some(GenerationItem::Error(err))) => {
                            yield GenerationItem::Error(err);
                            break;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            yield GenerationItem::Error(err);
                            break;
                        }
                    }
                }
            }

            drop(record);
            pool.release(queue);
        }
    }
}

impl std::fmt::Debug for GeneratorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorFactory").finish_non_exhaustive()
    }
}

async fn wait_abort(signal: Option<&AbortSignal>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

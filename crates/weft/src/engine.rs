// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Engine: the composition root.
//!
//! Wires the supervisors, transport sinks, stream registry, batchers,
//! artifact cache, model manager, QoS monitor, and canary router into one
//! serving fabric. A generate call flows canary router → lane batcher →
//! transport; token events flow transport → registry → the caller's
//! stream. Stream outcomes feed the QoS evaluator and the canary
//! aggregator.

use crate::batcher::{BatchDispatcher, GenerateBatcher};
use crate::cache::ArtifactCache;
use crate::canary::{CanaryRouter, RuntimeVersion};
use crate::config::WeftConfig;
use crate::errors::{EngineError, Result};
use crate::events::{operator_bus, OperatorBus, OperatorEvent};
use crate::generator::{CancelNotifier, GenerateRequest, GeneratorFactory};
use crate::health::{assess, HealthReport};
use crate::manager::{LoadOptions, ModelHandle, ModelManager};
use crate::qos::QosMonitor;
use crate::registry::{GenerationItem, RegistrySink, StreamRegistry};
use crate::supervisor::{ProcessLauncher, RuntimeLauncher, RuntimeSupervisor};
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use weft_protocol::{
    rpc::methods, BatchGenerateParams, BatchGenerateResult, CancelParams, GenerateAck,
    GenerateParams, CAP_BATCH_GENERATE,
};

/// Pooled stream queues kept warm per lane.
const QUEUE_POOL_SIZE: usize = 32;

/// Deadline for fire-and-forget cancel RPCs.
const CANCEL_RPC_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Per-lane plumbing
// ============================================================================

/// Dispatches flushed batches onto one runtime, preferring
/// `batch_generate` when the runtime advertises it.
struct RuntimeDispatcher {
    supervisor: Arc<RuntimeSupervisor>,
}

#[async_trait]
impl BatchDispatcher for RuntimeDispatcher {
    async fn dispatch(
        &self,
        requests: Vec<GenerateParams>,
    ) -> Result<Vec<std::result::Result<GenerateAck, EngineError>>> {
        let batchable = requests.len() > 1
            && self
                .supervisor
                .runtime_info()
                .is_some_and(|info| info.supports(CAP_BATCH_GENERATE));

        if batchable {
            let result: BatchGenerateResult = self
                .supervisor
                .call_typed(
                    methods::BATCH_GENERATE,
                    &BatchGenerateParams { requests },
                    None,
                )
                .await?;
            return Ok(result
                .results
                .into_iter()
                .map(|item| match (item.success, item.result, item.error) {
                    (true, Some(ack), _) => Ok(ack),
                    (_, _, Some(wire_err)) => Err(EngineError::from_wire(&wire_err)),
                    _ => Err(EngineError::Generation(
                        "runtime returned an empty batch item".into(),
                    )),
                })
                .collect());
        }

        // Sequential fallback preserves per-item isolation: one bad request
        // must not fail its batch peers.
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = self
                .supervisor
                .call_typed::<_, GenerateAck>(methods::GENERATE, &request, None)
                .await;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Cancel notifications routed to one runtime.
struct RuntimeCanceller {
    supervisor: Arc<RuntimeSupervisor>,
}

impl CancelNotifier for RuntimeCanceller {
    fn notify_cancel(&self, stream_id: &str) {
        let supervisor = Arc::clone(&self.supervisor);
        let params = CancelParams {
            stream_id: stream_id.to_string(),
        };
        tokio::spawn(async move {
            match supervisor
                .call_typed::<_, Value>(methods::CANCEL, &params, Some(CANCEL_RPC_TIMEOUT))
                .await
            {
                Ok(_) => debug!(stream_id = %params.stream_id, "runtime acknowledged cancel"),
                Err(err) => {
                    debug!(stream_id = %params.stream_id, error = %err, "cancel RPC failed")
                }
            }
        });
    }
}

struct RuntimeLane {
    version: RuntimeVersion,
    supervisor: Arc<RuntimeSupervisor>,
    batcher: Arc<GenerateBatcher>,
    factory: GeneratorFactory,
}

impl RuntimeLane {
    fn build(
        version: RuntimeVersion,
        config: &WeftConfig,
        launcher: Arc<dyn RuntimeLauncher>,
        registry: &Arc<StreamRegistry>,
        supervisor_config: crate::config::SupervisorConfig,
    ) -> Self {
        let sink = Arc::new(RegistrySink(Arc::clone(registry)));
        let supervisor = RuntimeSupervisor::new(
            supervisor_config,
            config.transport.clone(),
            launcher,
            sink,
        );
        let batcher = GenerateBatcher::new(
            config.batcher.clone(),
            Arc::new(RuntimeDispatcher {
                supervisor: Arc::clone(&supervisor),
            }),
            Arc::clone(registry),
        );
        let factory = GeneratorFactory::new(
            Arc::clone(registry),
            Arc::clone(&batcher),
            Arc::new(RuntimeCanceller {
                supervisor: Arc::clone(&supervisor),
            }),
            version.as_str(),
            config.registry.queue_capacity,
            QUEUE_POOL_SIZE,
        );
        Self {
            version,
            supervisor,
            batcher,
            factory,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// One generate call as seen by embedders.
#[derive(Debug, Clone)]
pub struct EngineGenerateRequest {
    /// The generation itself.
    pub request: GenerateRequest,
    /// Canary routing key; sticky routing requires callers to pass a
    /// stable key (user id, session id). Absent keys route randomly.
    pub routing_key: Option<String>,
}

impl EngineGenerateRequest {
    /// Wrap a plain request with no routing key.
    #[must_use]
    pub fn new(request: GenerateRequest) -> Self {
        Self {
            request,
            routing_key: None,
        }
    }
}

/// The serving fabric.
pub struct Engine {
    config: WeftConfig,
    registry: Arc<StreamRegistry>,
    cache: Arc<ArtifactCache>,
    manager: Arc<ModelManager>,
    baseline: RuntimeLane,
    variant: Option<RuntimeLane>,
    canary: Arc<CanaryRouter>,
    qos: Arc<QosMonitor>,
    bus: OperatorBus,
    outcome_pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine that launches real runtime subprocesses.
    ///
    /// # Errors
    ///
    /// `Validation` for inconsistent configuration.
    pub fn new(config: WeftConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let baseline = Arc::new(ProcessLauncher::new(config.supervisor.clone()));
        let variant = config
            .variant_supervisor
            .clone()
            .map(|c| Arc::new(ProcessLauncher::new(c)) as Arc<dyn RuntimeLauncher>);
        Self::with_launchers(config, baseline, variant)
    }

    /// Build an engine over explicit launchers. Tests wire in-process fake
    /// runtimes here.
    ///
    /// # Errors
    ///
    /// `Validation` for inconsistent configuration.
    pub fn with_launchers(
        config: WeftConfig,
        baseline_launcher: Arc<dyn RuntimeLauncher>,
        variant_launcher: Option<Arc<dyn RuntimeLauncher>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if config.variant_supervisor.is_some() && variant_launcher.is_none() {
            return Err(EngineError::Validation(
                "variant_supervisor configured but no variant launcher supplied".into(),
            ));
        }

        let bus = operator_bus();
        let registry = StreamRegistry::new(config.registry.clone());

        let baseline = RuntimeLane::build(
            RuntimeVersion::Baseline,
            &config,
            baseline_launcher,
            &registry,
            config.supervisor.clone(),
        );
        let variant = match (&config.variant_supervisor, variant_launcher) {
            (Some(supervisor_config), Some(launcher)) => Some(RuntimeLane::build(
                RuntimeVersion::Variant,
                &config,
                launcher,
                &registry,
                supervisor_config.clone(),
            )),
            _ => None,
        };

        let cache = ArtifactCache::new(config.cache.clone());
        let mut supervisors = vec![Arc::clone(&baseline.supervisor)];
        if let Some(lane) = &variant {
            supervisors.push(Arc::clone(&lane.supervisor));
        }
        let manager = ModelManager::new(supervisors, Arc::clone(&cache));
        let canary = CanaryRouter::new(config.canary.clone(), bus.clone());
        let qos = Arc::new(QosMonitor::new(
            config.qos.clone(),
            baseline.batcher.control(),
            Arc::clone(&registry),
            bus.clone(),
            HashMap::new(),
        ));

        let engine = Arc::new(Self {
            config,
            registry,
            cache,
            manager,
            baseline,
            variant,
            canary,
            qos,
            bus,
            outcome_pump: Mutex::new(None),
        });
        engine.start_outcome_pump();
        Ok(engine)
    }

    /// Start the runtimes and validate the cache. Idempotent.
    ///
    /// # Errors
    ///
    /// Launch or probe failures. Cache validation failure is not fatal: it
    /// degrades health instead.
    pub async fn start(&self) -> Result<()> {
        self.baseline.supervisor.ensure_started().await?;
        if let Some(variant) = &self.variant {
            variant.supervisor.ensure_started().await?;
        }
        if self.config.cache.validate_on_startup {
            if let Err(err) = self.cache.validate_startup().await {
                warn!(error = %err, "cache startup validation failed");
                self.cache.mark_validation_failed();
            }
        }
        info!("engine started");
        Ok(())
    }

    /// Load a model into every runtime lane.
    ///
    /// # Errors
    ///
    /// See [`ModelManager::load_model`].
    pub async fn load_model(&self, opts: LoadOptions) -> Result<Arc<ModelHandle>> {
        self.manager.load_model(opts).await
    }

    /// Unload a model. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`ModelManager::unload_model`].
    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        self.manager.unload_model(model_id).await
    }

    /// Ready models.
    #[must_use]
    pub fn list_models(&self) -> Vec<Arc<ModelHandle>> {
        self.manager.list_models()
    }

    /// The model manager, for tokenize/detokenize and handle checks.
    #[must_use]
    pub fn manager(&self) -> Arc<ModelManager> {
        Arc::clone(&self.manager)
    }

    /// Start one generation. The canary router picks the lane; the lane's
    /// batcher coalesces the call; the returned stream yields tokens then
    /// one metadata or error item.
    ///
    /// # Errors
    ///
    /// `ModelNotFound` / `ModelInvalidated` before any stream is created.
    pub fn generate(
        &self,
        request: EngineGenerateRequest,
    ) -> Result<impl Stream<Item = GenerationItem> + Send + 'static> {
        self.manager.ensure_ready(&request.request.model_id)?;

        let routing_key = request
            .routing_key
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let lane = match self.canary.route(&routing_key) {
            RuntimeVersion::Variant => self.variant.as_ref().unwrap_or(&self.baseline),
            RuntimeVersion::Baseline => &self.baseline,
        };
        debug!(lane = lane.version.as_str(), "generation routed");
        Ok(lane.factory.generate(request.request))
    }

    /// Current health rollup.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        assess(
            self.baseline.supervisor.state(),
            self.baseline.supervisor.is_connected(),
            self.baseline.supervisor.breaker().state(),
            self.cache.get_health(),
        )
    }

    /// The QoS monitor (policy loading, manual samples).
    #[must_use]
    pub fn qos(&self) -> Arc<QosMonitor> {
        Arc::clone(&self.qos)
    }

    /// The canary router (rollout control).
    #[must_use]
    pub fn canary(&self) -> Arc<CanaryRouter> {
        Arc::clone(&self.canary)
    }

    /// The artifact cache.
    #[must_use]
    pub fn cache(&self) -> Arc<ArtifactCache> {
        Arc::clone(&self.cache)
    }

    /// The stream registry.
    #[must_use]
    pub fn registry(&self) -> Arc<StreamRegistry> {
        Arc::clone(&self.registry)
    }

    /// Subscribe to operator events.
    #[must_use]
    pub fn subscribe_operator_events(&self) -> broadcast::Receiver<OperatorEvent> {
        self.bus.subscribe()
    }

    /// Shut everything down: in-flight streams are cancelled (not
    /// persisted), batchers drain, runtimes stop gracefully then hard.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        if let Some(pump) = self.outcome_pump.lock().take() {
            pump.abort();
        }
        self.registry
            .fail_all(&EngineError::Aborted("engine shutdown".into()));
        self.baseline.batcher.shutdown();
        if let Some(variant) = &self.variant {
            variant.batcher.shutdown();
        }
        self.qos.shutdown();
        self.canary.shutdown();
        self.baseline.supervisor.shutdown().await;
        if let Some(variant) = &self.variant {
            variant.supervisor.shutdown().await;
        }
        self.registry.shutdown();
    }

    /// Pump stream outcomes into QoS and the canary aggregator.
    fn start_outcome_pump(self: &Arc<Self>) {
        let mut outcomes = self.registry.subscribe();
        let engine = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            loop {
                let outcome = match outcomes.recv().await {
                    Ok(outcome) => outcome,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "outcome pump lagged, samples dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.qos.observe_outcome(&outcome, outcome.lane);
                let version = if outcome.lane == RuntimeVersion::Variant.as_str() {
                    RuntimeVersion::Variant
                } else {
                    RuntimeVersion::Baseline
                };
                engine.canary.aggregator().record(
                    version,
                    Some(outcome.total_time_ms),
                    outcome.phase == crate::registry::StreamPhase::Errored,
                );
            }
        });
        *self.outcome_pump.lock() = Some(pump);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("lanes", &(1 + usize::from(self.variant.is_some())))
            .field("health", &self.health().status)
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;

    #[tokio::test]
    async fn test_engine_builds_from_default_config() {
        let config = WeftConfig::default();
        let engine = Engine::new(config).unwrap();
        // Nothing launched yet: supervisor is idle, health is down.
        assert_eq!(engine.health().status, HealthStatus::Down);
        assert!(engine.list_models().is_empty());
    }

    #[tokio::test]
    async fn test_generate_requires_loaded_model() {
        let engine = Engine::new(WeftConfig::default()).unwrap();
        let result = engine.generate(EngineGenerateRequest::new(GenerateRequest::new(
            "ghost-model",
            "Hello",
        )));
        assert!(matches!(result, Err(EngineError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn test_variant_launcher_required_when_configured() {
        let mut config = WeftConfig::default();
        config.variant_supervisor = Some(config.supervisor.clone());
        let launcher = Arc::new(ProcessLauncher::new(config.supervisor.clone()));
        let result = Engine::with_launchers(config, launcher, None);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Runtime subprocess supervision.
//!
//! The supervisor owns the lifecycle of one model-runtime process: spawn
//! with configured argv/env, probe `runtime/info` within the startup
//! deadline, restart with capped exponential backoff on unexpected exit,
//! and give up into `fatal` once the restart budget is spent. Every
//! successful restart bumps a generation counter; model handles stamped
//! with an older generation fail fast with `MODEL_INVALIDATED`.
//!
//! A three-state circuit breaker fronts every RPC: `closed` admits all,
//! `open` rejects immediately, `half-open` admits a single probe after the
//! cooldown.

use crate::config::{SupervisorConfig, TransportConfig};
use crate::errors::{EngineError, Result};
use crate::metrics;
use crate::metrics_constants::{METRIC_BREAKER_STATE, METRIC_RUNTIME_RESTARTS_TOTAL};
use crate::sync::Backoff;
use crate::transport::{EventSink, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{Counter, Gauge};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use weft_protocol::{rpc::methods, RuntimeInfo};

static RUNTIME_RESTARTS: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(METRIC_RUNTIME_RESTARTS_TOTAL, "Total runtime restarts")
});
static BREAKER_STATE_GAUGE: LazyLock<Gauge> = LazyLock::new(|| {
    metrics::gauge(
        METRIC_BREAKER_STATE,
        "Circuit breaker state (0 closed, 1 half-open, 2 open)",
    )
});

// ============================================================================
// Launcher seam
// ============================================================================

/// A freshly launched runtime: its byte streams plus the child handle when
/// an actual process backs them.
pub struct RuntimeConnection {
    /// Runtime stdout.
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    /// Runtime stdin.
    pub writer: Box<dyn AsyncWrite + Unpin + Send>,
    /// Child process handle; `None` for in-process test runtimes.
    pub child: Option<Child>,
}

/// How runtimes come to exist. Production uses [`ProcessLauncher`]; tests
/// wire an in-process fake over `tokio::io::duplex`.
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    /// Launch one runtime and hand over its streams.
    async fn launch(&self) -> Result<RuntimeConnection>;
}

/// Launches the runtime as a subprocess with piped stdio.
pub struct ProcessLauncher {
    config: SupervisorConfig,
}

impl ProcessLauncher {
    /// Build a launcher from supervisor configuration.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RuntimeLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<RuntimeConnection> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            EngineError::TransportClosed(format!("spawn {}: {e}", self.config.command))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::TransportClosed("runtime stdout not piped".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::TransportClosed("runtime stdin not piped".into()))?;

        // Forward runtime stderr into our log stream.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "weft::runtime", "{line}");
                }
            });
        }

        Ok(RuntimeConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without touching the runtime.
    Open,
    /// One probe call is admitted; its outcome decides the next state.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Gate one call.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` while the breaker is open or a half-open probe is
    /// already in flight.
    pub fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    BREAKER_STATE_GAUGE.set(1.0);
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen(
                        "runtime calls are short-circuited".into(),
                    ))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(EngineError::CircuitOpen("probe already in flight".into()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call: the breaker closes.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        BREAKER_STATE_GAUGE.set(0.0);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                BREAKER_STATE_GAUGE.set(2.0);
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    BREAKER_STATE_GAUGE.set(2.0);
                }
            }
            BreakerState::Open => {}
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Never started.
    Idle,
    /// Startup or restart in progress.
    Starting,
    /// Runtime is up and probed.
    Running,
    /// Restart budget spent; manual intervention required.
    Fatal,
    /// Shut down on purpose.
    Stopped,
}

/// Lifecycle notifications for downstream components.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// First successful start.
    Started {
        /// Generation of the fresh runtime (1 on first start).
        generation: u64,
    },
    /// Runtime came back after an unexpected exit. All handles stamped with
    /// earlier generations are now invalid.
    Restarted {
        /// Generation of the fresh runtime.
        generation: u64,
    },
    /// Restart budget exhausted.
    Fatal {
        /// Human-readable reason.
        reason: String,
    },
    /// Graceful shutdown completed.
    Stopped,
}

/// Spawns, monitors, and restarts one model runtime.
pub struct RuntimeSupervisor {
    config: SupervisorConfig,
    transport_config: TransportConfig,
    launcher: Arc<dyn RuntimeLauncher>,
    sink: Arc<dyn EventSink>,
    breaker: CircuitBreaker,
    state: watch::Sender<SupervisorState>,
    generation: AtomicU64,
    transport: Mutex<Option<Arc<Transport>>>,
    child: AsyncMutex<Option<Child>>,
    runtime_info: Mutex<Option<RuntimeInfo>>,
    events: broadcast::Sender<RuntimeEvent>,
    start_lock: AsyncMutex<()>,
    shutting_down: AtomicBool,
    monitor_started: AtomicBool,
}

impl RuntimeSupervisor {
    /// Build a supervisor. Nothing is launched until
    /// [`RuntimeSupervisor::ensure_started`].
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        transport_config: TransportConfig,
        launcher: Arc<dyn RuntimeLauncher>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::new(
            config.breaker_failure_threshold,
            Duration::from_millis(config.breaker_cooldown_ms),
        );
        let (state, _) = watch::channel(SupervisorState::Idle);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            transport_config,
            launcher,
            sink,
            breaker,
            state,
            generation: AtomicU64::new(0),
            transport: Mutex::new(None),
            child: AsyncMutex::new(None),
            runtime_info: Mutex::new(None),
            events,
            start_lock: AsyncMutex::new(()),
            shutting_down: AtomicBool::new(false),
            monitor_started: AtomicBool::new(false),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn state_signal(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Current runtime generation; 0 before the first start.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Probed runtime info, when running.
    #[must_use]
    pub fn runtime_info(&self) -> Option<RuntimeInfo> {
        self.runtime_info.lock().clone()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// The circuit breaker fronting this runtime.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Whether the transport is currently usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .is_some_and(|t| t.is_connected())
    }

    /// Start the runtime if it is not already running. Idempotent.
    ///
    /// # Errors
    ///
    /// Launch failure, or `Timeout` if the `runtime/info` probe misses the
    /// startup deadline. A fatal supervisor stays fatal.
    pub async fn ensure_started(self: &Arc<Self>) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        match self.state() {
            SupervisorState::Running if self.is_connected() => return Ok(()),
            // Recovery after an unexpected exit belongs to the monitor; a
            // second starter here would race it.
            SupervisorState::Running => {
                return Err(EngineError::RuntimeRestart(
                    "runtime is restarting".into(),
                ))
            }
            SupervisorState::Fatal => {
                return Err(EngineError::RuntimeRestart(
                    "supervisor is fatal; restart budget spent".into(),
                ))
            }
            _ => {}
        }
        self.start_once(false).await?;
        if !self.monitor_started.swap(true, Ordering::AcqRel) {
            tokio::spawn(Arc::clone(self).monitor());
        }
        Ok(())
    }

    /// Gracefully stop the runtime: close its stdin, wait out the shutdown
    /// deadline, then kill.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Some(transport) = self.transport.lock().take() {
            transport.shutdown();
        }
        let mut child_slot = self.child.lock().await;
        if let Some(mut child) = child_slot.take() {
            let deadline = Duration::from_millis(self.config.shutdown_timeout_ms);
            match tokio::time::timeout(deadline, child.wait()).await {
                Ok(_) => info!("runtime exited within the shutdown deadline"),
                Err(_) => {
                    warn!("runtime ignored the shutdown deadline, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        let _ = self.state.send(SupervisorState::Stopped);
        let _ = self.events.send(RuntimeEvent::Stopped);
    }

    /// Issue an RPC through the breaker.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` when the breaker rejects, `TransportClosed` when no
    /// runtime is up, otherwise the transport's error.
    pub async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        self.breaker.admit()?;
        let Some(transport) = self.transport.lock().clone() else {
            // Release the admitted (possibly half-open probe) slot.
            self.breaker.record_failure();
            return Err(EngineError::TransportClosed("runtime not started".into()));
        };
        match transport.call(method, params, timeout).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                // Only infrastructure failures count against the breaker;
                // the runtime answering with a domain error is healthy.
                if matches!(
                    err,
                    EngineError::TransportClosed(_) | EngineError::Timeout(_)
                ) {
                    self.breaker.record_failure();
                }
                Err(err)
            }
        }
    }

    /// Typed wrapper over [`RuntimeSupervisor::call`].
    ///
    /// # Errors
    ///
    /// As [`RuntimeSupervisor::call`].
    pub async fn call_typed<P, R>(&self, method: &str, params: &P, timeout: Option<Duration>) -> Result<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| EngineError::Validation(format!("unserializable params: {e}")))?;
        let raw = self.call(method, params, timeout).await?;
        serde_json::from_value(raw).map_err(|e| {
            EngineError::Generation(format!("malformed {method} result from runtime: {e}"))
        })
    }

    async fn start_once(self: &Arc<Self>, is_restart: bool) -> Result<()> {
        let _ = self.state.send(SupervisorState::Starting);

        let RuntimeConnection {
            reader,
            writer,
            child,
        } = self.launcher.launch().await?;
        let transport = Transport::spawn(
            reader,
            writer,
            Arc::clone(&self.sink),
            self.transport_config.clone(),
        );

        // Probe within the startup deadline. A runtime that cannot answer
        // runtime/info is not a runtime.
        let startup = Duration::from_millis(self.config.startup_timeout_ms);
        let info: RuntimeInfo = match transport
            .call_typed(methods::RUNTIME_INFO, &Value::Null, Some(startup))
            .await
        {
            Ok(info) => info,
            Err(err) => {
                transport.shutdown();
                if let Some(mut child) = child {
                    let _ = child.start_kill();
                }
                return Err(match err {
                    EngineError::Timeout(_) => EngineError::Timeout(format!(
                        "runtime failed the init probe within {}ms",
                        self.config.startup_timeout_ms
                    )),
                    other => other,
                });
            }
        };

        info!(
            version = %info.version,
            protocol = info.protocol,
            restart = is_restart,
            "runtime is up"
        );

        *self.runtime_info.lock() = Some(info);
        *self.transport.lock() = Some(transport);
        *self.child.lock().await = child;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.state.send(SupervisorState::Running);
        let event = if is_restart {
            RuntimeEvent::Restarted { generation }
        } else {
            RuntimeEvent::Started { generation }
        };
        let _ = self.events.send(event);
        Ok(())
    }

    /// Watches the active transport and restarts the runtime on unexpected
    /// closure, with capped exponential backoff.
    async fn monitor(self: Arc<Self>) {
        let backoff = Backoff {
            attempts: self.config.max_restarts.max(1),
            initial_delay: Duration::from_millis(self.config.restart_backoff_initial_ms),
            max_delay: Duration::from_millis(self.config.restart_backoff_max_ms),
            multiplier: 2.0,
            jitter: true,
        };

        loop {
            let Some(mut closed_rx) = self
                .transport
                .lock()
                .as_ref()
                .map(|t| t.closed_signal())
            else {
                return;
            };

            if !*closed_rx.borrow() && closed_rx.changed().await.is_err() {
                return;
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }

            warn!("runtime transport lost unexpectedly");
            RUNTIME_RESTARTS.inc();
            let _guard = self.start_lock.lock().await;
            if self.is_connected() {
                continue;
            }
            self.reap_child().await;

            let mut restarted = false;
            for attempt in 0..self.config.max_restarts {
                tokio::time::sleep(backoff.delay_for(attempt)).await;
                if self.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                match self.start_once(true).await {
                    Ok(()) => {
                        restarted = true;
                        break;
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "runtime restart attempt failed");
                    }
                }
            }

            if !restarted {
                error!(
                    max_restarts = self.config.max_restarts,
                    "restart budget spent, supervisor is fatal"
                );
                let _ = self.state.send(SupervisorState::Fatal);
                let _ = self.events.send(RuntimeEvent::Fatal {
                    reason: format!(
                        "runtime failed to restart after {} attempts",
                        self.config.max_restarts
                    ),
                });
                return;
            }
        }
    }

    async fn reap_child(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

impl std::fmt::Debug for RuntimeSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSupervisor")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Framed RPC transport over the runtime's stdio.
//!
//! One transport owns one bidirectional byte stream. Outgoing requests are
//! serialized, framed, and handed to a dedicated writer task through a
//! bounded channel; incoming bytes are decoded by a dedicated reader task
//! that resolves pending calls by correlation id and hands stream events to
//! the [`EventSink`].
//!
//! Write backpressure: while fewer than `high_water_bytes` are queued,
//! submissions enqueue without waiting, and a full channel in that regime
//! is a genuine overflow that fails fast with `BACKPRESSURE`. Past the
//! high-water mark, submissions block on the bounded queue until the
//! writer drains, bounded by the per-call deadline.
//!
//! Any decode error, EOF, or pipe write failure is fatal: every pending
//! call is rejected with `TRANSPORT_CLOSED`, the sink is notified once, and
//! the supervisor observes the closure through [`Transport::closed_signal`].

use crate::config::TransportConfig;
use crate::errors::{EngineError, Result};
use crate::metrics;
use crate::metrics_constants::{
    METRIC_BACKPRESSURE_REJECTS_TOTAL, METRIC_FRAMES_RECEIVED_TOTAL, METRIC_FRAMES_SENT_TOTAL,
    METRIC_ORPHAN_RESPONSES_TOTAL, METRIC_RPC_LATENCY_MS,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{Counter, HistogramOpts, HistogramVec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use weft_protocol::{encode_frame, FrameDecoder, Incoming, StreamEvent, WireRequest};

static FRAMES_SENT: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(METRIC_FRAMES_SENT_TOTAL, "Total frames written to the runtime")
});
static FRAMES_RECEIVED: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(
        METRIC_FRAMES_RECEIVED_TOTAL,
        "Total frames received from the runtime",
    )
});
static BACKPRESSURE_REJECTS: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(
        METRIC_BACKPRESSURE_REJECTS_TOTAL,
        "Total requests rejected because the outgoing queue was saturated",
    )
});
static ORPHAN_RESPONSES: LazyLock<Counter> = LazyLock::new(|| {
    metrics::counter(
        METRIC_ORPHAN_RESPONSES_TOTAL,
        "Total responses that matched no pending request",
    )
});
static RPC_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    metrics::histogram_vec(
        HistogramOpts::new(METRIC_RPC_LATENCY_MS, "RPC round-trip latency in milliseconds")
            .buckets(metrics::latency_buckets_ms()),
        &["method"],
    )
});

/// Receiver of out-of-band stream events and transport failure.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handle one stream event. Suspending here backpressures the reader,
    /// and through the pipe, the runtime itself.
    async fn on_event(&self, event: StreamEvent);

    /// Called exactly once when the transport dies.
    async fn on_closed(&self, error: &EngineError);
}

struct PendingCall {
    respond: oneshot::Sender<Result<Value>>,
    deadline: Instant,
    method: String,
    sent_at: Instant,
}

/// Framed RPC transport over one byte stream pair.
pub struct Transport {
    write_tx: mpsc::Sender<Bytes>,
    pending: Arc<DashMap<u64, PendingCall>>,
    next_id: AtomicU64,
    outstanding_bytes: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    config: TransportConfig,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Transport {
    /// Wire a transport onto a reader/writer pair and start its tasks.
    ///
    /// In production the pair is the runtime child's stdout/stdin; tests
    /// use `tokio::io::duplex`.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        sink: Arc<dyn EventSink>,
        config: TransportConfig,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::channel::<Bytes>(config.write_queue_depth);
        let (closed_tx, closed_rx) = watch::channel(false);

        let transport = Arc::new(Self {
            write_tx,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            outstanding_bytes: Arc::new(AtomicUsize::new(0)),
            connected: Arc::new(AtomicBool::new(true)),
            closed_tx,
            closed_rx,
            config,
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(Self::write_loop(
            write_rx,
            writer,
            Arc::clone(&transport),
            Arc::clone(&sink),
        ));
        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&transport),
            Arc::clone(&sink),
        ));
        let sweeper_task = tokio::spawn(Self::deadline_sweep(Arc::clone(&transport)));

        transport
            .tasks
            .lock()
            .extend([writer_task, reader_task, sweeper_task]);
        transport
    }

    /// Whether the transport is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Watch channel that flips to `true` when the transport dies.
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Issue an RPC and await its response.
    ///
    /// # Errors
    ///
    /// `TransportClosed` when the transport is down, `Backpressure` when
    /// the bounded outgoing queue overflows, `Timeout` when the deadline
    /// elapses (including while blocked on a queue past the high-water
    /// mark), or the runtime's own error.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(EngineError::TransportClosed(format!(
                "cannot send {method}: transport is down"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = WireRequest {
            id,
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| EngineError::Validation(format!("unserializable params: {e}")))?;
        let mut framed = BytesMut::new();
        encode_frame(&payload, &mut framed, self.config.max_frame_bytes)?;
        let frame = framed.freeze();
        let frame_len = frame.len();

        let deadline = timeout.unwrap_or_else(|| self.config.request_timeout());
        let (respond, response) = oneshot::channel();
        let now = Instant::now();
        self.pending.insert(
            id,
            PendingCall {
                respond,
                deadline: now + deadline,
                method: method.to_string(),
                sent_at: now,
            },
        );

        self.outstanding_bytes.fetch_add(frame_len, Ordering::AcqRel);
        let over_high_water =
            self.outstanding_bytes.load(Ordering::Acquire) > self.config.high_water_bytes;

        let send_result = if over_high_water {
            // Past the high-water mark, submissions block on the bounded
            // queue until the writer drains; the per-call deadline bounds
            // the wait.
            match tokio::time::timeout(deadline, self.write_tx.send(frame)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(EngineError::TransportClosed("writer gone".into())),
                Err(_) => Err(EngineError::Timeout(format!(
                    "{method} blocked on a saturated outgoing queue"
                ))),
            }
        } else {
            // Under the high-water mark the buffer has room; nothing to wait
            // for. A full channel here is a genuine overflow.
            self.write_tx.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    BACKPRESSURE_REJECTS.inc();
                    EngineError::Backpressure(format!(
                        "outgoing queue overflowed its {} slots",
                        self.config.write_queue_depth
                    ))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    EngineError::TransportClosed("writer gone".into())
                }
            })
        };

        if let Err(err) = send_result {
            self.outstanding_bytes.fetch_sub(frame_len, Ordering::AcqRel);
            self.pending.remove(&id);
            return Err(err);
        }

        match response.await {
            Ok(result) => result,
            // The pending entry vanished without an answer; only a teardown
            // race can cause this.
            Err(_) => Err(EngineError::TransportClosed(format!(
                "{method} abandoned during transport teardown"
            ))),
        }
    }

    /// Typed wrapper over [`Transport::call`].
    ///
    /// # Errors
    ///
    /// As [`Transport::call`], plus `GENERATION_ERROR` if the result does
    /// not deserialize as `R`.
    pub async fn call_typed<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<R>
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

    /// Tear the transport down locally. Pending calls fail with
    /// `TRANSPORT_CLOSED`; the sink is not notified (the caller initiated
    /// the shutdown and already knows).
    pub fn shutdown(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.fail_pending(&EngineError::TransportClosed("transport shut down".into()));
        let _ = self.closed_tx.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn fail_pending(&self, err: &EngineError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.respond.send(Err(err.clone()));
            }
        }
    }

    async fn fatal(self: &Arc<Self>, sink: &Arc<dyn EventSink>, err: EngineError) {
        // First observer wins; later failures on the same transport are
        // echoes of the same teardown.
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        error!(error = %err, "transport failed");
        self.fail_pending(&err);
        sink.on_closed(&err).await;
        let _ = self.closed_tx.send(true);
    }

    async fn write_loop<W>(
        mut write_rx: mpsc::Receiver<Bytes>,
        mut writer: W,
        transport: Arc<Self>,
        sink: Arc<dyn EventSink>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(frame) = write_rx.recv().await {
            let frame_len = frame.len();
            let outcome = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;
            transport
                .outstanding_bytes
                .fetch_sub(frame_len, Ordering::AcqRel);
            match outcome {
                Ok(()) => FRAMES_SENT.inc(),
                Err(e) => {
                    transport
                        .fatal(&sink, EngineError::TransportClosed(format!("write: {e}")))
                        .await;
                    return;
                }
            }
        }
    }

    async fn read_loop<R>(mut reader: R, transport: Arc<Self>, sink: Arc<dyn EventSink>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut decoder = FrameDecoder::new(transport.config.max_frame_bytes);
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    transport
                        .fatal(&sink, EngineError::TransportClosed("unexpected EOF".into()))
                        .await;
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    transport
                        .fatal(&sink, EngineError::TransportClosed(format!("read: {e}")))
                        .await;
                    return;
                }
            };
            decoder.extend(&buf[..n]);
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        FRAMES_RECEIVED.inc();
                        transport.dispatch_frame(&frame, &sink).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        transport.fatal(&sink, EngineError::from(e)).await;
                        return;
                    }
                }
            }
            if !transport.is_connected() {
                return;
            }
        }
    }

    async fn dispatch_frame(self: &Arc<Self>, frame: &[u8], sink: &Arc<dyn EventSink>) {
        let incoming: Incoming = match serde_json::from_slice(frame) {
            Ok(incoming) => incoming,
            Err(e) => {
                // Malformed payloads are a protocol violation, not a skippable
                // frame: resynchronization is impossible to verify.
                self.fatal(
                    sink,
                    EngineError::TransportClosed(format!("malformed frame: {e}")),
                )
                .await;
                return;
            }
        };
        match incoming {
            Incoming::Response(response) => match self.pending.remove(&response.id) {
                Some((_, call)) => {
                    RPC_LATENCY
                        .with_label_values(&[call.method.as_str()])
                        .observe(call.sent_at.elapsed().as_secs_f64() * 1000.0);
                    let outcome = match (response.result, response.error) {
                        (_, Some(wire_err)) => Err(EngineError::from_wire(&wire_err)),
                        (Some(result), None) => Ok(result),
                        (None, None) => Ok(Value::Null),
                    };
                    let _ = call.respond.send(outcome);
                }
                None => {
                    ORPHAN_RESPONSES.inc();
                    warn!(id = response.id, "response matched no pending request, dropping");
                }
            },
            Incoming::Event(event) => {
                sink.on_event(event).await;
            }
        }
    }

    async fn deadline_sweep(transport: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if !transport.is_connected() {
                return;
            }
            let now = Instant::now();
            let expired: Vec<u64> = transport
                .pending
                .iter()
                .filter(|entry| entry.deadline <= now)
                .map(|entry| *entry.key())
                .collect();
            for id in expired {
                if let Some((_, call)) = transport.pending.remove(&id) {
                    debug!(id, method = %call.method, "RPC deadline elapsed");
                    let _ = call.respond.send(Err(EngineError::Timeout(format!(
                        "{} did not answer in time",
                        call.method
                    ))));
                }
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;
    use weft_protocol::{StreamEventBody, WireResponse};

    /// Sink that records events and closure.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<StreamEvent>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn on_event(&self, event: StreamEvent) {
            self.events.lock().push(event);
        }
        async fn on_closed(&self, _error: &EngineError) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Frame-level peer driving the runtime half of a duplex pipe.
    struct FakePeer {
        reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
        decoder: FrameDecoder,
        buf: Vec<u8>,
    }

    impl FakePeer {
        fn new(stream: tokio::io::DuplexStream) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            Self {
                reader,
                writer,
                decoder: FrameDecoder::default(),
                buf: vec![0u8; 4096],
            }
        }

        async fn recv_request(&mut self) -> WireRequest {
            loop {
                if let Some(frame) = self.decoder.next_frame().unwrap() {
                    return serde_json::from_slice(&frame).unwrap();
                }
                let n = self.reader.read(&mut self.buf).await.unwrap();
                assert!(n > 0, "transport hung up");
                self.decoder.extend(&self.buf[..n]);
            }
        }

        async fn send_json(&mut self, value: &Value) {
            let payload = serde_json::to_vec(value).unwrap();
            let mut framed = BytesMut::new();
            encode_frame(&payload, &mut framed, weft_protocol::DEFAULT_MAX_FRAME_LEN).unwrap();
            self.writer.write_all(&framed).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn respond(&mut self, id: u64, result: Value) {
            self.send_json(&json!({"id": id, "result": result})).await;
        }
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            request_timeout_ms: 2_000,
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_call_resolves_by_correlation_id() {
        let (host_side, peer_side) = duplex(64 * 1024);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let transport = Transport::spawn(read_half, write_half, sink, test_config());
        let mut peer = FakePeer::new(peer_side);

        let call = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.call("runtime/info", json!({}), None).await }
        });

        let request = peer.recv_request().await;
        assert_eq!(request.method, "runtime/info");
        peer.respond(request.id, json!({"version": "1.0", "protocol": 1}))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["version"], "1.0");
    }

    #[tokio::test]
    async fn test_out_of_order_responses_resolve_correct_callers() {
        let (host_side, peer_side) = duplex(64 * 1024);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let transport = Transport::spawn(read_half, write_half, sink, test_config());
        let mut peer = FakePeer::new(peer_side);

        let first = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.call("tokenize", json!({"text": "a"}), None).await }
        });
        let req_a = peer.recv_request().await;
        let second = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.call("tokenize", json!({"text": "b"}), None).await }
        });
        let req_b = peer.recv_request().await;

        // Answer in reverse order.
        peer.respond(req_b.id, json!({"tokens": [2]})).await;
        peer.respond(req_a.id, json!({"tokens": [1]})).await;

        assert_eq!(first.await.unwrap().unwrap()["tokens"][0], 1);
        assert_eq!(second.await.unwrap().unwrap()["tokens"][0], 2);
    }

    #[tokio::test]
    async fn test_orphan_response_dropped_transport_survives() {
        let (host_side, peer_side) = duplex(64 * 1024);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let transport = Transport::spawn(read_half, write_half, sink, test_config());
        let mut peer = FakePeer::new(peer_side);

        peer.send_json(&json!({"id": 999_999, "result": {}})).await;

        // A normal call still works afterwards.
        let call = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.call("runtime/info", json!({}), None).await }
        });
        let request = peer.recv_request().await;
        peer.respond(request.id, json!({"ok": true})).await;
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_events_reach_sink() {
        let (host_side, peer_side) = duplex(64 * 1024);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let _transport =
            Transport::spawn(read_half, write_half, Arc::clone(&sink) as _, test_config());
        let mut peer = FakePeer::new(peer_side);

        peer.send_json(&json!({
            "stream_id": "s-1",
            "kind": "chunk",
            "token": "Hi",
            "token_id": 5,
            "is_final": false
        }))
        .await;

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !sink.events.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let events = sink.events.lock();
        assert_eq!(events[0].stream_id, "s-1");
        assert!(matches!(events[0].body, StreamEventBody::Chunk(_)));
    }

    #[tokio::test]
    async fn test_eof_fails_pending_and_notifies_sink() {
        let (host_side, peer_side) = duplex(64 * 1024);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let transport =
            Transport::spawn(read_half, write_half, Arc::clone(&sink) as _, test_config());
        let mut peer = FakePeer::new(peer_side);

        let call = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.call("generate", json!({}), None).await }
        });
        let _request = peer.recv_request().await;

        drop(peer); // both halves gone -> EOF on the host side

        let result = call.await.unwrap();
        assert!(matches!(result, Err(EngineError::TransportClosed(_))));
        assert!(sink.closed.load(Ordering::SeqCst));
        assert!(!transport.is_connected());

        // Subsequent calls fail fast.
        let err = transport.call("tokenize", json!({}), None).await.unwrap_err();
        assert!(matches!(err, EngineError::TransportClosed(_)));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (host_side, peer_side) = duplex(64 * 1024);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let transport = Transport::spawn(read_half, write_half, sink, test_config());
        let mut peer = FakePeer::new(peer_side);

        let call = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move {
                transport
                    .call("generate", json!({}), Some(Duration::from_millis(150)))
                    .await
            }
        });
        // Receive the request but never answer.
        let _request = peer.recv_request().await;

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_queue_overflow_under_high_water_fails_fast() {
        // Tiny pipe and a two-slot queue, but a high-water mark far above
        // anything queued here: the first frames wedge in the pipe, later
        // submissions overflow the channel itself and must reject fast.
        let (host_side, peer_side) = duplex(16);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let config = TransportConfig {
            write_queue_depth: 2,
            ..test_config()
        };
        let transport = Transport::spawn(read_half, write_half, sink, config);
        let _peer = peer_side; // never read: writer blocks once the pipe fills

        let calls: Vec<_> = (0..16)
            .map(|_| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    transport
                        .call(
                            "generate",
                            json!({"prompt": "x".repeat(64)}),
                            Some(Duration::from_millis(200)),
                        )
                        .await
                })
            })
            .collect();

        let mut saw_backpressure = false;
        for call in calls {
            if matches!(call.await.unwrap(), Err(EngineError::Backpressure(_))) {
                saw_backpressure = true;
            }
        }
        assert!(saw_backpressure, "channel overflow must reject fast");
    }

    #[tokio::test]
    async fn test_past_high_water_blocks_instead_of_rejecting() {
        // Zero high-water mark: every submission is in the blocking regime.
        // With the pipe wedged nothing drains, so calls wait out their
        // deadline; none may fail fast with BACKPRESSURE.
        let (host_side, peer_side) = duplex(16);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let config = TransportConfig {
            write_queue_depth: 8,
            high_water_bytes: 0,
            ..test_config()
        };
        let transport = Transport::spawn(read_half, write_half, sink, config);
        let _peer = peer_side; // never read: writer blocks once the pipe fills

        let calls: Vec<_> = (0..12)
            .map(|_| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    transport
                        .call(
                            "generate",
                            json!({"prompt": "x".repeat(64)}),
                            Some(Duration::from_millis(200)),
                        )
                        .await
                })
            })
            .collect();

        for call in calls {
            let result = call.await.unwrap();
            assert!(
                matches!(result, Err(EngineError::Timeout(_))),
                "past the high-water mark calls block to their deadline, got {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_error_response_maps_to_engine_error() {
        let (host_side, peer_side) = duplex(64 * 1024);
        let sink = Arc::new(RecordingSink::default());
        let (read_half, write_half) = tokio::io::split(host_side);
        let transport = Transport::spawn(read_half, write_half, sink, test_config());
        let mut peer = FakePeer::new(peer_side);

        let call = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.call("model/attach", json!({}), None).await }
        });
        let request = peer.recv_request().await;
        let response = WireResponse {
            id: request.id,
            result: None,
            error: Some(weft_protocol::WireError {
                code: "MODEL_NOT_FOUND".into(),
                message: "nothing attached".into(),
            }),
        };
        peer.send_json(&serde_json::to_value(&response).unwrap()).await;

        let result = call.await.unwrap();
        assert!(matches!(result, Err(EngineError::ModelNotFound(_))));
    }
}

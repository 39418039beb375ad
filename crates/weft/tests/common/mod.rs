// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-process fake model runtime for end-to-end tests.
//!
//! Speaks the full wire protocol over a `tokio::io::duplex` pipe:
//! length-prefixed JSON frames, the minimum method set, and unsolicited
//! stream events. Behavior is scripted per test through
//! [`RuntimeBehavior`]; everything observable (batch compositions, cancel
//! RPCs, per-method counts) is recorded for assertions.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use weft::errors::Result;
use weft::supervisor::{RuntimeConnection, RuntimeLauncher};
use weft_protocol::{
    encode_frame, rpc::methods, FrameDecoder, GenerateParams, WireRequest, DEFAULT_MAX_FRAME_LEN,
};

/// Scripted behavior for the fake runtime.
#[derive(Debug, Clone)]
pub struct RuntimeBehavior {
    /// Capability flags advertised by `runtime/info`.
    pub capabilities: Vec<String>,
    /// Artificial wall time for `model/load` (cold load cost).
    pub load_delay: Duration,
    /// Delay between emitted token chunks.
    pub token_delay: Duration,
    /// Canned token stream; `max_tokens` caps how many are emitted.
    pub tokens: Vec<String>,
    /// Emit tokens indefinitely (until cancelled) instead of completing.
    pub hold_streams: bool,
    /// Hang up the pipe when a generate request arrives.
    pub die_on_generate: bool,
}

impl Default for RuntimeBehavior {
    fn default() -> Self {
        Self {
            capabilities: vec!["batch_generate".to_string()],
            load_delay: Duration::ZERO,
            token_delay: Duration::from_millis(2),
            tokens: ["H", "i", "!", "\n", "<eos>"]
                .into_iter()
                .map(String::from)
                .collect(),
            hold_streams: false,
            die_on_generate: false,
        }
    }
}

/// Everything the fake runtime observed, for assertions.
#[derive(Debug, Default)]
pub struct RuntimeObservations {
    /// Method names in arrival order.
    pub methods: Vec<String>,
    /// Prompts per `batch_generate` call, in batch order.
    pub batches: Vec<Vec<String>>,
    /// Stream ids that received a `cancel` RPC.
    pub cancels: Vec<String>,
}

impl RuntimeObservations {
    /// Count of calls to one method.
    pub fn calls(&self, method: &str) -> usize {
        self.methods.iter().filter(|m| *m == method).count()
    }
}

struct SharedState {
    behavior: RuntimeBehavior,
    observations: RuntimeObservations,
    cancelled: HashSet<String>,
    loaded: HashMap<String, Value>,
    shard_dir: std::path::PathBuf,
}

/// Launches fake runtimes over duplex pipes. Clone-cheap via `Arc`.
pub struct FakeRuntime {
    state: Arc<Mutex<SharedState>>,
}

impl FakeRuntime {
    pub fn new(behavior: RuntimeBehavior, shard_dir: std::path::PathBuf) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(SharedState {
                behavior,
                observations: RuntimeObservations::default(),
                cancelled: HashSet::new(),
                loaded: HashMap::new(),
                shard_dir,
            })),
        })
    }

    /// Snapshot the observations.
    pub fn observations(&self) -> RuntimeObservations {
        let state = self.state.lock();
        RuntimeObservations {
            methods: state.observations.methods.clone(),
            batches: state.observations.batches.clone(),
            cancels: state.observations.cancels.clone(),
        }
    }

    pub fn set_behavior(&self, behavior: RuntimeBehavior) {
        self.state.lock().behavior = behavior;
    }
}

#[async_trait]
impl RuntimeLauncher for FakeRuntime {
    async fn launch(&self) -> Result<RuntimeConnection> {
        let (host_side, runtime_side) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve(runtime_side, Arc::clone(&self.state)));
        let (reader, writer) = tokio::io::split(host_side);
        Ok(RuntimeConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        })
    }
}

type SharedWriter = Arc<AsyncMutex<WriteHalf<tokio::io::DuplexStream>>>;

async fn send_json(writer: &SharedWriter, value: &Value) -> std::io::Result<()> {
    let payload = serde_json::to_vec(value).expect("test payload serializes");
    let mut framed = BytesMut::new();
    encode_frame(&payload, &mut framed, DEFAULT_MAX_FRAME_LEN).expect("test frame encodes");
    let mut writer = writer.lock().await;
    writer.write_all(&framed).await?;
    writer.flush().await
}

async fn serve(stream: tokio::io::DuplexStream, state: Arc<Mutex<SharedState>>) {
    let (mut reader, writer) = tokio::io::split(stream);
    let writer: SharedWriter = Arc::new(AsyncMutex::new(writer));
    let mut decoder = FrameDecoder::default();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);
        while let Ok(Some(frame)) = decoder.next_frame() {
            let request: WireRequest = match serde_json::from_slice(&frame) {
                Ok(request) => request,
                Err(_) => return,
            };
            state.lock().observations.methods.push(request.method.clone());
            if !handle_request(&request, &writer, &state).await {
                return; // scripted hangup
            }
        }
    }
}

/// Handle one request; returns false when the runtime should hang up.
async fn handle_request(
    request: &WireRequest,
    writer: &SharedWriter,
    state: &Arc<Mutex<SharedState>>,
) -> bool {
    let id = request.id;
    match request.method.as_str() {
        methods::RUNTIME_INFO => {
            let capabilities = state.lock().behavior.capabilities.clone();
            respond(
                writer,
                id,
                json!({"version": "fake-runtime/1.0", "protocol": 1, "capabilities": capabilities}),
            )
            .await;
        }
        methods::MODEL_LOAD => {
            let model_id = request.params["model_id"].as_str().unwrap_or("").to_string();
            let (delay, shard_dir) = {
                let state = state.lock();
                (state.behavior.load_delay, state.shard_dir.clone())
            };
            tokio::time::sleep(delay).await;

            // Materialize a deterministic shard the host cache can ingest.
            let shard_path = shard_dir.join(format!("{}.safetensors", model_id.replace('/', "_")));
            let payload = format!("weights-of-{model_id}").into_bytes();
            tokio::fs::write(&shard_path, &payload).await.expect("shard write");
            let sha256 = {
                use sha2::Digest;
                let mut hasher = sha2::Sha256::new();
                hasher.update(&payload);
                hex::encode(hasher.finalize())
            };

            state.lock().loaded.insert(model_id.clone(), json!({}));
            respond(
                writer,
                id,
                json!({
                    "model_id": model_id,
                    "context_length": 4096,
                    "metadata": {"quantization": "none"},
                    "shards": [{
                        "path": shard_path.display().to_string(),
                        "size_bytes": payload.len(),
                        "sha256": sha256,
                    }]
                }),
            )
            .await;
        }
        methods::MODEL_ATTACH => {
            let fingerprint = request.params["fingerprint"].as_str().unwrap_or("").to_string();
            state.lock().loaded.insert(fingerprint.clone(), json!({}));
            respond(
                writer,
                id,
                json!({"model_id": fingerprint, "context_length": 4096, "metadata": {}}),
            )
            .await;
        }
        methods::MODEL_UNLOAD => {
            let model_id = request.params["model_id"].as_str().unwrap_or("");
            state.lock().loaded.remove(model_id);
            respond(writer, id, json!({})).await;
        }
        methods::TOKENIZE => {
            let text = request.params["text"].as_str().unwrap_or("");
            let tokens: Vec<u32> = text.chars().map(|c| c as u32).collect();
            let token_strings: Vec<String> = text.chars().map(String::from).collect();
            respond(
                writer,
                id,
                json!({"tokens": tokens, "token_strings": token_strings}),
            )
            .await;
        }
        methods::DETOKENIZE => {
            let text: String = request.params["tokens"]
                .as_array()
                .map(|tokens| {
                    tokens
                        .iter()
                        .filter_map(|t| t.as_u64())
                        .filter_map(|t| char::from_u32(t as u32))
                        .collect()
                })
                .unwrap_or_default();
            respond(writer, id, json!({"text": text})).await;
        }
        methods::GENERATE => {
            if state.lock().behavior.die_on_generate {
                return false;
            }
            let params: GenerateParams =
                serde_json::from_value(request.params.clone()).expect("generate params");
            respond(
                writer,
                id,
                json!({"stream_id": params.stream_id, "started_at": 1}),
            )
            .await;
            spawn_emission(params, writer.clone(), Arc::clone(state));
        }
        methods::BATCH_GENERATE => {
            if state.lock().behavior.die_on_generate {
                return false;
            }
            let requests: Vec<GenerateParams> =
                serde_json::from_value(request.params["requests"].clone())
                    .expect("batch_generate params");
            state
                .lock()
                .observations
                .batches
                .push(requests.iter().map(|r| r.prompt.clone()).collect());
            let results: Vec<Value> = requests
                .iter()
                .map(|r| json!({"success": true, "result": {"stream_id": r.stream_id, "started_at": 1}}))
                .collect();
            respond(writer, id, json!({"results": results})).await;
            for params in requests {
                spawn_emission(params, writer.clone(), Arc::clone(state));
            }
        }
        methods::CANCEL => {
            let stream_id = request.params["stream_id"].as_str().unwrap_or("").to_string();
            {
                let mut state = state.lock();
                state.cancelled.insert(stream_id.clone());
                state.observations.cancels.push(stream_id);
            }
            respond(writer, id, json!({})).await;
        }
        other => {
            let error = json!({"id": id, "error": {"code": "VALIDATION", "message": format!("unknown method {other}")}});
            let _ = send_json(writer, &error).await;
        }
    }
    true
}

async fn respond(writer: &SharedWriter, id: u64, result: Value) {
    let _ = send_json(writer, &json!({"id": id, "result": result})).await;
}

/// Emit the scripted token stream for one generation.
fn spawn_emission(params: GenerateParams, writer: SharedWriter, state: Arc<Mutex<SharedState>>) {
    tokio::spawn(async move {
        let (tokens, token_delay, hold) = {
            let state = state.lock();
            (
                state.behavior.tokens.clone(),
                state.behavior.token_delay,
                state.behavior.hold_streams,
            )
        };
        let budget = params
            .params
            .max_tokens
            .map(|m| m as usize)
            .unwrap_or(tokens.len());

        let mut emitted = 0usize;
        loop {
            if state.lock().cancelled.contains(&params.stream_id) {
                let event = json!({
                    "stream_id": params.stream_id,
                    "kind": "event",
                    "event": "cancelled",
                    "is_final": true
                });
                let _ = send_json(&writer, &event).await;
                return;
            }
            let done = if hold { false } else { emitted >= budget.min(tokens.len()) };
            if done {
                break;
            }

            tokio::time::sleep(token_delay).await;
            let token = tokens
                .get(emitted % tokens.len().max(1))
                .cloned()
                .unwrap_or_else(|| "x".to_string());
            let is_final = !hold && emitted + 1 == budget.min(tokens.len());
            let chunk = json!({
                "stream_id": params.stream_id,
                "kind": "chunk",
                "token": token,
                "token_id": emitted as u32,
                "is_final": is_final
            });
            if send_json(&writer, &chunk).await.is_err() {
                return;
            }
            emitted += 1;
        }

        let stats = json!({
            "stream_id": params.stream_id,
            "kind": "stats",
            "tokens_generated": emitted as u64,
            "tokens_per_second": 50.0,
            "time_to_first_token": 10.0,
            "total_time": 100.0
        });
        let _ = send_json(&writer, &stats).await;
        let completed = json!({
            "stream_id": params.stream_id,
            "kind": "event",
            "event": "completed",
            "finish_reason": "stop",
            "is_final": true
        });
        let _ = send_json(&writer, &completed).await;
    });
}

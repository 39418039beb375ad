// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Model manager: the set of ready models.
//!
//! A load computes the artifact fingerprint, consults the cache, and binds
//! the model into every runtime lane (`model/attach` on a warm cache,
//! `model/load` + populate on a cold one). Handles are stamped with the
//! runtime generation at load time; a restart invalidates every handle at
//! once, and stale handles fail fast with `MODEL_INVALIDATED` instead of
//! requiring distributed teardown.

use crate::cache::manifest::FingerprintInputs;
use crate::cache::{ArtifactCache, CacheGuard};
use crate::errors::{EngineError, Result};
use crate::supervisor::{RuntimeEvent, RuntimeSupervisor};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use weft_protocol::{
    rpc::methods, AttachParams, DetokenizeParams, DetokenizeResult, LoadParams, LoadResult,
    TokenizeParams, TokenizeResult, UnloadParams,
};

// ============================================================================
// Descriptors and handles
// ============================================================================

/// Where model weights come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// Pulled from the Hugging Face hub.
    HuggingFace,
    /// Read from a local path.
    Local,
}

impl ModelSource {
    fn as_str(self) -> &'static str {
        match self {
            ModelSource::HuggingFace => "huggingface",
            ModelSource::Local => "local",
        }
    }
}

/// Input modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Text-only.
    Text,
    /// Vision-only.
    Vision,
    /// Text and vision.
    Multimodal,
}

/// Model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// Language model.
    Lm,
    /// Vision-language model.
    Vlm,
}

/// Tokenizer metadata carried on the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenizerMeta {
    /// Vocabulary size, when known.
    pub vocab_size: Option<u32>,
    /// BOS token literal.
    pub bos_token: Option<String>,
    /// EOS token literal.
    pub eos_token: Option<String>,
}

/// Immutable identity of a model.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModelDescriptor {
    /// Model id (registry id or local name). Never empty.
    pub id: String,
    /// Optional named variant of the model.
    pub variant: Option<String>,
    /// Optional revision pin.
    pub revision: Option<String>,
    /// Weight source.
    pub source: ModelSource,
    /// Path for local sources.
    pub local_path: Option<PathBuf>,
    /// Input modality.
    pub modality: Modality,
    /// Model family.
    pub family: ModelFamily,
    /// Tokenizer metadata, when known up front.
    pub tokenizer: Option<TokenizerMeta>,
}

impl ModelDescriptor {
    /// Descriptor for a hub-sourced text LM with defaults everywhere else.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            variant: None,
            revision: None,
            source: ModelSource::HuggingFace,
            local_path: None,
            modality: Modality::Text,
            family: ModelFamily::Lm,
            tokenizer: None,
        }
    }

    /// Pin a revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Use a local weight directory.
    #[must_use]
    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = ModelSource::Local;
        self.local_path = Some(path.into());
        self
    }

    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty id or a local source without a path.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(EngineError::Validation("model id must not be empty".into()));
        }
        if self.source == ModelSource::Local && self.local_path.is_none() {
            return Err(EngineError::Validation(format!(
                "local model {} needs a local_path",
                self.id
            )));
        }
        Ok(())
    }

    /// Identity including the variant, used for fingerprinting.
    #[must_use]
    pub fn qualified_id(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}@{variant}", self.id),
            None => self.id.clone(),
        }
    }
}

/// Options for one load call.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// What to load.
    pub descriptor: ModelDescriptor,
    /// Quantisation selector.
    pub quantization: Option<String>,
    /// Context length override.
    pub context_length: Option<u32>,
}

impl LoadOptions {
    /// Options with defaults for a descriptor.
    #[must_use]
    pub fn new(descriptor: ModelDescriptor) -> Self {
        Self {
            descriptor,
            quantization: None,
            context_length: None,
        }
    }

    fn fingerprint_inputs(&self) -> FingerprintInputs {
        FingerprintInputs {
            model_id: self.descriptor.qualified_id(),
            revision: self.descriptor.revision.clone(),
            quantization: self.quantization.clone(),
        }
    }
}

/// Handle lifecycle state. Externally observable handles are `Ready`;
/// failed loads surface as errors, not handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Load in progress (internal).
    Loading,
    /// Bound in every runtime lane.
    Ready,
    /// Load failed (internal).
    Failed,
}

/// A ready model. Immutable; staleness is detected via the embedded
/// generation.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    /// Identity.
    pub descriptor: ModelDescriptor,
    /// Always `Ready` for externally visible handles.
    pub state: HandleState,
    /// Effective context length.
    pub context_length: u32,
    /// Opaque runtime metadata from the load.
    pub runtime_metadata: Value,
    /// Runtime generation this handle is bound to.
    pub generation: u64,
    /// Artifact fingerprint.
    pub fingerprint: String,
}

/// Model lifecycle notifications.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// A model became ready.
    Loaded {
        /// Model id.
        id: String,
    },
    /// A handle stopped being valid.
    Invalidated {
        /// Model id.
        id: String,
        /// `runtime_restart`, `unloaded`, or `fatal_error`.
        reason: String,
    },
}

struct ModelEntry {
    handle: Arc<ModelHandle>,
    // Held for the lifetime of the load; dropping unpins the artifacts.
    _cache_guard: CacheGuard,
}

type LoadOutcome = std::result::Result<Arc<ModelHandle>, EngineError>;

/// Tracks ready models across every runtime lane.
pub struct ModelManager {
    supervisors: Vec<Arc<RuntimeSupervisor>>,
    cache: Arc<ArtifactCache>,
    models: DashMap<String, ModelEntry>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<LoadOutcome>>>>,
    events: broadcast::Sender<ModelEvent>,
}

impl ModelManager {
    /// Build a manager over one or more runtime lanes (baseline first) and
    /// start watching for restarts.
    #[must_use]
    pub fn new(supervisors: Vec<Arc<RuntimeSupervisor>>, cache: Arc<ArtifactCache>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let manager = Arc::new(Self {
            supervisors,
            cache,
            models: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
            events,
        });
        for supervisor in &manager.supervisors {
            let manager_weak = Arc::downgrade(&manager);
            let mut runtime_events = supervisor.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = runtime_events.recv().await {
                    let Some(manager) = manager_weak.upgrade() else {
                        return;
                    };
                    match event {
                        RuntimeEvent::Restarted { generation } => {
                            warn!(generation, "runtime restarted, invalidating model handles");
                            manager.invalidate_all("runtime_restart");
                        }
                        RuntimeEvent::Fatal { .. } => {
                            manager.invalidate_all("fatal_error");
                        }
                        RuntimeEvent::Started { .. } | RuntimeEvent::Stopped => {}
                    }
                }
            });
        }
        manager
    }

    /// Subscribe to model lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    /// Load a model (or return the existing ready handle). Concurrent loads
    /// of the same fingerprint coalesce.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed descriptor; `RuntimeRestart` when the
    /// runtime restarted mid-load; otherwise the cache's or runtime's
    /// error.
    pub async fn load_model(self: &Arc<Self>, opts: LoadOptions) -> Result<Arc<ModelHandle>> {
        opts.descriptor.validate()?;
        let fingerprint = opts.fingerprint_inputs().fingerprint();

        loop {
            if let Some(handle) = self.current_handle(&opts.descriptor.id, &fingerprint) {
                return Ok(handle);
            }

            let waiter = {
                let mut inflight = self.inflight.lock();
                match inflight.get(&fingerprint) {
                    Some(rx) => Some(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(fingerprint.clone(), rx);
                        drop(inflight);

                        let result = self.load_leader(&opts, &fingerprint).await;
                        self.inflight.lock().remove(&fingerprint);
                        let _ = tx.send(Some(result.clone()));
                        return result;
                    }
                }
            };

            if let Some(mut rx) = waiter {
                loop {
                    let outcome = rx.borrow().clone();
                    match outcome {
                        Some(result) => return result,
                        None => {
                            if rx.changed().await.is_err() {
                                // Leader cancelled mid-load; retry from the top.
                                let mut inflight = self.inflight.lock();
                                if inflight
                                    .get(&fingerprint)
                                    .is_some_and(|r| r.has_changed().is_err())
                                {
                                    inflight.remove(&fingerprint);
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Unload a model. Calls after the first are no-ops returning success.
    ///
    /// # Errors
    ///
    /// Infrastructure errors from the runtime; an already-absent model is
    /// not an error.
    pub async fn unload_model(self: &Arc<Self>, model_id: &str) -> Result<()> {
        let Some((_, entry)) = self.models.remove(model_id) else {
            return Ok(());
        };
        let _ = self.events.send(ModelEvent::Invalidated {
            id: model_id.to_string(),
            reason: "unloaded".into(),
        });

        let params = UnloadParams {
            model_id: model_id.to_string(),
        };
        for supervisor in &self.supervisors {
            match supervisor
                .call_typed::<_, Value>(methods::MODEL_UNLOAD, &params, None)
                .await
            {
                // The runtime not knowing the model is the goal state.
                Ok(_) | Err(EngineError::ModelNotFound(_)) => {}
                Err(err) => {
                    warn!(model_id, error = %err, "unload RPC failed");
                }
            }
        }
        drop(entry);
        info!(model_id, "model unloaded");
        Ok(())
    }

    /// Ready handles bound to the current runtime generation.
    #[must_use]
    pub fn list_models(&self) -> Vec<Arc<ModelHandle>> {
        let generation = self.baseline().generation();
        self.models
            .iter()
            .filter(|entry| entry.value().handle.generation == generation)
            .map(|entry| Arc::clone(&entry.value().handle))
            .collect()
    }

    /// Resolve a ready, current-generation handle.
    ///
    /// # Errors
    ///
    /// `ModelNotFound` for unknown ids; `ModelInvalidated` when the handle
    /// predates the current runtime generation.
    pub fn ensure_ready(&self, model_id: &str) -> Result<Arc<ModelHandle>> {
        let entry = self
            .models
            .get(model_id)
            .ok_or_else(|| EngineError::ModelNotFound(model_id.to_string()))?;
        let handle = Arc::clone(&entry.handle);
        drop(entry);
        if handle.generation != self.baseline().generation() {
            self.models.remove(model_id);
            let _ = self.events.send(ModelEvent::Invalidated {
                id: model_id.to_string(),
                reason: "runtime_restart".into(),
            });
            return Err(EngineError::ModelInvalidated(format!(
                "{model_id} was loaded into a previous runtime generation"
            )));
        }
        Ok(handle)
    }

    /// Tokenize text on a ready model.
    ///
    /// # Errors
    ///
    /// `ModelNotFound` / `ModelInvalidated` for stale handles, otherwise
    /// the runtime's error.
    pub async fn tokenize(
        self: &Arc<Self>,
        model_id: &str,
        text: &str,
        add_bos: Option<bool>,
    ) -> Result<TokenizeResult> {
        self.ensure_ready(model_id)?;
        self.baseline()
            .call_typed(
                methods::TOKENIZE,
                &TokenizeParams {
                    model_id: model_id.to_string(),
                    text: text.to_string(),
                    add_bos,
                },
                None,
            )
            .await
    }

    /// Inverse of [`ModelManager::tokenize`].
    ///
    /// # Errors
    ///
    /// As [`ModelManager::tokenize`].
    pub async fn detokenize(
        self: &Arc<Self>,
        model_id: &str,
        tokens: Vec<u32>,
    ) -> Result<DetokenizeResult> {
        self.ensure_ready(model_id)?;
        self.baseline()
            .call_typed(
                methods::DETOKENIZE,
                &DetokenizeParams {
                    model_id: model_id.to_string(),
                    tokens,
                },
                None,
            )
            .await
    }

    /// Drop every handle, emitting `Invalidated` per model.
    pub fn invalidate_all(&self, reason: &str) {
        let ids: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if self.models.remove(&id).is_some() {
                let _ = self.events.send(ModelEvent::Invalidated {
                    id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn baseline(&self) -> &Arc<RuntimeSupervisor> {
        &self.supervisors[0]
    }

    fn current_handle(&self, model_id: &str, fingerprint: &str) -> Option<Arc<ModelHandle>> {
        let entry = self.models.get(model_id)?;
        let handle = Arc::clone(&entry.handle);
        drop(entry);
        (handle.fingerprint == fingerprint
            && handle.generation == self.baseline().generation())
        .then_some(handle)
    }

    async fn load_leader(self: &Arc<Self>, opts: &LoadOptions, fingerprint: &str) -> LoadOutcome {
        let generation = self.baseline().generation();
        let inputs = opts.fingerprint_inputs();
        let descriptor_meta = json!({
            "model_id": opts.descriptor.qualified_id(),
            "source": opts.descriptor.source.as_str(),
        });

        // Warm path: artifacts cached, bind with model/attach everywhere.
        let (guard, load_result) = match self.cache.get(fingerprint) {
            Some(guard) => {
                let result = self.attach_lane(0, fingerprint, guard.dir.as_path()).await?;
                for lane in 1..self.supervisors.len() {
                    self.attach_lane(lane, fingerprint, guard.dir.as_path()).await?;
                }
                (guard, result)
            }
            None => {
                // Cold path: the baseline runtime materializes shards, the
                // cache ingests them; other lanes attach from the cache.
                let load_slot: Arc<Mutex<Option<LoadResult>>> = Arc::new(Mutex::new(None));
                let baseline = Arc::clone(self.baseline());
                let load_slot_writer = Arc::clone(&load_slot);
                let load_params = LoadParams {
                    model_id: opts.descriptor.qualified_id(),
                    source: opts.descriptor.source.as_str().to_string(),
                    local_path: opts
                        .descriptor
                        .local_path
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    revision: opts.descriptor.revision.clone(),
                    quantization: opts.quantization.clone(),
                    context_length: opts.context_length,
                };

                let guard = self
                    .cache
                    .get_or_populate(&inputs, descriptor_meta, move |mut writer| async move {
                        let result: LoadResult = baseline
                            .call_typed(methods::MODEL_LOAD, &load_params, None)
                            .await?;
                        for shard in &result.shards {
                            let source = Path::new(&shard.path);
                            let file_name = source
                                .file_name()
                                .and_then(|n| n.to_str())
                                .ok_or_else(|| {
                                    EngineError::CacheCorrupt(format!(
                                        "runtime reported a shard with no file name: {}",
                                        shard.path
                                    ))
                                })?;
                            writer.import_shard(file_name, source).await?;
                        }
                        *load_slot_writer.lock() = Some(result);
                        Ok(writer)
                    })
                    .await?;

                let result = match load_slot.lock().take() {
                    // This caller was the populate leader: baseline already
                    // has the model from model/load.
                    Some(result) => result,
                    // Joined someone else's populate: bind baseline too.
                    None => self.attach_lane(0, fingerprint, guard.dir.as_path()).await?,
                };
                for lane in 1..self.supervisors.len() {
                    self.attach_lane(lane, fingerprint, guard.dir.as_path()).await?;
                }
                (guard, result)
            }
        };

        // A restart mid-load means the runtime no longer has this model.
        if self.baseline().generation() != generation {
            return Err(EngineError::RuntimeRestart(format!(
                "runtime restarted while loading {}",
                opts.descriptor.id
            )));
        }

        let handle = Arc::new(ModelHandle {
            descriptor: opts.descriptor.clone(),
            state: HandleState::Ready,
            context_length: load_result.context_length,
            runtime_metadata: load_result.metadata,
            generation,
            fingerprint: fingerprint.to_string(),
        });
        self.models.insert(
            opts.descriptor.id.clone(),
            ModelEntry {
                handle: Arc::clone(&handle),
                _cache_guard: guard,
            },
        );
        let _ = self.events.send(ModelEvent::Loaded {
            id: opts.descriptor.id.clone(),
        });
        info!(
            model_id = %opts.descriptor.id,
            fingerprint,
            context_length = handle.context_length,
            "model ready"
        );
        Ok(handle)
    }

    async fn attach_lane(
        &self,
        lane: usize,
        fingerprint: &str,
        artifact_dir: &Path,
    ) -> Result<LoadResult> {
        self.supervisors[lane]
            .call_typed(
                methods::MODEL_ATTACH,
                &AttachParams {
                    fingerprint: fingerprint.to_string(),
                    artifact_dir: artifact_dir.display().to_string(),
                },
                None,
            )
            .await
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("models", &self.models.len())
            .field("lanes", &self.supervisors.len())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_validation() {
        assert!(ModelDescriptor::new("llama-3.2-3b-instruct").validate().is_ok());
        assert!(ModelDescriptor::new("").validate().is_err());

        let mut local = ModelDescriptor::new("m");
        local.source = ModelSource::Local;
        assert!(local.validate().is_err());
        assert!(ModelDescriptor::new("m")
            .with_local_path("/models/m")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_qualified_id_includes_variant() {
        let mut descriptor = ModelDescriptor::new("m");
        assert_eq!(descriptor.qualified_id(), "m");
        descriptor.variant = Some("instruct".into());
        assert_eq!(descriptor.qualified_id(), "m@instruct");
    }

    #[test]
    fn test_fingerprint_varies_by_load_options() {
        let descriptor = ModelDescriptor::new("m").with_revision("r1");
        let base = LoadOptions::new(descriptor.clone());
        let mut quantized = LoadOptions::new(descriptor);
        quantized.quantization = Some("q4".into());
        assert_ne!(
            base.fingerprint_inputs().fingerprint(),
            quantized.fingerprint_inputs().fingerprint()
        );
        // Context length is a runtime knob, not an artifact identity input.
        let mut ctx = base.clone();
        ctx.context_length = Some(2048);
        assert_eq!(
            base.fingerprint_inputs().fingerprint(),
            ctx.fingerprint_inputs().fingerprint()
        );
    }

    #[test]
    fn test_source_wire_strings() {
        assert_eq!(ModelSource::HuggingFace.as_str(), "huggingface");
        assert_eq!(ModelSource::Local.as_str(), "local");
    }
}

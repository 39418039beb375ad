// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Two-tier artifact cache with warm-start semantics.
//!
//! The memory tier is the entry map plus an LRU recency index; the disk
//! tier holds the manifests and shard blobs (see [`disk`]). Invariants:
//!
//! - At most one concurrent populate per fingerprint; waiters join the
//!   in-flight populate and receive the same entry.
//! - The summed entry sizes never exceed the configured cap: populate
//!   evicts unpinned least-recently-used entries until the new total fits,
//!   before returning. If nothing evictable remains the populate fails and
//!   leaves no entry and no files.
//! - Eviction only ever selects entries with no pins.
//! - A failed populate leaves no partial state: shards are staged in a
//!   temp directory that is renamed into place only on success.

pub mod disk;
pub mod manifest;

use crate::config::CacheConfig;
use crate::errors::{EngineError, Result};
use crate::metrics;
use crate::metrics_constants::{
    METRIC_CACHE_EVICTIONS_TOTAL, METRIC_CACHE_HITS_TOTAL, METRIC_CACHE_MISSES_TOTAL,
    METRIC_CACHE_SIZE_BYTES,
};
use crate::sync::math::ratio;
use chrono::{DateTime, Utc};
use lru::LruCache;
use manifest::{FingerprintInputs, Manifest, ShardMeta};
use parking_lot::Mutex;
use prometheus::{Counter, Gauge};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

static CACHE_HITS: LazyLock<Counter> =
    LazyLock::new(|| metrics::counter(METRIC_CACHE_HITS_TOTAL, "Total cache hits"));
static CACHE_MISSES: LazyLock<Counter> =
    LazyLock::new(|| metrics::counter(METRIC_CACHE_MISSES_TOTAL, "Total cache misses"));
static CACHE_EVICTIONS: LazyLock<Counter> =
    LazyLock::new(|| metrics::counter(METRIC_CACHE_EVICTIONS_TOTAL, "Total cache evictions"));
static CACHE_SIZE: LazyLock<Gauge> = LazyLock::new(|| {
    metrics::gauge(METRIC_CACHE_SIZE_BYTES, "Bytes currently held by cache entries")
});

/// One ready cache entry. Immutable once inserted.
#[derive(Debug)]
pub struct CacheEntry {
    /// Entry fingerprint.
    pub fingerprint: String,
    /// Final on-disk directory.
    pub dir: PathBuf,
    /// Ordered shard list.
    pub shards: Vec<ShardMeta>,
    /// Sum of shard sizes.
    pub size_bytes: u64,
    /// Population time.
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Absolute path of one shard.
    #[must_use]
    pub fn shard_path(&self, shard: &ShardMeta) -> PathBuf {
        self.dir.join(&shard.file_name)
    }
}

/// RAII pin on a cache entry; dropping unpins.
pub struct CacheGuard {
    cache: Arc<ArtifactCache>,
    entry: Arc<CacheEntry>,
}

impl CacheGuard {
    /// The pinned entry.
    #[must_use]
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl std::ops::Deref for CacheGuard {
    type Target = CacheEntry;
    fn deref(&self) -> &CacheEntry {
        &self.entry
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        self.cache.unpin(&self.entry.fingerprint);
    }
}

impl std::fmt::Debug for CacheGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGuard")
            .field("fingerprint", &self.entry.fingerprint)
            .finish()
    }
}

type PopulateResult = std::result::Result<Arc<CacheEntry>, EngineError>;

/// Outcome of [`ArtifactCache::arbitrate`].
enum Arbitration {
    /// Already cached; pinned and ready.
    Hit(CacheGuard),
    /// Another caller is populating; join its result.
    Join(watch::Receiver<Option<PopulateResult>>),
    /// This caller must populate; the sender broadcasts the outcome.
    Lead(watch::Sender<Option<PopulateResult>>),
}

/// Outcome of [`ArtifactCache::insert_and_evict`].
enum CommitOutcome {
    /// Entry fits under the cap; carries what eviction doomed.
    Fit(Vec<(String, PathBuf)>),
    /// Entry had to be rolled back; carries what eviction doomed.
    OverCap(Vec<(String, PathBuf)>),
}

struct EntryState {
    entry: Arc<CacheEntry>,
    ref_count: u32,
}

struct CacheInner {
    entries: HashMap<String, EntryState>,
    recency: LruCache<String, ()>,
    total_bytes: u64,
    populating: HashMap<String, watch::Receiver<Option<PopulateResult>>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    validated_ok: bool,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Ready entries.
    pub entry_count: usize,
    /// Bytes held by ready entries.
    pub total_bytes: u64,
    /// Configured cap.
    pub capacity_bytes: u64,
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses.
    pub misses: u64,
    /// Entries evicted.
    pub evictions: u64,
    /// hits / (hits + misses).
    pub hit_rate: f64,
}

/// Health rollup for the readiness endpoint.
#[derive(Debug, Clone)]
pub struct CacheHealth {
    /// Startup validation passed (or was disabled).
    pub validated: bool,
    /// Current hit rate.
    pub hit_rate: f64,
    /// Ready entries.
    pub entry_count: usize,
    /// Bytes held.
    pub total_bytes: u64,
}

/// Outcome of startup validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Entries that passed and were loaded.
    pub loaded: usize,
    /// Entries dropped as corrupt.
    pub dropped: usize,
}

/// Keyed fingerprint → artifact cache.
pub struct ArtifactCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ArtifactCache {
    /// Create a cache over `config.directory`. Call
    /// [`ArtifactCache::validate_startup`] before serving when
    /// `validate_on_startup` is set.
    #[must_use]
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: LruCache::unbounded(),
                total_bytes: 0,
                populating: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                validated_ok: true,
            }),
        })
    }

    /// Look up and pin an entry. Counts toward the hit rate.
    #[must_use]
    pub fn get(self: &Arc<Self>, fingerprint: &str) -> Option<CacheGuard> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(fingerprint) {
            Some(state) => {
                state.ref_count += 1;
                let entry = Arc::clone(&state.entry);
                inner.recency.get(fingerprint); // refresh recency
                inner.hits += 1;
                CACHE_HITS.inc();
                Some(CacheGuard {
                    cache: Arc::clone(self),
                    entry,
                })
            }
            None => {
                inner.misses += 1;
                CACHE_MISSES.inc();
                None
            }
        }
    }

    /// Pin an entry without touching the hit/miss counters.
    #[must_use]
    pub fn pin(self: &Arc<Self>, fingerprint: &str) -> Option<CacheGuard> {
        let mut inner = self.inner.lock();
        let state = inner.entries.get_mut(fingerprint)?;
        state.ref_count += 1;
        let entry = Arc::clone(&state.entry);
        inner.recency.get(fingerprint);
        Some(CacheGuard {
            cache: Arc::clone(self),
            entry,
        })
    }

    /// Get the entry for `fingerprint`, populating it if missing.
    ///
    /// `writer` receives a [`disk::ShardWriter`] staged in a temp directory
    /// and returns it with all shards written. Concurrent callers for the
    /// same fingerprint join the in-flight populate.
    ///
    /// # Errors
    ///
    /// The writer's error, or `CacheCorrupt` when the entry cannot be
    /// committed (IO failure, or cap exceeded with nothing evictable).
    pub async fn get_or_populate<F, Fut>(
        self: &Arc<Self>,
        inputs: &FingerprintInputs,
        runtime_metadata: Value,
        writer: F,
    ) -> Result<CacheGuard>
    where
        F: FnOnce(disk::ShardWriter) -> Fut,
        Fut: Future<Output = Result<disk::ShardWriter>>,
    {
        let fingerprint = inputs.fingerprint();
        let mut writer = Some(writer);
        loop {
            // Fast path + single-flight arbitration under one lock. Kept in
            // a non-async helper so the `MutexGuard` never lives inside this
            // async fn's state (parking_lot's guard is not `Send`).
            match self.arbitrate(&fingerprint) {
                Arbitration::Hit(guard) => return Ok(guard),
                Arbitration::Lead(tx) => {
                    // This caller is the populate leader.
                    let writer = writer.take().ok_or_else(|| {
                        EngineError::CacheCorrupt(
                            "populate writer consumed by an earlier attempt".into(),
                        )
                    })?;
                    let result = self
                        .populate_leader(&fingerprint, inputs, runtime_metadata.clone(), writer)
                        .await;
                    {
                        let mut inner = self.inner.lock();
                        inner.populating.remove(&fingerprint);
                    }
                    let _ = tx.send(Some(result.clone()));
                    return result.map(|entry| CacheGuard {
                        cache: Arc::clone(self),
                        entry,
                    });
                }
                Arbitration::Join(mut rx) => {
                    loop {
                        let outcome = rx.borrow().clone();
                        match outcome {
                            Some(Ok(_)) => break,
                            Some(Err(err)) => return Err(err),
                            None => {
                                if rx.changed().await.is_err() {
                                    // Leader vanished (cancelled mid-populate):
                                    // clear the stale slot and retry as leader.
                                    let mut inner = self.inner.lock();
                                    if inner
                                        .populating
                                        .get(&fingerprint)
                                        .is_some_and(|r| r.has_changed().is_err())
                                    {
                                        inner.populating.remove(&fingerprint);
                                    }
                                    break;
                                }
                            }
                        }
                    }
                    // Pin whatever the leader produced; loop again if it was
                    // evicted in the gap.
                    if let Some(guard) = self.pin(&fingerprint) {
                        return Ok(guard);
                    }
                }
            }
        }
    }

    /// Synchronous lock arbitration for [`Self::get_or_populate`]: resolves
    /// a cache hit, joins an in-flight populate, or claims populate
    /// leadership. Split out so no `MutexGuard` is ever live across an
    /// `.await` point.
    fn arbitrate(self: &Arc<Self>, fingerprint: &str) -> Arbitration {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.get_mut(fingerprint) {
            state.ref_count += 1;
            let entry = Arc::clone(&state.entry);
            inner.recency.get(fingerprint);
            inner.hits += 1;
            CACHE_HITS.inc();
            return Arbitration::Hit(CacheGuard {
                cache: Arc::clone(self),
                entry,
            });
        }
        match inner.populating.get(fingerprint) {
            Some(rx) => Arbitration::Join(rx.clone()),
            None => {
                inner.misses += 1;
                CACHE_MISSES.inc();
                let (tx, rx) = watch::channel(None);
                inner.populating.insert(fingerprint.to_string(), rx);
                Arbitration::Lead(tx)
            }
        }
    }

    /// Drop an entry and its files regardless of recency. Outstanding
    /// guards keep the `Arc` alive; the disk space is reclaimed now.
    pub async fn invalidate(self: &Arc<Self>, fingerprint: &str) {
        let dir = {
            let mut inner = self.inner.lock();
            let Some(state) = inner.entries.remove(fingerprint) else {
                return;
            };
            inner.recency.pop(fingerprint);
            inner.total_bytes = inner.total_bytes.saturating_sub(state.entry.size_bytes);
            CACHE_SIZE.set(inner.total_bytes as f64);
            state.entry.dir.clone()
        };
        disk::remove_entry(&dir).await;
    }

    /// Scan the cache directory, verify shard hashes against manifests,
    /// drop corrupt entries, and load the survivors.
    ///
    /// # Errors
    ///
    /// `CacheCorrupt` when the directory itself cannot be scanned.
    pub async fn validate_startup(self: &Arc<Self>) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        // Leftover staging directories are failed populates from a previous
        // process; reclaim them.
        disk::remove_entry(&self.config.directory.join(disk::STAGING_DIR)).await;

        let mut found = Vec::new();
        for dir in disk::scan_entries(&self.config.directory).await? {
            match self.validate_entry(&dir).await {
                Ok(manifest) => found.push((dir, manifest)),
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "dropping corrupt cache entry");
                    disk::remove_entry(&dir).await;
                    report.dropped += 1;
                }
            }
        }

        // Oldest first, so the LRU order starts out age-based.
        found.sort_by_key(|(_, manifest)| manifest.created_at);
        let mut doomed = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (dir, manifest) in found {
                let size_bytes = manifest.total_bytes();
                let entry = Arc::new(CacheEntry {
                    fingerprint: manifest.fingerprint.clone(),
                    dir,
                    shards: manifest.shards,
                    size_bytes,
                    created_at: manifest.created_at,
                });
                inner.recency.put(manifest.fingerprint.clone(), ());
                inner.entries.insert(
                    manifest.fingerprint.clone(),
                    EntryState {
                        entry,
                        ref_count: 0,
                    },
                );
                inner.total_bytes += size_bytes;
                report.loaded += 1;
            }
            doomed.extend(Self::evict_locked(
                &mut inner,
                self.config.max_size_bytes,
                None,
            ));
            inner.validated_ok = true;
            CACHE_SIZE.set(inner.total_bytes as f64);
        }
        self.reap_evicted(doomed).await;

        info!(
            loaded = report.loaded,
            dropped = report.dropped,
            "cache startup validation finished"
        );
        Ok(report)
    }

    /// Mark validation as failed; health reports degrade but the cache
    /// keeps serving what it has.
    pub fn mark_validation_failed(&self) {
        self.inner.lock().validated_ok = false;
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entry_count: inner.entries.len(),
            total_bytes: inner.total_bytes,
            capacity_bytes: self.config.max_size_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: ratio(inner.hits, inner.hits + inner.misses),
        }
    }

    /// Health rollup.
    #[must_use]
    pub fn get_health(&self) -> CacheHealth {
        let inner = self.inner.lock();
        CacheHealth {
            validated: inner.validated_ok,
            hit_rate: ratio(inner.hits, inner.hits + inner.misses),
            entry_count: inner.entries.len(),
            total_bytes: inner.total_bytes,
        }
    }

    fn unpin(&self, fingerprint: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.entries.get_mut(fingerprint) {
            state.ref_count = state.ref_count.saturating_sub(1);
        }
    }

    async fn validate_entry(&self, dir: &std::path::Path) -> Result<Manifest> {
        let manifest = disk::read_manifest(dir).await?;
        for shard in &manifest.shards {
            let path = dir.join(&shard.file_name);
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                EngineError::CacheCorrupt(format!("missing shard {}: {e}", path.display()))
            })?;
            if metadata.len() != shard.size_bytes {
                return Err(EngineError::CacheCorrupt(format!(
                    "shard {} is {} bytes, manifest says {}",
                    path.display(),
                    metadata.len(),
                    shard.size_bytes
                )));
            }
            let digest = disk::hash_file(&path).await?;
            if digest != shard.sha256 {
                return Err(EngineError::CacheCorrupt(format!(
                    "shard {} hash mismatch",
                    path.display()
                )));
            }
        }
        Ok(manifest)
    }

    async fn populate_leader<F, Fut>(
        self: &Arc<Self>,
        fingerprint: &str,
        inputs: &FingerprintInputs,
        runtime_metadata: Value,
        writer: F,
    ) -> PopulateResult
    where
        F: FnOnce(disk::ShardWriter) -> Fut,
        Fut: Future<Output = Result<disk::ShardWriter>>,
    {
        let staging = self
            .config
            .directory
            .join(disk::STAGING_DIR)
            .join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| EngineError::CacheCorrupt(format!("staging dir: {e}")))?;

        let result = self
            .populate_in_staging(fingerprint, inputs, runtime_metadata, writer, &staging)
            .await;
        if result.is_err() {
            // A failed populate leaves no entry and no on-disk partials.
            disk::remove_entry(&staging).await;
        }
        result
    }

    async fn populate_in_staging<F, Fut>(
        self: &Arc<Self>,
        fingerprint: &str,
        inputs: &FingerprintInputs,
        runtime_metadata: Value,
        writer: F,
        staging: &std::path::Path,
    ) -> PopulateResult
    where
        F: FnOnce(disk::ShardWriter) -> Fut,
        Fut: Future<Output = Result<disk::ShardWriter>>,
    {
        let shard_writer = disk::ShardWriter::new(staging.to_path_buf());
        let shard_writer = writer(shard_writer).await?;
        if shard_writer.shards().is_empty() {
            return Err(EngineError::CacheCorrupt(
                "populate produced no shards".into(),
            ));
        }

        let created_at = Utc::now();
        let shards = {
            let manifest = Manifest {
                fingerprint: fingerprint.to_string(),
                created_at,
                inputs: inputs.clone(),
                shards: shard_writer.shards().to_vec(),
                runtime_metadata,
            };
            disk::write_manifest(shard_writer.staging_dir(), &manifest).await?;
            shard_writer.into_shards()
        };

        let final_dir = disk::entry_dir(&self.config.directory, fingerprint);
        if let Some(parent) = final_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::CacheCorrupt(format!("entry parent dir: {e}")))?;
        }
        // A stale directory for this fingerprint (crashed process) loses to
        // the fresh populate.
        disk::remove_entry(&final_dir).await;
        tokio::fs::rename(staging, &final_dir)
            .await
            .map_err(|e| EngineError::CacheCorrupt(format!("commit rename: {e}")))?;

        let size_bytes: u64 = shards.iter().map(|s| s.size_bytes).sum();
        let entry = Arc::new(CacheEntry {
            fingerprint: fingerprint.to_string(),
            dir: final_dir.clone(),
            shards,
            size_bytes,
            created_at,
        });

        // Insert pinned-by-caller, then enforce the cap strictly before
        // returning (spec: evict-until-fit, not best effort).
        match self.insert_and_evict(fingerprint, &entry, size_bytes) {
            CommitOutcome::OverCap(doomed) => {
                self.reap_evicted(doomed).await;
                disk::remove_entry(&final_dir).await;
                Err(EngineError::CacheCorrupt(format!(
                    "entry of {size_bytes} bytes cannot fit under the cap with every other entry pinned"
                )))
            }
            CommitOutcome::Fit(doomed) => {
                self.reap_evicted(doomed).await;
                Ok(entry)
            }
        }
    }

    /// Synchronous insert + evict-until-fit for [`Self::populate_leader`].
    /// Split out so no `MutexGuard` is ever live across an `.await` point.
    fn insert_and_evict(
        self: &Arc<Self>,
        fingerprint: &str,
        entry: &Arc<CacheEntry>,
        size_bytes: u64,
    ) -> CommitOutcome {
        let mut inner = self.inner.lock();
        inner.recency.put(fingerprint.to_string(), ());
        inner.entries.insert(
            fingerprint.to_string(),
            EntryState {
                entry: Arc::clone(entry),
                ref_count: 1,
            },
        );
        inner.total_bytes += size_bytes;
        let doomed = Self::evict_locked(&mut inner, self.config.max_size_bytes, Some(fingerprint));
        if inner.total_bytes > self.config.max_size_bytes {
            // Everything else is pinned: roll our own entry back out.
            inner.entries.remove(fingerprint);
            inner.recency.pop(fingerprint);
            inner.total_bytes = inner.total_bytes.saturating_sub(size_bytes);
            CACHE_SIZE.set(inner.total_bytes as f64);
            return CommitOutcome::OverCap(doomed);
        }
        CACHE_SIZE.set(inner.total_bytes as f64);
        CommitOutcome::Fit(doomed)
    }

    /// Evict unpinned entries in least-recently-used order until the total
    /// fits under `cap`. Returns what to delete from disk.
    fn evict_locked(
        inner: &mut CacheInner,
        cap: u64,
        protect: Option<&str>,
    ) -> Vec<(String, PathBuf)> {
        let mut doomed = Vec::new();
        while inner.total_bytes > cap {
            // lru iterates most-recent first; take the last evictable.
            let candidate = inner
                .recency
                .iter()
                .rev()
                .map(|(key, ())| key.clone())
                .find(|key| {
                    protect != Some(key.as_str())
                        && inner
                            .entries
                            .get(key)
                            .is_some_and(|state| state.ref_count == 0)
                });
            let Some(key) = candidate else {
                break;
            };
            if let Some(state) = inner.entries.remove(&key) {
                inner.recency.pop(&key);
                inner.total_bytes = inner.total_bytes.saturating_sub(state.entry.size_bytes);
                inner.evictions += 1;
                CACHE_EVICTIONS.inc();
                doomed.push((key, state.entry.dir.clone()));
            }
        }
        doomed
    }

    /// Delete evicted entry directories, skipping any fingerprint that was
    /// repopulated between the eviction decision and now.
    async fn reap_evicted(self: &Arc<Self>, doomed: Vec<(String, PathBuf)>) {
        for (fingerprint, dir) in doomed {
            let resurrected = self.inner.lock().entries.contains_key(&fingerprint);
            if !resurrected {
                disk::remove_entry(&dir).await;
            }
        }
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ArtifactCache")
            .field("entries", &stats.entry_count)
            .field("total_bytes", &stats.total_bytes)
            .field("capacity_bytes", &stats.capacity_bytes)
            .finish()
    }
}

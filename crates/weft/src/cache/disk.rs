// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Disk layout and IO for the artifact cache.
//!
//! Layout: `<cacheDir>/<first2(fingerprint)>/<fingerprint>/manifest.json`
//! plus shard blobs. Entries are staged under `<cacheDir>/.staging/<uuid>`
//! and renamed into place only when fully written, so a crashed or failed
//! populate never leaves a partial entry where the scanner would find one.

use crate::cache::manifest::{Manifest, ShardMeta};
use crate::errors::{EngineError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Manifest file name inside an entry directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Staging area name under the cache root.
pub const STAGING_DIR: &str = ".staging";

const IO_CHUNK: usize = 64 * 1024;

/// Final directory for a fingerprint.
#[must_use]
pub fn entry_dir(root: &Path, fingerprint: &str) -> PathBuf {
    // Fingerprints are hex, so the first two characters are a safe shard
    // prefix.
    let prefix = &fingerprint[..fingerprint.len().min(2)];
    root.join(prefix).join(fingerprint)
}

/// Write an entry manifest atomically (tmp + rename).
///
/// # Errors
///
/// `CacheCorrupt` on any IO failure.
pub async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    let text = serde_json::to_vec_pretty(manifest)
        .map_err(|e| EngineError::CacheCorrupt(format!("manifest encode: {e}")))?;
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    let path = dir.join(MANIFEST_FILE);
    tokio::fs::write(&tmp, &text)
        .await
        .map_err(|e| EngineError::CacheCorrupt(format!("manifest write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| EngineError::CacheCorrupt(format!("manifest rename {}: {e}", path.display())))
}

/// Read an entry manifest.
///
/// # Errors
///
/// `CacheCorrupt` when missing or unparseable.
pub async fn read_manifest(dir: &Path) -> Result<Manifest> {
    let path = dir.join(MANIFEST_FILE);
    let text = tokio::fs::read(&path)
        .await
        .map_err(|e| EngineError::CacheCorrupt(format!("manifest read {}: {e}", path.display())))?;
    serde_json::from_slice(&text)
        .map_err(|e| EngineError::CacheCorrupt(format!("manifest parse {}: {e}", path.display())))
}

/// Hex SHA-256 of a file, streamed in chunks.
///
/// # Errors
///
/// `CacheCorrupt` on IO failure.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| EngineError::CacheCorrupt(format!("open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| EngineError::CacheCorrupt(format!("read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Remove an entry directory; missing directories are fine.
pub async fn remove_entry(dir: &Path) {
    let _ = tokio::fs::remove_dir_all(dir).await;
}

/// Find every entry directory under the cache root (two-level layout).
///
/// # Errors
///
/// `CacheCorrupt` when the root cannot be listed.
pub async fn scan_entries(root: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut prefixes = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        // A cache that has never been written is empty, not broken.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => {
            return Err(EngineError::CacheCorrupt(format!(
                "list {}: {e}",
                root.display()
            )))
        }
    };
    while let Ok(Some(prefix)) = prefixes.next_entry().await {
        let prefix_path = prefix.path();
        if !prefix_path.is_dir() || prefix.file_name() == STAGING_DIR {
            continue;
        }
        if let Ok(mut dirs) = tokio::fs::read_dir(&prefix_path).await {
            while let Ok(Some(entry)) = dirs.next_entry().await {
                let path = entry.path();
                if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                    entries.push(path);
                }
            }
        }
    }
    Ok(entries)
}

/// Streams shards into a staging directory, hashing as it writes.
///
/// On success the cache renames the whole staging directory into its final
/// location; on failure the staging directory is deleted wholesale.
#[derive(Debug)]
pub struct ShardWriter {
    staging_dir: PathBuf,
    shards: Vec<ShardMeta>,
}

impl ShardWriter {
    pub(crate) fn new(staging_dir: PathBuf) -> Self {
        Self {
            staging_dir,
            shards: Vec::new(),
        }
    }

    pub(crate) fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub(crate) fn into_shards(self) -> Vec<ShardMeta> {
        self.shards
    }

    /// Shards written so far, in order.
    #[must_use]
    pub fn shards(&self) -> &[ShardMeta] {
        &self.shards
    }

    /// Stream one shard in, recording its size and content hash.
    ///
    /// # Errors
    ///
    /// `CacheCorrupt` on IO failure or a duplicate shard name.
    pub async fn write_shard<R>(&mut self, file_name: &str, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        if file_name.is_empty() || file_name.contains(['/', '\\']) {
            return Err(EngineError::Validation(format!(
                "invalid shard name {file_name:?}"
            )));
        }
        if self.shards.iter().any(|s| s.file_name == file_name) {
            return Err(EngineError::CacheCorrupt(format!(
                "duplicate shard {file_name}"
            )));
        }

        let path = self.staging_dir.join(file_name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| EngineError::CacheCorrupt(format!("create {}: {e}", path.display())))?;

        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;
        let mut buf = vec![0u8; IO_CHUNK];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| EngineError::CacheCorrupt(format!("shard read: {e}")))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size_bytes += n as u64;
            file.write_all(&buf[..n])
                .await
                .map_err(|e| EngineError::CacheCorrupt(format!("write {}: {e}", path.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| EngineError::CacheCorrupt(format!("flush {}: {e}", path.display())))?;

        self.shards.push(ShardMeta {
            file_name: file_name.to_string(),
            size_bytes,
            sha256: hex::encode(hasher.finalize()),
        });
        Ok(())
    }

    /// Copy a shard from a file the runtime already materialized.
    ///
    /// # Errors
    ///
    /// As [`ShardWriter::write_shard`].
    pub async fn import_shard(&mut self, file_name: &str, source: &Path) -> Result<()> {
        let file = tokio::fs::File::open(source)
            .await
            .map_err(|e| EngineError::CacheCorrupt(format!("open {}: {e}", source.display())))?;
        self.write_shard(file_name, file).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manifest::FingerprintInputs;
    use chrono::Utc;

    #[test]
    fn test_entry_dir_layout() {
        let dir = entry_dir(Path::new("/cache"), "abcdef0123");
        assert_eq!(dir, Path::new("/cache/ab/abcdef0123"));
    }

    #[tokio::test]
    async fn test_shard_writer_hashes_and_sizes() {
        let staging = tempfile::tempdir().unwrap();
        let mut writer = ShardWriter::new(staging.path().to_path_buf());
        writer
            .write_shard("weights.bin", &b"hello world"[..])
            .await
            .unwrap();

        let shards = writer.shards();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].size_bytes, 11);
        // sha256("hello world")
        assert_eq!(
            shards[0].sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            hash_file(&staging.path().join("weights.bin")).await.unwrap(),
            shards[0].sha256
        );
    }

    #[tokio::test]
    async fn test_shard_writer_rejects_traversal_and_duplicates() {
        let staging = tempfile::tempdir().unwrap();
        let mut writer = ShardWriter::new(staging.path().to_path_buf());
        assert!(writer.write_shard("../evil", &b"x"[..]).await.is_err());
        writer.write_shard("a.bin", &b"x"[..]).await.unwrap();
        let err = writer.write_shard("a.bin", &b"y"[..]).await.unwrap_err();
        assert!(matches!(err, EngineError::CacheCorrupt(_)));
    }

    #[tokio::test]
    async fn test_manifest_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            fingerprint: "ff00".into(),
            created_at: Utc::now(),
            inputs: FingerprintInputs {
                model_id: "m".into(),
                revision: None,
                quantization: None,
            },
            shards: Vec::new(),
            runtime_metadata: serde_json::Value::Null,
        };
        write_manifest(dir.path(), &manifest).await.unwrap();
        let back = read_manifest(dir.path()).await.unwrap();
        assert_eq!(back.fingerprint, "ff00");
        // The tmp file must not survive the rename.
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_scan_finds_entries_and_skips_staging() {
        let root = tempfile::tempdir().unwrap();
        let entry = root.path().join("ab").join("abcd");
        tokio::fs::create_dir_all(&entry).await.unwrap();
        tokio::fs::write(entry.join(MANIFEST_FILE), b"{}").await.unwrap();

        let staging = root.path().join(STAGING_DIR).join("xyz");
        tokio::fs::create_dir_all(&staging).await.unwrap();
        tokio::fs::write(staging.join(MANIFEST_FILE), b"{}").await.unwrap();

        let found = scan_entries(root.path()).await.unwrap();
        assert_eq!(found, vec![entry]);
    }

    #[tokio::test]
    async fn test_scan_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("never-created");
        assert!(scan_entries(&missing).await.unwrap().is_empty());
    }
}

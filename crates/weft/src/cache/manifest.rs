// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cache entry manifests and fingerprints.
//!
//! The manifest is written next to the shards so another process can
//! diagnose an entry without the cache: it records the ordered shard list,
//! byte sizes, content hashes, and the exact inputs that produced the
//! fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One shard file inside a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    /// File name relative to the entry directory.
    pub file_name: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the contents.
    pub sha256: String,
}

/// The inputs that determine a cache entry's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintInputs {
    /// Model id.
    pub model_id: String,
    /// Revision pin, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Quantisation selector, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
}

impl FingerprintInputs {
    /// Stable hash over the identity inputs.
    ///
    /// The encoding NUL-separates fields so adjacent values cannot collide
    /// (`"a" + "bc"` vs `"ab" + "c"`).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.revision.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(self.quantization.as_deref().unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// On-disk manifest for one cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Entry fingerprint; must match the directory name.
    pub fingerprint: String,
    /// When the entry was populated.
    pub created_at: DateTime<Utc>,
    /// Identity inputs, for diagnosis.
    pub inputs: FingerprintInputs,
    /// Ordered shard list.
    pub shards: Vec<ShardMeta>,
    /// Opaque runtime metadata captured at load time.
    #[serde(default)]
    pub runtime_metadata: Value,
}

impl Manifest {
    /// Sum of all shard sizes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.size_bytes).sum()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let inputs = FingerprintInputs {
            model_id: "llama-3.2-3b-instruct".into(),
            revision: Some("main".into()),
            quantization: Some("q4".into()),
        };
        assert_eq!(inputs.fingerprint(), inputs.fingerprint());
        assert_eq!(inputs.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_sensitive_to_every_input() {
        let base = FingerprintInputs {
            model_id: "m".into(),
            revision: Some("r1".into()),
            quantization: Some("q4".into()),
        };
        let mut other = base.clone();
        other.revision = Some("r2".into());
        assert_ne!(base.fingerprint(), other.fingerprint());

        let mut other = base.clone();
        other.quantization = None;
        assert_ne!(base.fingerprint(), other.fingerprint());

        let mut other = base.clone();
        other.model_id = "m2".into();
        assert_ne!(base.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_field_boundaries_cannot_collide() {
        let a = FingerprintInputs {
            model_id: "ab".into(),
            revision: Some("c".into()),
            quantization: None,
        };
        let b = FingerprintInputs {
            model_id: "a".into(),
            revision: Some("bc".into()),
            quantization: None,
        };
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_manifest_total_bytes() {
        let manifest = Manifest {
            fingerprint: "f".into(),
            created_at: Utc::now(),
            inputs: FingerprintInputs::default(),
            shards: vec![
                ShardMeta {
                    file_name: "model-00001.safetensors".into(),
                    size_bytes: 100,
                    sha256: "aa".into(),
                },
                ShardMeta {
                    file_name: "model-00002.safetensors".into(),
                    size_bytes: 50,
                    sha256: "bb".into(),
                },
            ],
            runtime_metadata: Value::Null,
        };
        assert_eq!(manifest.total_bytes(), 150);
    }

    #[test]
    fn test_manifest_roundtrip() {
        let manifest = Manifest {
            fingerprint: "abcd".into(),
            created_at: Utc::now(),
            inputs: FingerprintInputs {
                model_id: "m".into(),
                revision: None,
                quantization: Some("q8".into()),
            },
            shards: vec![ShardMeta {
                file_name: "weights.bin".into(),
                size_bytes: 7,
                sha256: "cc".into(),
            }],
            runtime_metadata: serde_json::json!({"context_length": 8192}),
        };
        let text = serde_json::to_string_pretty(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.fingerprint, "abcd");
        assert_eq!(back.shards, manifest.shards);
        assert_eq!(back.runtime_metadata["context_length"], 8192);
    }
}

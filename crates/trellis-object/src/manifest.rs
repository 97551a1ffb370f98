//! Persistent document shapes: head, lock, commit manifests, indices.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `meta/head.json`: the authoritative pointer to the latest commit.
/// `commit_id` 0 with no manifest path denotes an empty store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadDoc {
    pub commit_id: i64,
    pub manifest_path: Option<String>,
    pub updated_at: String,
    pub runtime_id: String,
}

/// `meta/locks/ontology_write.json`: the write lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDoc {
    pub owner_id: String,
    pub acquired_at: String,
    pub expires_at: String,
    pub lease_ttl_ms: u64,
}

/// One data file referenced by a commit manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub kind: String,
    pub type_name: String,
    pub path: String,
    pub row_count: usize,
    pub schema_version_id: Option<i64>,
    pub content_sha256: String,
}

/// `commits/<cid>-<attempt>/manifest.json`: one commit. The linked list
/// through `parent_manifest_path` is the authoritative audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub commit_id: i64,
    pub parent_commit_id: Option<i64>,
    pub parent_manifest_path: Option<String>,
    pub created_at: String,
    pub runtime_id: String,
    pub metadata: Option<Value>,
    pub files: Vec<ManifestFile>,
}

/// One advisory index entry covering a commit range of data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub min_commit_id: i64,
    pub max_commit_id: i64,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version_id: Option<i64>,
}

/// `meta/indices/<kind>/<name>.json`: advisory per-type index. Readers
/// fall back to the manifest chain when `max_indexed_commit` lags head.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexDoc {
    pub max_indexed_commit: i64,
    pub entries: Vec<IndexEntry>,
}

impl IndexEntry {
    pub fn covers(&self, commit_id: i64) -> bool {
        self.min_commit_id <= commit_id && commit_id <= self.max_commit_id
    }

    /// Whether the entry's range intersects `(lower_exclusive, upper]`.
    pub fn intersects(&self, lower_exclusive: i64, upper_inclusive: i64) -> bool {
        self.max_commit_id > lower_exclusive && self.min_commit_id <= upper_inclusive
    }
}

//! Content-addressed versioned document storage.
//!
//! Every write lands as a commit on a branch named for the document;
//! merges converge branches onto trunk. Two concrete backends share one
//! contract: a fast memory-first backend and a durable on-disk backend.
//! [`HybridStore`] composes them with primary/fallback routing and
//! best-effort cross-backend sync.

mod disk;
mod hybrid;
mod memory;

pub use disk::DiskBackend;
pub use hybrid::{HybridConfig, HybridStore, PrimaryBackend};
pub use memory::MemoryBackend;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{CommitHash, Document, DocumentSummary};

/// Errors surfaced by storage backends and the hybrid layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("merge conflict on {branch}: trunk has diverged")]
    MergeConflict { branch: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage operation cancelled")]
    Cancelled,

    #[error("all backends failed: {0}")]
    AllBackendsFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout(_) | Self::Io(_) | Self::AllBackendsFailed(_)
        )
    }
}

/// One committed write: the document tree at a branch tip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub hash: CommitHash,
    pub parent: Option<CommitHash>,
    pub branch: String,
    pub document: Document,
    pub committed_at: DateTime<Utc>,
}

impl Commit {
    /// Build a commit for a document, hashing the canonical serialization
    /// together with the parent hash, then naming the branch.
    ///
    /// Writes with a caller-assigned document id land on
    /// `ingest/<id>`; writes without one land on a branch named after the
    /// commit itself (`commit-<shorthash>`), which is why the branch name
    /// cannot participate in the hash.
    pub fn create(document: Document, parent: Option<CommitHash>) -> Result<Self, StorageError> {
        let canonical = document.canonical_bytes()?;
        let hash = CommitHash::compute(parent.as_ref(), &canonical);
        let branch = write_branch(&document, &hash);
        Ok(Self {
            hash,
            parent,
            branch,
            document,
            committed_at: Utc::now(),
        })
    }
}

/// Branch a write lands on: `ingest/<id>` when the ingest pipeline
/// assigned a document id, otherwise a branch named after the commit.
pub fn write_branch(document: &Document, hash: &CommitHash) -> String {
    if document.content.metadata.contains_key("document_id") {
        crate::models::branch_for_document(&document.id)
    } else {
        crate::models::branch_for_commit(hash)
    }
}

/// Abstract contract shared by every backend.
///
/// Implementations must be safe for concurrent readers and writers, and a
/// stored document must round-trip byte-for-byte.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short identifier used in logs and metrics.
    fn name(&self) -> &str;

    /// Persist a document as a new commit on its ingest branch. Atomic:
    /// the commit is visible by hash or not at all.
    async fn store_document(
        &self,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<CommitHash, StorageError>;

    /// Latest version of a document: its branch tip if one exists,
    /// otherwise the trunk entry.
    async fn get_document(&self, id: &str) -> Result<Document, StorageError>;

    /// Resolve a commit hash to the document committed under it.
    async fn resolve_commit(&self, hash: &CommitHash) -> Result<Document, StorageError>;

    /// Summaries of documents whose metadata matches every key/value pair
    /// in the filter exactly. An empty filter lists everything.
    async fn list_documents(
        &self,
        filter: &BTreeMap<String, String>,
    ) -> Result<Vec<DocumentSummary>, StorageError>;

    /// Fast-forward a branch into trunk. Idempotent: merging an already
    /// merged branch is a no-op. Concurrent writers of one document id
    /// produce exactly one clean merge; the loser sees a conflict.
    async fn merge_branch(&self, branch: &str) -> Result<(), StorageError>;

    /// Lightweight liveness probe.
    async fn health(&self) -> Result<(), StorageError>;

    /// Release resources. Operations after close fail.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Walk the parent chain from `tip` looking for `ancestor`.
///
/// Shared fast-forward test for merge: trunk may move onto `tip` iff the
/// current trunk entry is `tip` itself or one of its ancestors.
pub(crate) fn is_fast_forward<F>(ancestor: &CommitHash, tip: &CommitHash, parent_of: F) -> bool
where
    F: Fn(&CommitHash) -> Option<CommitHash>,
{
    if ancestor == tip {
        return true;
    }
    let mut cursor = parent_of(tip);
    while let Some(hash) = cursor {
        if &hash == ancestor {
            return true;
        }
        cursor = parent_of(&hash);
    }
    false
}

/// Resolve the commit lookup order for [`StorageBackend::get_document`]:
/// branch tip first, then trunk.
pub(crate) fn pick_version(
    branch_tip: Option<&CommitHash>,
    trunk_entry: Option<&CommitHash>,
) -> Option<CommitHash> {
    branch_tip.or(trunk_entry).cloned()
}

/// Two-level hash-prefix path for an object: `<hh>/<hash>.json`.
pub(crate) fn object_relative_path(hash: &CommitHash) -> std::path::PathBuf {
    let hex = hash.as_str();
    std::path::PathBuf::from(&hex[..2]).join(format!("{hex}.json"))
}

/// Exact-equality metadata filter used by `list_documents`.
pub(crate) fn matches_filter(document: &Document, filter: &BTreeMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(key, value)| document.content.metadata.get(key) == Some(value))
}

/// Track which backend owns which branch so merges route correctly.
pub(crate) type BranchOwners = HashMap<String, usize>;

//! Fast memory-first storage backend.
//!
//! Commits, branch refs, and the trunk map live in memory behind a
//! read-write lock. Large payloads can optionally spill to a scratch
//! directory. No durability guarantee when configured memory-only.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::{CommitHash, Document, DocumentSummary};

use super::{
    is_fast_forward, matches_filter, object_relative_path, pick_version, Commit, StorageBackend,
    StorageError,
};

/// Where a commit body lives.
#[derive(Debug, Clone)]
enum CommitSlot {
    Resident(Box<Commit>),
    /// Serialized commit spilled to a scratch file.
    Spilled(PathBuf),
}

#[derive(Debug, Default)]
struct State {
    commits: HashMap<String, CommitSlot>,
    branches: HashMap<String, CommitHash>,
    trunk: HashMap<String, CommitHash>,
}

/// Memory-backed storage with optional disk spill for large payloads.
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
    spill_dir: Option<PathBuf>,
    spill_threshold: usize,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Pure in-memory backend.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            spill_dir: None,
            spill_threshold: usize::MAX,
            closed: AtomicBool::new(false),
        }
    }

    /// Spill commits whose raw payload exceeds `threshold` bytes into
    /// `dir` instead of holding them resident.
    pub fn with_spill(dir: PathBuf, threshold: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            spill_dir: Some(dir),
            spill_threshold: threshold,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable {
                backend: "memory".to_string(),
                reason: "backend closed".to_string(),
            });
        }
        Ok(())
    }

    fn should_spill(&self, document: &Document) -> bool {
        self.spill_dir.is_some()
            && document
                .content
                .raw_bytes
                .as_ref()
                .map(|bytes| bytes.len() > self.spill_threshold)
                .unwrap_or(false)
    }

    fn spill(&self, commit: &Commit) -> Result<PathBuf, StorageError> {
        let dir = self
            .spill_dir
            .as_ref()
            .expect("spill() requires a spill dir");
        let path = dir.join(object_relative_path(&commit.hash));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec(commit)?)?;
        debug!("spilled commit {} to {}", commit.hash.short(), path.display());
        Ok(path)
    }

    fn load_slot(&self, slot: &CommitSlot) -> Result<Commit, StorageError> {
        match slot {
            CommitSlot::Resident(commit) => Ok(commit.as_ref().clone()),
            CommitSlot::Spilled(path) => {
                let bytes = std::fs::read(path)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store_document(
        &self,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<CommitHash, StorageError> {
        self.check_open()?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if !document.validate_embeddings(crate::models::EMBEDDING_DIM) {
            return Err(StorageError::InvalidDocument(format!(
                "embedding length {} does not match store dimension",
                document.content.embeddings.len()
            )));
        }

        let mut state = self.state.write().await;
        let id_branch = crate::models::branch_for_document(&document.id);
        let parent = pick_version(state.branches.get(&id_branch), state.trunk.get(&document.id));
        let commit = Commit::create(document.clone(), parent)?;
        let hash = commit.hash.clone();
        let branch = commit.branch.clone();

        let slot = if self.should_spill(document) {
            CommitSlot::Spilled(self.spill(&commit)?)
        } else {
            CommitSlot::Resident(Box::new(commit))
        };
        state.commits.insert(hash.as_str().to_string(), slot);
        state.branches.insert(branch, hash.clone());
        Ok(hash)
    }

    async fn get_document(&self, id: &str) -> Result<Document, StorageError> {
        self.check_open()?;
        let state = self.state.read().await;
        let branch = crate::models::branch_for_document(id);
        let hash = pick_version(state.branches.get(&branch), state.trunk.get(id))
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let slot = state
            .commits
            .get(hash.as_str())
            .ok_or_else(|| StorageError::CommitNotFound(hash.to_string()))?;
        Ok(self.load_slot(slot)?.document)
    }

    async fn resolve_commit(&self, hash: &CommitHash) -> Result<Document, StorageError> {
        self.check_open()?;
        let state = self.state.read().await;
        let slot = state
            .commits
            .get(hash.as_str())
            .ok_or_else(|| StorageError::CommitNotFound(hash.to_string()))?;
        Ok(self.load_slot(slot)?.document)
    }

    async fn list_documents(
        &self,
        filter: &BTreeMap<String, String>,
    ) -> Result<Vec<DocumentSummary>, StorageError> {
        self.check_open()?;
        let state = self.state.read().await;

        let mut ids: Vec<String> = state
            .branches
            .keys()
            .filter_map(|branch| branch.strip_prefix("ingest/"))
            .map(str::to_string)
            .chain(state.trunk.keys().cloned())
            .collect();
        ids.sort();
        ids.dedup();

        let mut summaries = Vec::new();
        for id in ids {
            let branch = crate::models::branch_for_document(&id);
            let Some(hash) = pick_version(state.branches.get(&branch), state.trunk.get(&id))
            else {
                continue;
            };
            let Some(slot) = state.commits.get(hash.as_str()) else {
                continue;
            };
            let commit = self.load_slot(slot)?;
            if matches_filter(&commit.document, filter) {
                summaries.push(commit.document.summary());
            }
        }
        Ok(summaries)
    }

    async fn merge_branch(&self, branch: &str) -> Result<(), StorageError> {
        self.check_open()?;
        let mut state = self.state.write().await;
        let tip = state
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| StorageError::BranchNotFound(branch.to_string()))?;
        let tip_commit = {
            let slot = state
                .commits
                .get(tip.as_str())
                .ok_or_else(|| StorageError::CommitNotFound(tip.to_string()))?;
            self.load_slot(slot)?
        };
        let doc_id = tip_commit.document.id.clone();

        match state.trunk.get(&doc_id).cloned() {
            None => {
                state.trunk.insert(doc_id, tip);
                Ok(())
            }
            Some(current) if current == tip => Ok(()),
            Some(current) => {
                let can_fast_forward = {
                    let commits = &state.commits;
                    let parent_of = |hash: &CommitHash| -> Option<CommitHash> {
                        commits.get(hash.as_str()).and_then(|slot| match slot {
                            CommitSlot::Resident(commit) => commit.parent.clone(),
                            CommitSlot::Spilled(path) => std::fs::read(path)
                                .ok()
                                .and_then(|bytes| serde_json::from_slice::<Commit>(&bytes).ok())
                                .and_then(|commit| commit.parent),
                        })
                    };
                    is_fast_forward(&current, &tip, parent_of)
                };
                if can_fast_forward {
                    state.trunk.insert(doc_id, tip);
                    Ok(())
                } else {
                    Err(StorageError::MergeConflict {
                        branch: branch.to_string(),
                    })
                }
            }
        }
    }

    async fn health(&self) -> Result<(), StorageError> {
        self.check_open()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

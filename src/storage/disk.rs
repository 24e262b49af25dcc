//! Durable on-disk content-addressed storage backend.
//!
//! Commits are JSON objects under `objects/<hh>/<hash>.json` (two-level
//! hash-prefix layout); branch refs and the trunk map persist as JSON
//! under the `.granary/` subdirectory. Writes go through a temp file,
//! fsync, and rename: a returned commit hash implies fsynced content.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
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

/// Name of the metadata subdirectory; its presence is the persistence
/// probe for a store root.
pub const STORE_DIR: &str = ".granary";

#[derive(Debug, Default)]
struct Refs {
    branches: HashMap<String, CommitHash>,
    trunk: HashMap<String, CommitHash>,
}

/// Durable content-addressed backend rooted at a directory.
pub struct DiskBackend {
    root: PathBuf,
    refs: Arc<RwLock<Refs>>,
    closed: AtomicBool,
}

impl DiskBackend {
    /// Open (or initialize) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join(STORE_DIR))?;

        let branches = load_ref_map(&root.join(STORE_DIR).join("refs.json"))?;
        let trunk = load_ref_map(&root.join(STORE_DIR).join("trunk.json"))?;

        Ok(Self {
            root,
            refs: Arc::new(RwLock::new(Refs { branches, trunk })),
            closed: AtomicBool::new(false),
        })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable {
                backend: "disk".to_string(),
                reason: "backend closed".to_string(),
            });
        }
        Ok(())
    }

    fn object_path(&self, hash: &CommitHash) -> PathBuf {
        self.root.join("objects").join(object_relative_path(hash))
    }

    fn load_commit(&self, hash: &CommitHash) -> Result<Commit, StorageError> {
        let path = self.object_path(hash);
        let bytes = std::fs::read(&path)
            .map_err(|_| StorageError::CommitNotFound(hash.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write bytes atomically: temp file in the target directory, fsync,
    /// rename.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidDocument("object path has no parent".into()))?;
        std::fs::create_dir_all(dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path)
            .map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    fn persist_refs(&self, refs: &Refs) -> Result<(), StorageError> {
        let branches: BTreeMap<&String, String> = refs
            .branches
            .iter()
            .map(|(branch, hash)| (branch, hash.as_str().to_string()))
            .collect();
        let trunk: BTreeMap<&String, String> = refs
            .trunk
            .iter()
            .map(|(id, hash)| (id, hash.as_str().to_string()))
            .collect();
        self.write_atomic(
            &self.root.join(STORE_DIR).join("refs.json"),
            &serde_json::to_vec_pretty(&branches)?,
        )?;
        self.write_atomic(
            &self.root.join(STORE_DIR).join("trunk.json"),
            &serde_json::to_vec_pretty(&trunk)?,
        )?;
        Ok(())
    }
}

fn load_ref_map(path: &Path) -> Result<HashMap<String, CommitHash>, StorageError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path)?;
    let raw: HashMap<String, String> = serde_json::from_slice(&bytes)?;
    Ok(raw
        .into_iter()
        .map(|(key, hex)| (key, CommitHash::from_hex(hex)))
        .collect())
}

#[async_trait]
impl StorageBackend for DiskBackend {
    fn name(&self) -> &str {
        "disk"
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

        let mut refs = self.refs.write().await;
        let id_branch = crate::models::branch_for_document(&document.id);
        let parent = pick_version(refs.branches.get(&id_branch), refs.trunk.get(&document.id));
        let commit = Commit::create(document.clone(), parent)?;
        let hash = commit.hash.clone();
        let branch = commit.branch.clone();

        // Object first, refs second: a crash in between leaves an orphan
        // object but never a dangling ref.
        self.write_atomic(&self.object_path(&hash), &serde_json::to_vec(&commit)?)?;
        refs.branches.insert(branch, hash.clone());
        self.persist_refs(&refs)?;

        debug!("committed {} on disk", hash.short());
        Ok(hash)
    }

    async fn get_document(&self, id: &str) -> Result<Document, StorageError> {
        self.check_open()?;
        let refs = self.refs.read().await;
        let branch = crate::models::branch_for_document(id);
        let hash = pick_version(refs.branches.get(&branch), refs.trunk.get(id))
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(self.load_commit(&hash)?.document)
    }

    async fn resolve_commit(&self, hash: &CommitHash) -> Result<Document, StorageError> {
        self.check_open()?;
        Ok(self.load_commit(hash)?.document)
    }

    async fn list_documents(
        &self,
        filter: &BTreeMap<String, String>,
    ) -> Result<Vec<DocumentSummary>, StorageError> {
        self.check_open()?;
        let refs = self.refs.read().await;

        let mut ids: Vec<String> = refs
            .branches
            .keys()
            .filter_map(|branch| branch.strip_prefix("ingest/"))
            .map(str::to_string)
            .chain(refs.trunk.keys().cloned())
            .collect();
        ids.sort();
        ids.dedup();

        let mut summaries = Vec::new();
        for id in ids {
            let branch = crate::models::branch_for_document(&id);
            let Some(hash) = pick_version(refs.branches.get(&branch), refs.trunk.get(&id)) else {
                continue;
            };
            let commit = self.load_commit(&hash)?;
            if matches_filter(&commit.document, filter) {
                summaries.push(commit.document.summary());
            }
        }
        Ok(summaries)
    }

    async fn merge_branch(&self, branch: &str) -> Result<(), StorageError> {
        self.check_open()?;
        let mut refs = self.refs.write().await;
        let tip = refs
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| StorageError::BranchNotFound(branch.to_string()))?;
        let doc_id = self.load_commit(&tip)?.document.id;

        match refs.trunk.get(&doc_id).cloned() {
            None => {
                refs.trunk.insert(doc_id, tip);
                self.persist_refs(&refs)?;
                Ok(())
            }
            Some(current) if current == tip => Ok(()),
            Some(current) => {
                let parent_of = |hash: &CommitHash| -> Option<CommitHash> {
                    self.load_commit(hash).ok().and_then(|commit| commit.parent)
                };
                if is_fast_forward(&current, &tip, parent_of) {
                    refs.trunk.insert(doc_id, tip);
                    self.persist_refs(&refs)?;
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
        self.check_open()?;
        if self.root.join(STORE_DIR).is_dir() {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                backend: "disk".to_string(),
                reason: format!("{} missing under {}", STORE_DIR, self.root.display()),
            })
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

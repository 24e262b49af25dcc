//! Hybrid primary/fallback storage with background cross-backend sync.
//!
//! Wraps an ordered list of backends behind the common contract: writes go
//! to the primary with a per-attempt timeout, fall back down the list on
//! failure, and optionally enqueue best-effort replication jobs consumed
//! by an explicit sync task on a bounded channel.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{MetricsSink, OperationSample, Outcome};
use crate::models::{CommitHash, Document, DocumentSummary};

use super::{write_branch, BranchOwners, StorageBackend, StorageError};

/// Which backend receives writes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryBackend {
    #[default]
    Fast,
    Durable,
}

/// Hybrid store configuration.
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Which backend is tried first.
    pub primary_backend: PrimaryBackend,
    /// Retry the next backend when the primary fails.
    pub enable_fallback: bool,
    /// Per-attempt ceiling for a single backend call.
    pub operation_timeout: Duration,
    /// Replicate successful primary writes to the other backends.
    pub enable_sync: bool,
    /// Minimum delay between sync sweeps.
    pub sync_interval: Duration,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            primary_backend: PrimaryBackend::Fast,
            enable_fallback: true,
            operation_timeout: Duration::from_secs(30),
            enable_sync: true,
            sync_interval: Duration::from_secs(30),
        }
    }
}

/// Capacity of the sync job channel; jobs beyond it are dropped with a log
/// line (sync is best-effort).
const SYNC_QUEUE_CAPACITY: usize = 256;

/// Deadline for draining outstanding sync jobs at close.
const SYNC_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Composite store routing operations across ordered backends.
pub struct HybridStore {
    backends: Vec<Arc<dyn StorageBackend>>,
    config: HybridConfig,
    metrics: MetricsSink,
    owners: Arc<RwLock<BranchOwners>>,
    sync_tx: Option<mpsc::Sender<String>>,
    sync_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl HybridStore {
    /// Compose a fast and a durable backend, ordered per the config.
    pub fn new(
        fast: Arc<dyn StorageBackend>,
        durable: Arc<dyn StorageBackend>,
        config: HybridConfig,
        metrics: MetricsSink,
    ) -> Self {
        let backends = match config.primary_backend {
            PrimaryBackend::Fast => vec![fast, durable],
            PrimaryBackend::Durable => vec![durable, fast],
        };
        Self::from_backends(backends, config, metrics)
    }

    /// Compose an explicit backend ordering; the first entry is primary.
    pub fn from_backends(
        backends: Vec<Arc<dyn StorageBackend>>,
        config: HybridConfig,
        metrics: MetricsSink,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (sync_tx, sync_task) = if config.enable_sync && backends.len() > 1 {
            let (tx, rx) = mpsc::channel(SYNC_QUEUE_CAPACITY);
            let task = tokio::spawn(sync_worker(
                backends.clone(),
                metrics.clone(),
                rx,
                config.sync_interval,
                cancel.child_token(),
            ));
            (Some(tx), Some(task))
        } else {
            (None, None)
        };

        Self {
            backends,
            config,
            metrics,
            owners: Arc::new(RwLock::new(BranchOwners::new())),
            sync_tx,
            sync_task: std::sync::Mutex::new(sync_task),
            cancel,
        }
    }

    /// Metrics sink shared with this store.
    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    fn attempt_limit(&self) -> usize {
        if self.config.enable_fallback {
            self.backends.len()
        } else {
            1
        }
    }

    async fn with_timeout<T>(
        &self,
        future: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.config.operation_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.config.operation_timeout)),
        }
    }

    fn enqueue_sync(&self, document_id: &str) {
        if let Some(tx) = &self.sync_tx {
            if let Err(e) = tx.try_send(document_id.to_string()) {
                warn!("sync queue full, dropping replication job: {}", e);
            }
        }
    }
}

#[async_trait]
impl StorageBackend for HybridStore {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn store_document(
        &self,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<CommitHash, StorageError> {
        let start = Instant::now();
        let bytes = document
            .content
            .raw_bytes
            .as_ref()
            .map(|raw| raw.len() as u64);
        let mut errors: Vec<String> = Vec::new();

        for (index, backend) in self.backends.iter().take(self.attempt_limit()).enumerate() {
            if cancel.is_cancelled() || self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            match self.with_timeout(backend.store_document(document, cancel)).await {
                Ok(hash) => {
                    self.metrics.record(OperationSample {
                        operation: "store_document",
                        backend: Some(backend.name().to_string()),
                        duration: start.elapsed(),
                        outcome: Outcome::Success,
                        bytes,
                    });
                    if index == 0 {
                        self.metrics.record_primary_success();
                    } else {
                        self.metrics.record_fallback_success();
                        debug!(
                            "store_document served by fallback backend {}",
                            backend.name()
                        );
                    }
                    let branch = write_branch(document, &hash);
                    self.owners.write().await.insert(branch, index);
                    self.enqueue_sync(&document.id);
                    return Ok(hash);
                }
                Err(StorageError::Cancelled) => return Err(StorageError::Cancelled),
                Err(e) => {
                    if index == 0 {
                        self.metrics.record_primary_error();
                    } else {
                        self.metrics.record_fallback_error();
                    }
                    warn!("backend {} store failed: {}", backend.name(), e);
                    errors.push(format!("{}: {}", backend.name(), e));
                }
            }
        }

        self.metrics.record(OperationSample {
            operation: "store_document",
            backend: None,
            duration: start.elapsed(),
            outcome: Outcome::Failure,
            bytes,
        });
        Err(StorageError::AllBackendsFailed(errors.join("; ")))
    }

    async fn get_document(&self, id: &str) -> Result<Document, StorageError> {
        let start = Instant::now();
        let mut last_error: Option<StorageError> = None;

        for backend in self.backends.iter().take(self.attempt_limit()) {
            match self.with_timeout(backend.get_document(id)).await {
                Ok(document) => {
                    self.metrics.record(OperationSample {
                        operation: "get_document",
                        backend: Some(backend.name().to_string()),
                        duration: start.elapsed(),
                        outcome: Outcome::Success,
                        bytes: None,
                    });
                    return Ok(document);
                }
                Err(e) => last_error = Some(e),
            }
        }

        self.metrics.record(OperationSample {
            operation: "get_document",
            backend: None,
            duration: start.elapsed(),
            outcome: Outcome::Failure,
            bytes: None,
        });
        Err(last_error.unwrap_or_else(|| StorageError::NotFound(id.to_string())))
    }

    async fn resolve_commit(&self, hash: &CommitHash) -> Result<Document, StorageError> {
        let mut last_error: Option<StorageError> = None;
        for backend in self.backends.iter().take(self.attempt_limit()) {
            match self.with_timeout(backend.resolve_commit(hash)).await {
                Ok(document) => return Ok(document),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| StorageError::CommitNotFound(hash.to_string())))
    }

    async fn list_documents(
        &self,
        filter: &BTreeMap<String, String>,
    ) -> Result<Vec<DocumentSummary>, StorageError> {
        // Primary is authoritative; fallback results are served only when
        // the primary fails outright. No union, no deduplication.
        let mut last_error: Option<StorageError> = None;
        for backend in self.backends.iter().take(self.attempt_limit()) {
            match self.with_timeout(backend.list_documents(filter)).await {
                Ok(summaries) => return Ok(summaries),
                Err(e) => {
                    warn!("backend {} list failed: {}", backend.name(), e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(StorageError::AllBackendsFailed("no backends".into())))
    }

    async fn merge_branch(&self, branch: &str) -> Result<(), StorageError> {
        let start = Instant::now();
        let owner = { self.owners.read().await.get(branch).copied() };

        let result = match owner {
            Some(index) => {
                let backend = &self.backends[index];
                self.with_timeout(backend.merge_branch(branch)).await
            }
            None => {
                // Ownership unknown (e.g. process restart): probe backends
                // in order until one recognizes the branch.
                let mut result = Err(StorageError::BranchNotFound(branch.to_string()));
                for (index, backend) in self.backends.iter().enumerate() {
                    match self.with_timeout(backend.merge_branch(branch)).await {
                        Err(StorageError::BranchNotFound(_)) => continue,
                        other => {
                            if other.is_ok() {
                                self.owners.write().await.insert(branch.to_string(), index);
                            }
                            result = other;
                            break;
                        }
                    }
                }
                result
            }
        };

        self.metrics.record(OperationSample {
            operation: "merge_branch",
            backend: None,
            duration: start.elapsed(),
            outcome: if result.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            bytes: None,
        });
        result
    }

    async fn health(&self) -> Result<(), StorageError> {
        let mut reasons = Vec::new();
        for backend in &self.backends {
            match backend.health().await {
                Ok(()) => return Ok(()),
                Err(e) => reasons.push(format!("{}: {}", backend.name(), e)),
            }
        }
        Err(StorageError::Unavailable {
            backend: "hybrid".to_string(),
            reason: reasons.join("; "),
        })
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.cancel.cancel();

        let task = self.sync_task.lock().expect("sync task lock").take();
        if let Some(task) = task {
            if tokio::time::timeout(SYNC_DRAIN_DEADLINE, task).await.is_err() {
                warn!("sync worker did not drain within {:?}", SYNC_DRAIN_DEADLINE);
            }
        }

        for backend in &self.backends {
            if let Err(e) = backend.close().await {
                warn!("backend {} close failed: {}", backend.name(), e);
            }
        }
        info!("hybrid store closed");
        Ok(())
    }
}

/// Background replication task: collects document ids from the channel and
/// sweeps them across backends at most once per interval. Failures are
/// logged and recorded, never fatal.
async fn sync_worker(
    backends: Vec<Arc<dyn StorageBackend>>,
    metrics: MetricsSink,
    mut rx: mpsc::Receiver<String>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut pending: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Final drain: pick up anything still queued, then sweep.
                while let Ok(id) = rx.try_recv() {
                    pending.insert(id);
                }
                sweep(&backends, &metrics, &mut pending).await;
                break;
            }
            job = rx.recv() => match job {
                Some(id) => {
                    pending.insert(id);
                }
                None => {
                    sweep(&backends, &metrics, &mut pending).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    sweep(&backends, &metrics, &mut pending).await;
                }
            }
        }
    }
    debug!("sync worker stopped");
}

/// Copy each pending document to every backend that lacks it.
async fn sweep(
    backends: &[Arc<dyn StorageBackend>],
    metrics: &MetricsSink,
    pending: &mut HashSet<String>,
) {
    let cancel = CancellationToken::new();
    for id in pending.drain() {
        // First backend holding the document is the sync source.
        let mut source: Option<Document> = None;
        for backend in backends {
            if let Ok(document) = backend.get_document(&id).await {
                source = Some(document);
                break;
            }
        }
        let Some(document) = source else {
            debug!("sync: document {} vanished before replication", id);
            continue;
        };

        for backend in backends {
            match backend.get_document(&id).await {
                Ok(_) => continue,
                Err(StorageError::NotFound(_)) => {
                    match backend.store_document(&document, &cancel).await {
                        Ok(_) => {
                            metrics.record_sync(true);
                            debug!("synced {} to {}", id, backend.name());
                        }
                        Err(e) => {
                            metrics.record_sync(false);
                            warn!("sync of {} to {} failed: {}", id, backend.name(), e);
                        }
                    }
                }
                Err(e) => {
                    metrics.record_sync(false);
                    warn!("sync probe of {} on {} failed: {}", id, backend.name(), e);
                }
            }
        }
    }
}

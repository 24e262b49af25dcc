//! Side-effecting activity units executed under workflow supervision.
//!
//! Activities are the workflow's only interaction surface with the outside
//! world. Each one translates low-level errors into the shared taxonomy
//! before returning, so the retry policy can distinguish terminal failures
//! from retryable ones. All capabilities (store, metrics, compliance gate,
//! HTTP client) are held explicitly here; there are no process-wide
//! singletons.

mod collect;
mod dedup;
mod fetch;

pub use collect::{CollectSource, ACADEMIC_SOURCES, RESEARCH_USER_AGENT};
pub use dedup::DuplicateChecker;
pub use fetch::{FetchedDocument, ACCEPT_HEADER, MAX_RESPONSE_BYTES, USER_AGENT};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::compliance::ComplianceGate;
use crate::embedding::{EmbedError, Embedder};
use crate::extract::{ExtractError, Extraction, Extractor, Format};
use crate::metrics::{MetricsSink, OperationSample, Outcome};
use crate::models::{stable_document_id, CommitHash, Document};
use crate::storage::{HybridStore, StorageBackend, StorageError};

/// Activity failure taxonomy. Kinds, not wrapped causes: every low-level
/// error is translated into one of these before leaving an activity.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// Bad URL, unsupported scheme, empty required field. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network failure or non-2xx response. Retryable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Corrupt payload, missing magic bytes, OCR unavailable. Never
    /// retried; named in the workflow retry policy's terminal list.
    #[error("extraction failed permanently: {0}")]
    ExtractionPermanent(String),

    /// Backend timeout or temporarily unhealthy backend. Retryable; the
    /// hybrid layer may already have absorbed part of it by fallback.
    #[error("storage temporarily unavailable: {0}")]
    StorageTransient(String),

    /// Every backend failed after fallback. One more attempt is allowed
    /// at the activity level, then terminal.
    #[error("storage exhausted: {0}")]
    StorageExhausted(String),

    /// Concurrent writer won the merge. Terminal, surfaced to operators.
    #[error("merge conflict: {0}")]
    MergeConflict(String),

    /// Cancellation context fired. Terminal; workflows mark themselves
    /// cancelled rather than failed.
    #[error("activity cancelled")]
    Cancelled,
}

impl ActivityError {
    /// Whether the retry policy may re-run the activity.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_) | Self::StorageTransient(_) | Self::StorageExhausted(_)
        )
    }

    /// Some kinds cap attempts below the policy maximum.
    pub fn attempt_cap(&self) -> Option<u32> {
        match self {
            Self::StorageExhausted(_) => Some(2),
            _ => None,
        }
    }
}

impl From<ExtractError> for ActivityError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Permanent(reason) => Self::ExtractionPermanent(reason),
            ExtractError::Transient(cause) => Self::StorageTransient(format!("extraction: {cause}")),
        }
    }
}

impl From<EmbedError> for ActivityError {
    fn from(err: EmbedError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<StorageError> for ActivityError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => Self::Cancelled,
            StorageError::MergeConflict { branch } => Self::MergeConflict(branch),
            StorageError::AllBackendsFailed(reason) => Self::StorageExhausted(reason),
            StorageError::InvalidDocument(reason) => Self::InvalidInput(reason),
            StorageError::NotFound(id) => Self::InvalidInput(format!("document not found: {id}")),
            StorageError::CommitNotFound(hash) => {
                Self::InvalidInput(format!("commit not found: {hash}"))
            }
            StorageError::BranchNotFound(branch) => {
                Self::InvalidInput(format!("branch not found: {branch}"))
            }
            other => Self::StorageTransient(other.to_string()),
        }
    }
}

/// Post-storage indexing hook. The default runtime attaches none, making
/// the index activity a documented no-op.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, hash: &CommitHash, document: &Document) -> anyhow::Result<()>;
}

/// Input to the store activity: everything the pipeline has derived for
/// one document.
#[derive(Debug, Clone)]
pub struct StoreDocumentInput {
    pub url: String,
    pub source_type: String,
    pub raw_bytes: Option<Vec<u8>>,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub embeddings: Vec<f32>,
}

/// The workflow's capability set: every side-effecting unit it may invoke.
pub struct Activities {
    store: Arc<HybridStore>,
    extractor: Extractor,
    embedder: Embedder,
    gate: ComplianceGate,
    metrics: MetricsSink,
    http: reqwest::Client,
    dedup: DuplicateChecker,
    indexer: Option<Arc<dyn Indexer>>,
}

impl Activities {
    /// Assemble the capability set around a hybrid store.
    pub fn new(store: Arc<HybridStore>, dedup: DuplicateChecker) -> Self {
        let metrics = store.metrics().clone();
        Self {
            store,
            extractor: Extractor::new(),
            embedder: Embedder::new(),
            gate: ComplianceGate::new(USER_AGENT, "granary"),
            metrics,
            http: fetch::build_client(),
            dedup,
            indexer: None,
        }
    }

    /// Replace the default extractor.
    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Replace the default embedder.
    pub fn with_embedder(mut self, embedder: Embedder) -> Self {
        self.embedder = embedder;
        self
    }

    /// Attach a concrete indexer to the index activity.
    pub fn with_indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    /// The hybrid store behind this activity set.
    pub fn store(&self) -> &Arc<HybridStore> {
        &self.store
    }

    /// Compliance gate used by collectors.
    pub fn gate(&self) -> &ComplianceGate {
        &self.gate
    }

    /// Shared metrics sink.
    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    /// Fetch a document over HTTP. See [`fetch`] for limits and headers.
    pub async fn fetch_document(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedDocument, ActivityError> {
        let start = Instant::now();
        let result = fetch::fetch_document(&self.http, url, cancel).await;
        self.metrics.record(OperationSample {
            operation: "fetch_document",
            backend: None,
            duration: start.elapsed(),
            outcome: if result.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            bytes: result.as_ref().ok().map(|r| r.content.len() as u64),
        });
        result
    }

    /// Extract text from raw content. The declared type governs dispatch;
    /// permanent failures are terminal for the caller's retry policy.
    pub fn extract_text(
        &self,
        content: &[u8],
        declared_type: &str,
    ) -> Result<Extraction, ActivityError> {
        let start = Instant::now();
        let result = self
            .extractor
            .extract(content, Format::from_tag(declared_type));
        self.metrics.record(OperationSample {
            operation: "extract_text",
            backend: None,
            duration: start.elapsed(),
            outcome: if result.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            bytes: Some(content.len() as u64),
        });
        Ok(result?)
    }

    /// Generate the deterministic embedding for extracted text.
    pub fn generate_embeddings(&self, text: &str) -> Result<Vec<f32>, ActivityError> {
        Ok(self.embedder.embed(text)?)
    }

    /// Store a fully derived document; returns the commit on its ingest
    /// branch.
    pub async fn store_document(
        &self,
        input: StoreDocumentInput,
        cancel: &CancellationToken,
    ) -> Result<CommitHash, ActivityError> {
        if input.url.is_empty() {
            return Err(ActivityError::InvalidInput("empty document URL".into()));
        }

        let id = input
            .metadata
            .get("document_id")
            .cloned()
            .unwrap_or_else(|| stable_document_id(&input.url));

        let mut document = Document::new(id, input.source_type, input.url.clone());
        document.content.raw_bytes = input.raw_bytes;
        document.content.text = input.text;
        document.content.metadata = input.metadata;
        document.content.embeddings = input.embeddings;
        // Source provenance keys are written once and never altered.
        let source_tag = document.source.source_type.clone();
        document
            .content
            .metadata
            .entry("source".to_string())
            .or_insert(source_tag);
        document
            .content
            .metadata
            .entry("url".to_string())
            .or_insert(input.url);

        let hash = self.store.store_document(&document, cancel).await?;
        info!(document_id = %document.id, commit = %hash.short(), "document stored");
        Ok(hash)
    }

    /// Post-storage indexing hook. Idempotent; a no-op unless an indexer
    /// is attached.
    pub async fn index_document(
        &self,
        hash: &CommitHash,
        cancel: &CancellationToken,
    ) -> Result<(), ActivityError> {
        if cancel.is_cancelled() {
            return Err(ActivityError::Cancelled);
        }
        let Some(indexer) = &self.indexer else {
            debug!(commit = %hash.short(), "no indexer attached, skipping");
            return Ok(());
        };
        let document = self.store.resolve_commit(hash).await?;
        indexer
            .index(hash, &document)
            .await
            .map_err(|e| ActivityError::StorageTransient(format!("indexer: {e}")))
    }

    /// Merge an ingest branch into trunk. Idempotent; conflicts surface.
    pub async fn merge_branch(&self, branch: &str) -> Result<(), ActivityError> {
        Ok(self.store.merge_branch(branch).await?)
    }

    /// Consult the persistent seen-set.
    pub async fn check_duplicate(&self, document_id: &str) -> Result<bool, ActivityError> {
        self.dedup
            .check(document_id)
            .await
            .map_err(|e| ActivityError::StorageTransient(format!("seen-set: {e}")))
    }

    /// Record a document id as processed.
    pub async fn mark_processed(&self, document_id: &str) -> Result<(), ActivityError> {
        self.dedup
            .mark(document_id)
            .await
            .map(|_| ())
            .map_err(|e| ActivityError::StorageTransient(format!("seen-set: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(!ActivityError::InvalidInput("x".into()).is_retryable());
        assert!(!ActivityError::ExtractionPermanent("x".into()).is_retryable());
        assert!(!ActivityError::MergeConflict("x".into()).is_retryable());
        assert!(!ActivityError::Cancelled.is_retryable());
        assert!(ActivityError::UpstreamUnavailable("x".into()).is_retryable());
        assert!(ActivityError::StorageTransient("x".into()).is_retryable());
        assert!(ActivityError::StorageExhausted("x".into()).is_retryable());
    }

    #[test]
    fn test_storage_exhausted_attempt_cap() {
        assert_eq!(
            ActivityError::StorageExhausted("x".into()).attempt_cap(),
            Some(2)
        );
        assert_eq!(ActivityError::UpstreamUnavailable("x".into()).attempt_cap(), None);
    }

    #[test]
    fn test_extract_error_mapping() {
        let permanent: ActivityError = ExtractError::Permanent("bad".into()).into();
        assert!(matches!(permanent, ActivityError::ExtractionPermanent(_)));

        let transient: ActivityError = ExtractError::Transient(anyhow::anyhow!("io")).into();
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_storage_error_mapping() {
        let conflict: ActivityError = StorageError::MergeConflict {
            branch: "ingest/x".into(),
        }
        .into();
        assert!(matches!(conflict, ActivityError::MergeConflict(_)));

        let exhausted: ActivityError = StorageError::AllBackendsFailed("dead".into()).into();
        assert!(matches!(exhausted, ActivityError::StorageExhausted(_)));

        let cancelled: ActivityError = StorageError::Cancelled.into();
        assert!(matches!(cancelled, ActivityError::Cancelled));
    }
}

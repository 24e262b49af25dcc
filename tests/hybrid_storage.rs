//! Cross-backend storage properties exercised through the hybrid layer.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use granary::metrics::MetricsSink;
use granary::models::{CommitHash, Document, DocumentSummary};
use granary::storage::{
    DiskBackend, HybridConfig, HybridStore, MemoryBackend, StorageBackend, StorageError,
};
use tokio_util::sync::CancellationToken;

/// Write-failing backend used to force the fallback path.
struct BrokenWrites;

#[async_trait]
impl StorageBackend for BrokenWrites {
    fn name(&self) -> &str {
        "broken"
    }

    async fn store_document(
        &self,
        _document: &Document,
        _cancel: &CancellationToken,
    ) -> Result<CommitHash, StorageError> {
        Err(StorageError::Unavailable {
            backend: "broken".to_string(),
            reason: "injected write failure".to_string(),
        })
    }

    async fn get_document(&self, id: &str) -> Result<Document, StorageError> {
        Err(StorageError::NotFound(id.to_string()))
    }

    async fn resolve_commit(&self, hash: &CommitHash) -> Result<Document, StorageError> {
        Err(StorageError::CommitNotFound(hash.to_string()))
    }

    async fn list_documents(
        &self,
        _filter: &BTreeMap<String, String>,
    ) -> Result<Vec<DocumentSummary>, StorageError> {
        Err(StorageError::Unavailable {
            backend: "broken".to_string(),
            reason: "injected list failure".to_string(),
        })
    }

    async fn merge_branch(&self, branch: &str) -> Result<(), StorageError> {
        Err(StorageError::BranchNotFound(branch.to_string()))
    }

    async fn health(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn fixture_document(id: &str) -> Document {
    let mut document = Document::new(id, "pdf", format!("https://example.com/{id}.pdf"));
    document.content.raw_bytes = Some(vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xFF]);
    document.content.text = format!("extracted text for {id}");
    document
        .content
        .metadata
        .insert("document_id".to_string(), id.to_string());
    document
        .content
        .metadata
        .insert("quality_tier".to_string(), "gold".to_string());
    document.content.embeddings = vec![0.05; granary::models::EMBEDDING_DIM];
    document
}

#[tokio::test]
async fn round_trip_is_byte_identical_across_backends() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let cancel = CancellationToken::new();

    let document = fixture_document("rt");
    let hash = store.store_document(&document, &cancel).await.unwrap();

    // P2: every field round-trips.
    let fetched = store.get_document("rt").await.unwrap();
    assert_eq!(fetched, document);

    // P3: the returned commit hash resolves to the same document.
    let resolved = store.resolve_commit(&hash).await.unwrap();
    assert_eq!(resolved, document);
}

#[tokio::test]
async fn fallback_serves_writes_and_reads_when_primary_is_broken() {
    let dir = tempfile::tempdir().unwrap();
    let durable: Arc<dyn StorageBackend> =
        Arc::new(DiskBackend::open(dir.path().join("store")).unwrap());
    let store = HybridStore::from_backends(
        vec![Arc::new(BrokenWrites), durable],
        HybridConfig {
            enable_sync: false,
            ..Default::default()
        },
        MetricsSink::new(),
    );
    let cancel = CancellationToken::new();

    let document = fixture_document("fb");
    let hash = store.store_document(&document, &cancel).await.unwrap();
    assert!(!hash.as_str().is_empty());

    // Reads fall through the broken primary to the healthy secondary.
    assert_eq!(store.get_document("fb").await.unwrap(), document);
    assert_eq!(store.resolve_commit(&hash).await.unwrap(), document);
    let listed = store.list_documents(&BTreeMap::new()).await.unwrap();
    assert_eq!(listed.len(), 1);

    // P4: the primary failure is recorded exactly once.
    let counters = store.metrics().summary().backends;
    assert_eq!(counters.primary_errors, 1);
    assert_eq!(counters.fallback_success, 1);
}

#[tokio::test]
async fn fallback_disabled_fails_closed() {
    let durable: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let store = HybridStore::from_backends(
        vec![Arc::new(BrokenWrites), durable],
        HybridConfig {
            enable_fallback: false,
            enable_sync: false,
            ..Default::default()
        },
        MetricsSink::new(),
    );
    let cancel = CancellationToken::new();
    let err = store
        .store_document(&fixture_document("nf"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::AllBackendsFailed(_)));
}

#[tokio::test]
async fn merge_is_idempotent_through_the_hybrid_layer() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path());
    let cancel = CancellationToken::new();

    let document = fixture_document("mg");
    store.store_document(&document, &cancel).await.unwrap();

    let branch = document.branch_name();
    // P6: merging twice in succession is a no-op, not an error.
    store.merge_branch(&branch).await.unwrap();
    store.merge_branch(&branch).await.unwrap();
}

#[tokio::test]
async fn durable_writes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let document = fixture_document("dur");
    let hash = {
        let durable: Arc<dyn StorageBackend> =
            Arc::new(DiskBackend::open(dir.path().join("store")).unwrap());
        let store = HybridStore::from_backends(
            vec![durable],
            HybridConfig {
                enable_sync: false,
                ..Default::default()
            },
            MetricsSink::new(),
        );
        let cancel = CancellationToken::new();
        let hash = store.store_document(&document, &cancel).await.unwrap();
        store.merge_branch(&document.branch_name()).await.unwrap();
        store.close().await.unwrap();
        hash
    };

    // Branch refs persist under the store's metadata subdirectory.
    assert!(dir.path().join("store").join(".granary").is_dir());

    let reopened = DiskBackend::open(dir.path().join("store")).unwrap();
    assert_eq!(reopened.get_document("dur").await.unwrap(), document);
    assert_eq!(reopened.resolve_commit(&hash).await.unwrap(), document);
}

#[tokio::test]
async fn background_sync_converges_backends() {
    let fast: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let durable: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let store = HybridStore::from_backends(
        vec![fast, durable.clone()],
        HybridConfig {
            enable_sync: true,
            sync_interval: std::time::Duration::from_millis(20),
            ..Default::default()
        },
        MetricsSink::new(),
    );
    let cancel = CancellationToken::new();
    store
        .store_document(&fixture_document("sync"), &cancel)
        .await
        .unwrap();

    let mut replicated = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if durable.get_document("sync").await.is_ok() {
            replicated = true;
            break;
        }
    }
    assert!(replicated, "secondary never received the synced document");
}

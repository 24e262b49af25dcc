//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use granary::activities::{Activities, DuplicateChecker};
use granary::extract::{Extractor, ExtractorConfig};
use granary::metrics::MetricsSink;
use granary::storage::{
    DiskBackend, HybridConfig, HybridStore, MemoryBackend, StorageBackend,
};
use granary::workflow::{RetryPolicy, WorkflowRuntime, WorkflowRuntimeConfig};

/// Retry policy with short backoff so transient-failure scenarios run in
/// milliseconds.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        maximum_attempts: 3,
        initial_interval: Duration::from_millis(20),
        backoff_coefficient: 2.0,
        maximum_interval: Duration::from_millis(100),
        activity_timeout: Duration::from_secs(30),
    }
}

/// Hybrid store over a fresh memory primary and disk secondary. Sync is
/// disabled so backend counters stay deterministic.
pub fn test_store(data_dir: &Path) -> Arc<HybridStore> {
    let fast: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let durable: Arc<dyn StorageBackend> =
        Arc::new(DiskBackend::open(data_dir.join("store")).expect("open disk backend"));
    Arc::new(HybridStore::from_backends(
        vec![fast, durable],
        HybridConfig {
            enable_sync: false,
            ..Default::default()
        },
        MetricsSink::new(),
    ))
}

/// Workflow runtime wired to a test store, with journals under the data
/// dir, OCR disabled, and the fast retry policy.
pub fn test_runtime(data_dir: &Path, store: Arc<HybridStore>) -> Arc<WorkflowRuntime> {
    let dedup = DuplicateChecker::open(data_dir.join("seen.jsonl")).expect("open seen-set");
    let activities = Arc::new(
        Activities::new(store, dedup).with_extractor(Extractor::with_config(ExtractorConfig {
            ocr_enabled: false,
            ..Default::default()
        })),
    );
    Arc::new(WorkflowRuntime::new(
        activities,
        WorkflowRuntimeConfig {
            data_dir: Some(data_dir.join("workflows")),
            retry: fast_retry(),
            ..Default::default()
        },
    ))
}

//! Batch ingestion workflow.
//!
//! Runs every input as a child ingestion workflow with bounded
//! concurrency, collects per-child errors, and reports an aggregated
//! failure iff any child failed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::models::stable_document_id;

use super::{DocumentInput, IngestionOutcome, WorkflowError, WorkflowRuntime};

/// Result of a batch run with no failed children.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<IngestionOutcome>,
}

/// Run the batch workflow.
pub(super) async fn run(
    runtime: &WorkflowRuntime,
    inputs: Vec<DocumentInput>,
) -> Result<BatchOutcome, WorkflowError> {
    let total = inputs.len();
    let limit = runtime.config().batch_concurrency.max(1);
    let slots = Arc::new(Semaphore::new(limit));

    info!(total, limit, "batch ingestion started");

    let results = futures::future::join_all(inputs.into_iter().enumerate().map(
        |(index, input)| {
            let slots = slots.clone();
            async move {
                let _permit = match slots.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Err(WorkflowError::Cancelled(format!("batch-{index}")))),
                };
                let document_id = input
                    .metadata
                    .get("document_id")
                    .cloned()
                    .unwrap_or_else(|| stable_document_id(&input.url));
                let workflow_id = format!("ingest-{document_id}");
                (index, runtime.run_document_ingestion(&workflow_id, input).await)
            }
        },
    ))
    .await;

    let mut outcome = BatchOutcome::default();
    let mut failures: Vec<String> = Vec::new();
    for (index, result) in results {
        match result {
            Ok(ingested) => outcome.succeeded.push(ingested),
            Err(e) => {
                warn!("batch input {} failed: {}", index, e);
                failures.push(format!("input {index}: {e}"));
            }
        }
    }

    if failures.is_empty() {
        info!(total, "batch ingestion completed cleanly");
        Ok(outcome)
    } else {
        Err(WorkflowError::BatchFailed {
            failed: failures.len(),
            total,
            summary: failures.join("; "),
        })
    }
}

//! Document ingestion workflow.
//!
//! Fetch → validate → (extract ∥ embed) → store → index → merge. All
//! activities run under the shared retry policy; permanent extraction
//! failures and invalid inputs terminate the run without retries. A
//! content-type mismatch between the server and the declared type is
//! logged and processing continues with the declared type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activities::{ActivityError, StoreDocumentInput};
use crate::models::{branch_for_commit, branch_for_document, stable_document_id, CommitHash};

use super::WorkflowContext;

/// Input to one document ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    pub url: String,
    /// Declared format tag; governs extraction even when the server
    /// disagrees.
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DocumentInput {
    pub fn new(url: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source_type: source_type.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// What a completed ingestion produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionOutcome {
    pub document_id: String,
    pub commit_hash: CommitHash,
    pub branch: String,
}

/// Execute the ingestion pipeline for one document.
pub(super) async fn run(
    ctx: &WorkflowContext,
    input: DocumentInput,
) -> Result<IngestionOutcome, ActivityError> {
    let activities = ctx.activities().clone();
    let cancel = ctx.cancel_token().clone();

    // Fetching
    let fetched = ctx
        .execute("fetch", || {
            let url = input.url.clone();
            let activities = activities.clone();
            let cancel = cancel.clone();
            async move { activities.fetch_document(&url, &cancel).await }
        })
        .await?;

    // Validating: the declared type governs extraction; a disagreeing
    // server content type (or payload sniff) is logged, never fatal.
    let sniffed = infer::get(&fetched.content).map(|kind| kind.mime_type());
    let declared = input.source_type.to_lowercase();
    if !content_type_agrees(&fetched.content_type, sniffed, &declared) {
        warn!(
            workflow_id = %ctx.id(),
            declared = %declared,
            server = %fetched.content_type,
            sniffed = sniffed.unwrap_or("unknown"),
            "content type mismatch; continuing with declared type"
        );
    }

    let mut metadata = input.metadata.clone();
    metadata
        .entry("document_id".to_string())
        .or_insert_with(|| stable_document_id(&input.url));

    // Extracting ∥ Embedding: both operate on the fetched payload.
    let raw_text = String::from_utf8_lossy(&fetched.content).into_owned();
    let (extraction, embeddings) = tokio::join!(
        ctx.execute("extract", || {
            let content = fetched.content.clone();
            let declared = declared.clone();
            let activities = activities.clone();
            async move { activities.extract_text(&content, &declared) }
        }),
        ctx.execute("embed", || {
            let raw_text = raw_text.clone();
            let activities = activities.clone();
            async move { activities.generate_embeddings(&raw_text) }
        }),
    );
    let extraction = extraction?;
    let embeddings = embeddings?;

    // Extraction metadata fills gaps; caller-supplied keys win.
    for (key, value) in extraction.metadata {
        metadata.entry(key).or_insert(value);
    }

    // Storing
    let store_input = StoreDocumentInput {
        url: input.url.clone(),
        source_type: input.source_type.clone(),
        raw_bytes: Some(fetched.content.clone()),
        text: extraction.text,
        metadata: metadata.clone(),
        embeddings,
    };
    let commit_hash: CommitHash = ctx
        .execute("store", || {
            let store_input = store_input.clone();
            let activities = activities.clone();
            let cancel = cancel.clone();
            async move { activities.store_document(store_input, &cancel).await }
        })
        .await?;

    // Indexing
    ctx.execute("index", || {
        let commit_hash = commit_hash.clone();
        let activities = activities.clone();
        let cancel = cancel.clone();
        async move { activities.index_document(&commit_hash, &cancel).await }
    })
    .await?;

    // Merging: branch from the assigned document id, or from the commit
    // when no id was assigned.
    let (document_id, branch) = match metadata.get("document_id") {
        Some(id) => (id.clone(), branch_for_document(id)),
        None => (commit_hash.short().to_string(), branch_for_commit(&commit_hash)),
    };
    ctx.execute("merge", || {
        let branch = branch.clone();
        let activities = activities.clone();
        async move { activities.merge_branch(&branch).await }
    })
    .await?;

    info!(
        workflow_id = %ctx.id(),
        document_id = %document_id,
        commit = %commit_hash.short(),
        "document ingested and merged"
    );

    Ok(IngestionOutcome {
        document_id,
        commit_hash,
        branch,
    })
}

/// Loose agreement check between declared type, server content type, and
/// payload sniff.
fn content_type_agrees(server: &str, sniffed: Option<&str>, declared: &str) -> bool {
    let server = server.to_lowercase();
    let declared_mime: &[&str] = match declared {
        "html" => &["text/html", "application/xhtml+xml"],
        "pdf" => &["application/pdf"],
        "docx" | "doc" => &[
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "application/msword",
            "application/zip",
        ],
        "png" => &["image/png"],
        "jpg" | "jpeg" => &["image/jpeg"],
        "tiff" => &["image/tiff"],
        "bmp" => &["image/bmp"],
        "gif" => &["image/gif"],
        // Plain text and unknown tags accept anything textual.
        _ => return true,
    };

    declared_mime.iter().any(|mime| server.starts_with(mime))
        || sniffed
            .map(|sniffed| declared_mime.contains(&sniffed))
            .unwrap_or(false)
}

//! Document model for content-addressed corpus storage.
//!
//! Documents are immutable once stored: every write produces a new commit on
//! a branch named for the document, and successful ingestions converge on
//! trunk through an explicit merge step.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Store-wide embedding dimension.
pub const EMBEDDING_DIM: usize = 384;

/// Cryptographic identifier of a committed write.
///
/// Returned by every store operation and consumed by the index and merge
/// steps downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitHash(String);

impl CommitHash {
    /// Compute a commit hash over an optional parent hash and the
    /// canonical document serialization.
    pub fn compute(parent: Option<&CommitHash>, canonical: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.0.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(canonical);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an existing hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, used in generated branch names.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Branch name for a document id: `ingest/<id>`.
pub fn branch_for_document(id: &str) -> String {
    format!("ingest/{id}")
}

/// Branch name when no document id is available: `commit-<shorthash>`.
pub fn branch_for_commit(hash: &CommitHash) -> String {
    format!("commit-{}", hash.short())
}

/// Origin of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSource {
    /// Free-form source tag (e.g. `web`, `pdf`, `commoncrawl_warc`).
    #[serde(rename = "type")]
    pub source_type: String,
    /// Originating locator.
    pub url: String,
}

/// Payload and derived content of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentContent {
    /// Literal upstream payload, when retained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_bytes: Option<Vec<u8>>,
    /// Extracted UTF-8 text. Empty only when extraction legitimately
    /// yielded none.
    pub text: String,
    /// Free-form string metadata. Ordered map so the canonical
    /// serialization (and therefore the commit hash) is deterministic.
    pub metadata: BTreeMap<String, String>,
    /// Embedding vector; empty until generated, otherwise exactly
    /// [`EMBEDDING_DIM`] components.
    pub embeddings: Vec<f32>,
}

/// A document with full provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable opaque identifier, unique within a store.
    pub id: String,
    /// Where the document came from.
    pub source: DocumentSource,
    /// Payload, text, metadata, and embeddings.
    pub content: DocumentContent,
    /// When the document was first created.
    pub created_at: DateTime<Utc>,
    /// When the document was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a new empty document for the given source.
    pub fn new(id: impl Into<String>, source_type: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source: DocumentSource {
                source_type: source_type.into(),
                url: url.into(),
            },
            content: DocumentContent::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Branch this document's writes land on.
    pub fn branch_name(&self) -> String {
        branch_for_document(&self.id)
    }

    /// Canonical serialization used for commit hashing. Metadata is an
    /// ordered map, so identical documents serialize identically.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Check the embedding-length invariant against a configured dimension.
    pub fn validate_embeddings(&self, dim: usize) -> bool {
        self.content.embeddings.is_empty() || self.content.embeddings.len() == dim
    }

    /// Condensed listing form.
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            source_type: self.source.source_type.clone(),
            url: self.source.url.clone(),
            title: self.content.metadata.get("title").cloned(),
            text_length: self.content.text.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Display-ready document data for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub source_type: String,
    pub url: String,
    pub title: Option<String>,
    pub text_length: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight referent produced by collectors before full ingestion.
///
/// Lives only inside workflow memory; promoted to a [`Document`] after
/// fetch and extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedDocument {
    /// Stable id derived from the normalized URL.
    pub id: String,
    /// Where to fetch the document from.
    pub url: String,
    /// Declared format tag.
    #[serde(rename = "type")]
    pub source_type: String,
    /// Collector-supplied metadata, carried into the stored document.
    pub metadata: BTreeMap<String, String>,
}

impl CollectedDocument {
    /// Create a collected document with a stable id hashed from the URL.
    pub fn new(url: impl Into<String>, source_type: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: stable_document_id(&url),
            url,
            source_type: source_type.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Normalize a URL for identity purposes: lowercase scheme and host, drop
/// the fragment, trim a trailing slash from the path.
pub fn normalize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let mut s = parsed.to_string();
            if s.ends_with('/') && parsed.path() == "/" {
                s.pop();
            }
            s
        }
        Err(_) => url.trim().to_string(),
    }
}

/// Stable document id: hex blake3 of the normalized URL.
pub fn stable_document_id(url: &str) -> String {
    blake3::hash(normalize_url(url).as_bytes())
        .to_hex()
        .to_string()
}

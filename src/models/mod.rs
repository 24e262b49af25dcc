//! Data models for Granary.

mod document;

pub use document::{
    branch_for_commit, branch_for_document, normalize_url, stable_document_id, CollectedDocument,
    CommitHash, Document, DocumentContent, DocumentSource, DocumentSummary, EMBEDDING_DIM,
};

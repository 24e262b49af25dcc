//! Granary - document ingestion and content-addressed corpus storage.
//!
//! Fetches documents from the web and APIs, extracts text from heterogeneous
//! formats, computes deterministic embeddings, and persists the provenance
//! chain in a branch-per-document versioned store behind a primary/fallback
//! backend arrangement. Ingestion is orchestrated by a durable workflow
//! runtime that retries transient failures and coordinates parallel
//! activities.

pub mod activities;
pub mod cli;
pub mod compliance;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod workflow;

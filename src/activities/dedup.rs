//! Persistent duplicate suppression.
//!
//! A seen-set of document ids backed by an append-only JSONL journal.
//! Ids are appended on first sighting only, so the journal stays close to
//! the set size; a compaction pass rewrites it when reloads find stale or
//! malformed lines.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct SeenEntry {
    id: String,
    seen_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    seen: HashSet<String>,
    journal: Option<std::fs::File>,
}

/// Seen-set answering "was this document id processed before?".
#[derive(Debug, Clone)]
pub struct DuplicateChecker {
    path: Option<PathBuf>,
    inner: Arc<Mutex<Inner>>,
}

impl DuplicateChecker {
    /// Volatile in-memory checker (tests, one-shot runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Open (or create) a journal-backed checker.
    ///
    /// Malformed lines are dropped and trigger a compacting rewrite.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut seen = HashSet::new();
        let mut stale_lines = 0usize;
        if path.exists() {
            for line in std::fs::read_to_string(&path)?.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SeenEntry>(line) {
                    Ok(entry) => {
                        if !seen.insert(entry.id) {
                            stale_lines += 1;
                        }
                    }
                    Err(_) => stale_lines += 1,
                }
            }
        }

        if stale_lines > 0 {
            debug!(
                "compacting seen-set journal at {} ({} stale lines)",
                path.display(),
                stale_lines
            );
            compact(&path, &seen)?;
        }

        let journal = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path: Some(path),
            inner: Arc::new(Mutex::new(Inner {
                seen,
                journal: Some(journal),
            })),
        })
    }

    /// True if the id was processed before.
    pub async fn check(&self, id: &str) -> std::io::Result<bool> {
        Ok(self.inner.lock().await.seen.contains(id))
    }

    /// Record an id. Returns true if it was new.
    pub async fn mark(&self, id: &str) -> std::io::Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.seen.insert(id.to_string()) {
            return Ok(false);
        }
        if let Some(journal) = inner.journal.as_mut() {
            let entry = SeenEntry {
                id: id.to_string(),
                seen_at: Utc::now(),
            };
            let line = serde_json::to_string(&entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            if let Err(e) = writeln!(journal, "{line}") {
                // The in-memory set still suppresses duplicates this run.
                warn!("seen-set journal append failed: {}", e);
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Number of known ids.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.seen.len()
    }

    /// True when no ids have been recorded.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Journal location, when persistent.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

fn compact(path: &PathBuf, seen: &HashSet<String>) -> std::io::Result<()> {
    let mut ids: Vec<&String> = seen.iter().collect();
    ids.sort();
    let mut out = String::new();
    let now = Utc::now();
    for id in ids {
        let entry = SeenEntry {
            id: id.clone(),
            seen_at: now,
        };
        out.push_str(&serde_json::to_string(&entry).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e)
        })?);
        out.push('\n');
    }
    std::fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let checker = DuplicateChecker::in_memory();
        assert!(!checker.check("a").await.unwrap());
        assert!(checker.mark("a").await.unwrap());
        assert!(checker.check("a").await.unwrap());
        // Second mark is not new.
        assert!(!checker.mark("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.jsonl");
        {
            let checker = DuplicateChecker::open(&path).unwrap();
            checker.mark("doc-1").await.unwrap();
            checker.mark("doc-2").await.unwrap();
        }
        let reopened = DuplicateChecker::open(&path).unwrap();
        assert!(reopened.check("doc-1").await.unwrap());
        assert!(reopened.check("doc-2").await.unwrap());
        assert!(!reopened.check("doc-3").await.unwrap());
        assert_eq!(reopened.len().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_lines_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"good\",\"seen_at\":\"2026-01-01T00:00:00Z\"}\nnot json\n",
        )
        .unwrap();

        let checker = DuplicateChecker::open(&path).unwrap();
        assert!(checker.check("good").await.unwrap());
        assert_eq!(checker.len().await, 1);

        // The rewritten journal parses cleanly line by line.
        let contents = std::fs::read_to_string(&path).unwrap();
        for line in contents.lines() {
            serde_json::from_str::<SeenEntry>(line).unwrap();
        }
    }
}

//! Scheduled ingestion workflow.
//!
//! A cron-driven sweep: choose the collector by source class, suppress
//! duplicates through the persistent seen-set, and start one child
//! ingestion workflow per unique collected document. Child failures are
//! logged and counted, never fatal to the sweep.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activities::CollectSource;
use crate::models::CollectedDocument;

use super::{DocumentInput, WorkflowError, WorkflowRuntime};

/// One configured scheduled source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleInput {
    /// Source name; academic names route to the academic collector.
    pub name: String,
    /// Collector kind (`rss`, `api`, `web`).
    #[serde(rename = "type")]
    pub source_type: String,
    pub url: String,
    /// Cron expression handed to the runtime's scheduling facility.
    pub schedule: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Counters from one sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub collected: usize,
    pub started: usize,
    pub duplicates_skipped: usize,
    pub failed: usize,
}

/// Next fire time for a cron expression.
pub fn next_fire(expression: &str) -> Result<DateTime<Utc>, WorkflowError> {
    let schedule =
        Schedule::from_str(expression).map_err(|e| WorkflowError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
    schedule
        .upcoming(Utc)
        .next()
        .ok_or_else(|| WorkflowError::InvalidSchedule {
            expression: expression.to_string(),
            reason: "schedule yields no upcoming fire time".to_string(),
        })
}

/// Run one collection sweep.
pub(super) async fn run_sweep(
    runtime: &WorkflowRuntime,
    input: ScheduleInput,
) -> Result<SweepOutcome, WorkflowError> {
    let activities = runtime.activities().clone();
    let cancel = runtime.cancel_token().child_token();

    let mut source = CollectSource::new(&input.name, &input.source_type, &input.url);
    source.keywords = input.filters.clone();
    source.metadata = input.metadata.clone();

    // Academic names get the dedicated collector with its stricter rate
    // floors and attribution stamping.
    let collected: Vec<CollectedDocument> = if source.is_academic() {
        activities.collect_academic(&source, &cancel).await
    } else {
        activities.collect_from_source(&source, &cancel).await
    }
    .map_err(|e| WorkflowError::ActivityFailed {
        workflow_id: format!("scheduled-{}", input.name),
        activity: "collect".to_string(),
        source: e,
    })?;

    let mut outcome = SweepOutcome {
        collected: collected.len(),
        ..Default::default()
    };

    // One child per unique id: the persistent seen-set suppresses
    // documents from earlier sweeps, the sweep-local set suppresses
    // repeats inside this one.
    let mut sweep_seen: HashSet<String> = HashSet::new();
    let mut children = Vec::new();

    for document in collected {
        if !sweep_seen.insert(document.id.clone()) {
            outcome.duplicates_skipped += 1;
            continue;
        }
        match activities.check_duplicate(&document.id).await {
            Ok(true) => {
                outcome.duplicates_skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("duplicate check failed for {}: {}; processing anyway", document.id, e);
            }
        }
        children.push(document);
    }

    // Children run as independent ingestion workflows; the runtime's
    // workflow semaphore bounds their concurrency.
    let runtime_ref: &WorkflowRuntime = runtime;
    let results = futures::future::join_all(children.into_iter().map(|document| {
        let activities = Arc::clone(&activities);
        async move {
            let workflow_id = format!("ingest-{}", document.id);
            let mut child_input = DocumentInput::new(&document.url, &document.source_type);
            child_input.metadata = document.metadata.clone();
            child_input
                .metadata
                .insert("document_id".to_string(), document.id.clone());

            let result = runtime_ref
                .run_document_ingestion(&workflow_id, child_input)
                .await;
            if result.is_ok() {
                if let Err(e) = activities.mark_processed(&document.id).await {
                    warn!("failed to record {} in seen-set: {}", document.id, e);
                }
            }
            (document.id, result)
        }
    }))
    .await;

    for (document_id, result) in results {
        match result {
            Ok(_) => outcome.started += 1,
            Err(e) => {
                outcome.failed += 1;
                warn!("child ingestion for {} failed: {}", document_id, e);
            }
        }
    }

    info!(
        source = %input.name,
        collected = outcome.collected,
        started = outcome.started,
        duplicates = outcome.duplicates_skipped,
        failed = outcome.failed,
        "scheduled sweep finished"
    );
    Ok(outcome)
}

/// Run sweeps on the cron schedule until cancelled.
pub async fn run_schedule_loop(
    runtime: &WorkflowRuntime,
    input: ScheduleInput,
) -> Result<(), WorkflowError> {
    loop {
        let fire_at = next_fire(&input.schedule)?;
        let wait = (fire_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        info!(
            source = %input.name,
            "next sweep at {} (in {:?})",
            fire_at,
            wait
        );

        tokio::select! {
            _ = runtime.cancel_token().cancelled() => return Ok(()),
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = runtime.run_scheduled_sweep(input.clone()).await {
            warn!(source = %input.name, "sweep failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_fire_parses_cron() {
        let fire = next_fire("0 0 * * * *").unwrap();
        assert!(fire > Utc::now());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let err = next_fire("not a schedule").unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidSchedule { .. }));
    }
}

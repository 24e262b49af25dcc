//! Durable workflow runtime bindings.
//!
//! Three workflows orchestrate the ingestion activities: per-document
//! ingestion, scheduled collection, and batch coordination. Workflow state
//! is journaled to disk after every completed activity; re-running a
//! workflow with the same id replays recorded results instead of
//! re-executing their side effects, so state survives process restart.

mod batch;
mod ingest;
mod retry;
mod scheduled;

pub use batch::BatchOutcome;
pub use ingest::{DocumentInput, IngestionOutcome};
pub use retry::RetryPolicy;
pub use scheduled::{next_fire, run_schedule_loop, ScheduleInput, SweepOutcome};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activities::{Activities, ActivityError};

/// Workflow failures surfaced to callers.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow {workflow_id} failed in {activity}: {source}")]
    ActivityFailed {
        workflow_id: String,
        activity: String,
        #[source]
        source: ActivityError,
    },

    #[error("workflow {0} cancelled")]
    Cancelled(String),

    #[error("{failed} of {total} batch children failed: {summary}")]
    BatchFailed {
        failed: usize,
        total: usize,
        summary: String,
    },

    #[error("invalid cron schedule {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("workflow journal I/O: {0}")]
    Journal(#[from] std::io::Error),

    #[error("workflow journal serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Lifecycle of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One journaled activity completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub activity: String,
    pub completed: bool,
    /// Result payload for completed activities, error text otherwise.
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Durable record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub kind: String,
    pub input: serde_json::Value,
    pub status: WorkflowStatus,
    pub history: Vec<HistoryEvent>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    fn new(id: &str, kind: &str, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            input,
            status: WorkflowStatus::Running,
            history: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkflowRuntimeConfig {
    /// Directory for workflow journals; `None` disables durability.
    pub data_dir: Option<PathBuf>,
    /// Concurrent activity executions across all workflows.
    pub max_concurrent_activities: usize,
    /// Concurrent workflow tasks.
    pub max_concurrent_workflows: usize,
    /// Child-workflow bound for batch ingestion.
    pub batch_concurrency: usize,
    /// Retry policy applied to every activity.
    pub retry: RetryPolicy,
}

impl Default for WorkflowRuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_concurrent_activities: 10,
            max_concurrent_workflows: 10,
            batch_concurrency: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Journal state for one running workflow: the persisted record plus a
/// name-keyed replay index over completed activities.
struct Journal {
    record: WorkflowRecord,
    replay: HashMap<String, serde_json::Value>,
    path: Option<PathBuf>,
}

impl Journal {
    fn load_or_create(
        dir: Option<&PathBuf>,
        id: &str,
        kind: &str,
        input: serde_json::Value,
    ) -> Result<Self, WorkflowError> {
        let path = dir.map(|dir| dir.join(format!("{}.json", sanitize_id(id))));

        if let Some(path) = &path {
            if path.exists() {
                let record: WorkflowRecord = serde_json::from_slice(&std::fs::read(path)?)?;
                let replay = record
                    .history
                    .iter()
                    .filter(|event| event.completed)
                    .map(|event| (event.activity.clone(), event.payload.clone()))
                    .collect();
                debug!(workflow_id = id, "resuming from journal");
                return Ok(Self {
                    record,
                    replay,
                    path: Some(path.clone()),
                });
            }
        }

        let journal = Self {
            record: WorkflowRecord::new(id, kind, input),
            replay: HashMap::new(),
            path,
        };
        journal.persist()?;
        Ok(journal)
    }

    fn persist(&self) -> Result<(), WorkflowError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = tempfile::NamedTempFile::new_in(path.parent().unwrap_or(path))?;
        serde_json::to_writer_pretty(&temp, &self.record)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| WorkflowError::Journal(e.error))?;
        Ok(())
    }

    fn append(&mut self, activity: &str, completed: bool, payload: serde_json::Value) {
        if completed {
            self.replay
                .insert(activity.to_string(), payload.clone());
        }
        self.record.history.push(HistoryEvent {
            activity: activity.to_string(),
            completed,
            payload,
            recorded_at: Utc::now(),
        });
        self.record.updated_at = Utc::now();
    }

    fn finish(&mut self, status: WorkflowStatus, error: Option<String>) {
        self.record.status = status;
        self.record.error = error;
        self.record.updated_at = Utc::now();
    }
}

/// Replace path-hostile characters in workflow ids for journal filenames.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Execution context handed to a running workflow.
pub struct WorkflowContext {
    id: String,
    activities: Arc<Activities>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    activity_slots: Arc<Semaphore>,
    journal: Mutex<Journal>,
}

impl WorkflowContext {
    /// Workflow id (correlation id for logs).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The activity capability set.
    pub fn activities(&self) -> &Arc<Activities> {
        &self.activities
    }

    /// Cancellation token scoped to this workflow.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one named activity under the retry policy, journaling its
    /// result. If the journal already holds a completed result for this
    /// activity name, that result is replayed without re-executing.
    pub async fn execute<T, F, Fut>(&self, activity: &str, attempt_fn: F) -> Result<T, ActivityError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ActivityError>>,
    {
        // Replay path: recorded result wins, no side effects re-run.
        {
            let journal = self.journal.lock().await;
            if let Some(payload) = journal.replay.get(activity) {
                if let Ok(value) = serde_json::from_value::<T>(payload.clone()) {
                    debug!(workflow_id = %self.id, activity, "replaying journaled result");
                    return Ok(value);
                }
                warn!(
                    workflow_id = %self.id,
                    activity, "journaled payload did not deserialize; re-executing"
                );
            }
        }

        let _permit = self
            .activity_slots
            .acquire()
            .await
            .map_err(|_| ActivityError::Cancelled)?;

        let result = self.retry.run(activity, &self.cancel, attempt_fn).await;

        let mut journal = self.journal.lock().await;
        match &result {
            Ok(value) => {
                let payload = serde_json::to_value(value)
                    .unwrap_or(serde_json::Value::Null);
                journal.append(activity, true, payload);
            }
            Err(error) => {
                journal.append(activity, false, serde_json::Value::String(error.to_string()));
            }
        }
        if let Err(e) = journal.persist() {
            warn!(workflow_id = %self.id, "journal persist failed: {}", e);
        }
        result
    }
}

/// The durable workflow runtime: owns the activity set, concurrency
/// limits, and the journal directory.
pub struct WorkflowRuntime {
    activities: Arc<Activities>,
    config: WorkflowRuntimeConfig,
    workflow_slots: Arc<Semaphore>,
    activity_slots: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl WorkflowRuntime {
    pub fn new(activities: Arc<Activities>, config: WorkflowRuntimeConfig) -> Self {
        let workflow_slots = Arc::new(Semaphore::new(config.max_concurrent_workflows));
        let activity_slots = Arc::new(Semaphore::new(config.max_concurrent_activities));
        Self {
            activities,
            config,
            workflow_slots,
            activity_slots,
            cancel: CancellationToken::new(),
        }
    }

    /// Root cancellation token; cancelling it stops all workflows.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Activity capability set.
    pub fn activities(&self) -> &Arc<Activities> {
        &self.activities
    }

    /// Runtime configuration.
    pub fn config(&self) -> &WorkflowRuntimeConfig {
        &self.config
    }

    /// Request a graceful stop: running workflows observe cancellation at
    /// their next activity boundary or I/O point.
    pub fn shutdown(&self) {
        info!("workflow runtime shutting down");
        self.cancel.cancel();
    }

    /// Build the execution context for one workflow run.
    fn context(
        &self,
        id: &str,
        kind: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowContext, WorkflowError> {
        let journal = Journal::load_or_create(self.config.data_dir.as_ref(), id, kind, input)?;
        Ok(WorkflowContext {
            id: id.to_string(),
            activities: self.activities.clone(),
            retry: self.config.retry.clone(),
            cancel: self.cancel.child_token(),
            activity_slots: self.activity_slots.clone(),
            journal: Mutex::new(journal),
        })
    }

    /// Finish a workflow run: set status, persist, translate errors.
    async fn seal<T>(
        &self,
        ctx: &WorkflowContext,
        result: Result<T, ActivityError>,
    ) -> Result<T, WorkflowError> {
        let mut journal = ctx.journal.lock().await;
        match result {
            Ok(value) => {
                journal.finish(WorkflowStatus::Completed, None);
                journal.persist()?;
                Ok(value)
            }
            Err(ActivityError::Cancelled) => {
                journal.finish(WorkflowStatus::Cancelled, None);
                journal.persist()?;
                Err(WorkflowError::Cancelled(ctx.id.clone()))
            }
            Err(error) => {
                let failed_activity = journal
                    .record
                    .history
                    .iter()
                    .rev()
                    .find(|event| !event.completed)
                    .map(|event| event.activity.clone())
                    .unwrap_or_else(|| "workflow".to_string());
                journal.finish(WorkflowStatus::Failed, Some(error.to_string()));
                journal.persist()?;
                Err(WorkflowError::ActivityFailed {
                    workflow_id: ctx.id.clone(),
                    activity: failed_activity,
                    source: error,
                })
            }
        }
    }

    /// Run the document ingestion workflow for one input.
    pub async fn run_document_ingestion(
        &self,
        workflow_id: &str,
        input: DocumentInput,
    ) -> Result<IngestionOutcome, WorkflowError> {
        let _slot = self
            .workflow_slots
            .acquire()
            .await
            .map_err(|_| WorkflowError::Cancelled(workflow_id.to_string()))?;

        let ctx = self.context(workflow_id, "document_ingestion", serde_json::to_value(&input)?)?;
        info!(workflow_id, url = %input.url, "document ingestion started");
        let result = ingest::run(&ctx, input).await;
        self.seal(&ctx, result).await
    }

    /// Run one sweep of the scheduled ingestion workflow.
    pub async fn run_scheduled_sweep(
        &self,
        input: ScheduleInput,
    ) -> Result<SweepOutcome, WorkflowError> {
        scheduled::run_sweep(self, input).await
    }

    /// Run the batch ingestion workflow over a list of inputs.
    pub async fn run_batch(&self, inputs: Vec<DocumentInput>) -> Result<BatchOutcome, WorkflowError> {
        batch::run(self, inputs).await
    }
}

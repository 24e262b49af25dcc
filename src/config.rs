//! Configuration management for Granary.
//!
//! Settings come from a TOML file (`granary.toml` by default), with
//! environment and CLI flags layered on top by the caller.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::extract::ExtractorConfig;
use crate::storage::{HybridConfig, PrimaryBackend};
use crate::workflow::{RetryPolicy, ScheduleInput, WorkflowRuntimeConfig};

/// Default spill threshold for the fast backend's raw payloads (1 MB).
pub const DEFAULT_SPILL_THRESHOLD: usize = 1024 * 1024;

/// Storage section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Which backend receives writes first: `fast` or `durable`.
    pub primary_backend: PrimaryBackend,
    /// Retry the other backend when the primary fails.
    pub enable_fallback: bool,
    /// Per-attempt ceiling for one backend call, in seconds.
    pub operation_timeout_secs: u64,
    /// Replicate primary writes to the other backend in the background.
    pub enable_sync: bool,
    /// Minimum delay between sync sweeps, in seconds.
    pub sync_interval_secs: u64,
    /// Fast-backend payloads above this many bytes spill to disk.
    pub spill_threshold_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary_backend: PrimaryBackend::Fast,
            enable_fallback: true,
            operation_timeout_secs: 30,
            enable_sync: true,
            sync_interval_secs: 30,
            spill_threshold_bytes: DEFAULT_SPILL_THRESHOLD,
        }
    }
}

impl StorageConfig {
    /// Translate into the hybrid store's runtime configuration.
    pub fn hybrid(&self) -> HybridConfig {
        HybridConfig {
            primary_backend: self.primary_backend,
            enable_fallback: self.enable_fallback,
            operation_timeout: std::time::Duration::from_secs(self.operation_timeout_secs),
            enable_sync: self.enable_sync,
            sync_interval: std::time::Duration::from_secs(self.sync_interval_secs),
        }
    }
}

/// Ingestion section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Page ceiling for PDF extraction.
    pub max_pdf_pages: usize,
    /// Whether image OCR runs at all.
    pub ocr_enabled: bool,
    /// Tesseract language.
    pub ocr_language: String,
    /// Concurrent activity executions.
    pub max_concurrent_activities: usize,
    /// Concurrent workflow tasks.
    pub max_concurrent_workflows: usize,
    /// Child bound for batch ingestion.
    pub batch_concurrency: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_pdf_pages: 500,
            ocr_enabled: true,
            ocr_language: "eng".to_string(),
            max_concurrent_activities: 10,
            max_concurrent_workflows: 10,
            batch_concurrency: 5,
        }
    }
}

impl IngestionConfig {
    pub fn extractor(&self) -> ExtractorConfig {
        ExtractorConfig {
            max_pdf_pages: self.max_pdf_pages,
            ocr_enabled: self.ocr_enabled,
            ocr_language: self.ocr_language.clone(),
        }
    }

    /// Workflow runtime configuration, journaling under `data_dir`.
    pub fn runtime(&self, data_dir: &Path) -> WorkflowRuntimeConfig {
        WorkflowRuntimeConfig {
            data_dir: Some(data_dir.join("workflows")),
            max_concurrent_activities: self.max_concurrent_activities,
            max_concurrent_workflows: self.max_concurrent_workflows,
            batch_concurrency: self.batch_concurrency,
            retry: RetryPolicy::default(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GranaryConfig {
    /// Root for store data, journals, and the seen-set. Defaults to the
    /// platform data dir.
    pub data_dir: Option<PathBuf>,
    pub storage: StorageConfig,
    pub ingestion: IngestionConfig,
    /// Scheduled sources for the `schedule` command.
    #[serde(rename = "schedule")]
    pub schedules: Vec<ScheduleInput>,
}

impl GranaryConfig {
    /// Load configuration.
    ///
    /// Precedence: explicit path, `GRANARY_CONFIG`, `./granary.toml`,
    /// built-in defaults. `GRANARY_DATA_DIR` overrides the data dir.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let candidate = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("GRANARY_CONFIG").map(PathBuf::from))
            .or_else(|| {
                let default = PathBuf::from("granary.toml");
                default.exists().then_some(default)
            });

        let mut config = match candidate {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };

        if let Some(dir) = std::env::var_os("GRANARY_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    /// Resolved data directory.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("granary"))
                .unwrap_or_else(|| PathBuf::from("granary-data"))
        })
    }
}

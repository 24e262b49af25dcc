//! Operation metrics for storage and activity layers.
//!
//! Write-mostly sink: recording a sample is an O(1) map update behind a
//! mutex, and `summary()` returns an owned snapshot for display.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of one recorded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// One latency/outcome observation.
#[derive(Debug, Clone)]
pub struct OperationSample {
    pub operation: &'static str,
    /// Which backend served the operation, if any.
    pub backend: Option<String>,
    pub duration: Duration,
    pub outcome: Outcome,
    pub bytes: Option<u64>,
}

/// Aggregated statistics for one operation name.
#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub total_bytes: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Duration,
}

impl OperationStats {
    /// Mean latency across all recorded samples.
    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }

    fn record(&mut self, sample: &OperationSample) {
        self.count += 1;
        if sample.outcome == Outcome::Failure {
            self.errors += 1;
        }
        self.total_bytes += sample.bytes.unwrap_or(0);
        self.total_duration += sample.duration;
        self.min_duration = Some(match self.min_duration {
            Some(min) => min.min(sample.duration),
            None => sample.duration,
        });
        self.max_duration = self.max_duration.max(sample.duration);
    }
}

/// Counters for the hybrid store's backend routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCounters {
    pub primary_success: u64,
    pub primary_errors: u64,
    pub fallback_success: u64,
    pub fallback_errors: u64,
    pub sync_success: u64,
    pub sync_failures: u64,
}

/// Read-only snapshot of everything the sink has aggregated.
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub operations: HashMap<String, OperationStats>,
    pub backends: BackendCounters,
}

#[derive(Debug, Default)]
struct Inner {
    operations: HashMap<String, OperationStats>,
    backends: BackendCounters,
}

/// Thread-safe metrics sink shared across activities and storage.
#[derive(Debug, Clone, Default)]
pub struct MetricsSink {
    inner: Arc<Mutex<Inner>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one operation sample.
    pub fn record(&self, sample: OperationSample) {
        let mut inner = self.inner.lock().expect("metrics lock");
        let key = match &sample.backend {
            Some(backend) => format!("{}:{}", sample.operation, backend),
            None => sample.operation.to_string(),
        };
        inner.operations.entry(key).or_default().record(&sample);
    }

    pub fn record_primary_success(&self) {
        self.inner.lock().expect("metrics lock").backends.primary_success += 1;
    }

    pub fn record_primary_error(&self) {
        self.inner.lock().expect("metrics lock").backends.primary_errors += 1;
    }

    pub fn record_fallback_success(&self) {
        self.inner.lock().expect("metrics lock").backends.fallback_success += 1;
    }

    pub fn record_fallback_error(&self) {
        self.inner.lock().expect("metrics lock").backends.fallback_errors += 1;
    }

    pub fn record_sync(&self, success: bool) {
        let mut inner = self.inner.lock().expect("metrics lock");
        if success {
            inner.backends.sync_success += 1;
        } else {
            inner.backends.sync_failures += 1;
        }
    }

    /// Owned snapshot of all aggregates.
    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock().expect("metrics lock");
        MetricsSummary {
            operations: inner.operations.clone(),
            backends: inner.backends,
        }
    }
}

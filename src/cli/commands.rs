//! CLI commands implementation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::activities::{Activities, DuplicateChecker};
use crate::config::GranaryConfig;
use crate::metrics::MetricsSummary;
use crate::storage::{DiskBackend, HybridStore, MemoryBackend, StorageBackend};
use crate::workflow::{
    run_schedule_loop, DocumentInput, WorkflowError, WorkflowRuntime,
};

/// Grace period for in-flight workflows after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "granary")]
#[command(about = "Document ingestion and content-addressed corpus storage")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to ./granary.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a single document by URL
    Ingest {
        /// Document URL (http or https)
        url: String,
        /// Declared format tag (html, pdf, docx, text, ...)
        #[arg(long, default_value = "html")]
        r#type: String,
        /// Extra metadata as key=value pairs
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Ingest a batch of documents from a JSON file
    Batch {
        /// JSON file holding an array of {url, type, metadata} inputs
        file: PathBuf,
    },

    /// Run the configured scheduled sources
    Schedule {
        /// Only run the named source
        #[arg(long)]
        name: Option<String>,
        /// Run one sweep per source and exit instead of following cron
        #[arg(long)]
        once: bool,
    },

    /// Fetch a stored document by id
    Get {
        id: String,
        /// Print the full document as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored documents
    List {
        /// Metadata filters as key=value pairs (exact match)
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },

    /// Merge an ingest branch into trunk
    Merge {
        /// Branch name, e.g. ingest/<document-id>
        branch: String,
    },

    /// Show storage metrics and backend counters
    Stats,

    /// Probe external tools and backend health
    Check,
}

/// Everything a command needs: the hybrid store and the workflow runtime
/// built around it.
struct App {
    store: Arc<HybridStore>,
    runtime: Arc<WorkflowRuntime>,
}

impl App {
    fn build(config: &GranaryConfig) -> anyhow::Result<Self> {
        let data_dir = config.effective_data_dir();
        std::fs::create_dir_all(&data_dir)?;

        let fast: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::with_spill(
            data_dir.join("spill"),
            config.storage.spill_threshold_bytes,
        ));
        let durable: Arc<dyn StorageBackend> =
            Arc::new(DiskBackend::open(data_dir.join("store"))?);
        let store = Arc::new(HybridStore::new(
            fast,
            durable,
            config.storage.hybrid(),
            crate::metrics::MetricsSink::new(),
        ));

        let dedup = DuplicateChecker::open(data_dir.join("seen.jsonl"))?;
        let activities = Arc::new(
            Activities::new(store.clone(), dedup)
                .with_extractor(crate::extract::Extractor::with_config(
                    config.ingestion.extractor(),
                )),
        );
        let runtime = Arc::new(WorkflowRuntime::new(
            activities,
            config.ingestion.runtime(&data_dir),
        ));

        Ok(Self { store, runtime })
    }

    /// Close backends and log the metrics summary.
    async fn finish(&self) {
        if let Err(e) = self.store.close().await {
            warn!("store close failed: {}", e);
        }
        log_summary(&self.store.metrics().summary());
    }
}

/// Run a workload with graceful shutdown: on ctrl-c, stop accepting new
/// work, give in-flight workflows a bounded grace period, then close
/// backends and flush metrics.
async fn with_shutdown<T>(
    app: &App,
    work: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<Option<T>> {
    tokio::pin!(work);
    let result = tokio::select! {
        result = &mut work => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received; draining in-flight work");
            app.runtime.shutdown();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut work).await {
                Ok(result) => Some(result),
                Err(_) => {
                    warn!("grace period expired with work still in flight");
                    None
                }
            }
        }
    };
    app.finish().await;
    result.transpose()
}

/// Entry point called from `main`.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = GranaryConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    let app = App::build(&config)?;

    match cli.command {
        Commands::Ingest {
            url,
            r#type,
            metadata,
        } => {
            let mut input = DocumentInput::new(&url, &r#type);
            input.metadata = parse_pairs(&metadata)?;
            let runtime = app.runtime.clone();
            let outcome = with_shutdown(&app, async move {
                let workflow_id = format!("ingest-{}", crate::models::stable_document_id(&url));
                Ok(runtime.run_document_ingestion(&workflow_id, input).await?)
            })
            .await?;
            if let Some(outcome) = outcome {
                println!(
                    "stored {} at commit {} (branch {})",
                    outcome.document_id, outcome.commit_hash, outcome.branch
                );
            }
        }

        Commands::Batch { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let inputs: Vec<DocumentInput> = serde_json::from_str(&raw)?;
            let total = inputs.len();
            let runtime = app.runtime.clone();
            let outcome = with_shutdown(&app, async move {
                Ok(runtime.run_batch(inputs).await)
            })
            .await?;
            match outcome {
                Some(Ok(batch)) => {
                    println!("batch complete: {} of {} ingested", batch.succeeded.len(), total);
                }
                Some(Err(WorkflowError::BatchFailed {
                    failed,
                    total,
                    summary,
                })) => {
                    anyhow::bail!("batch finished with {failed} of {total} failures: {summary}");
                }
                Some(Err(e)) => return Err(e.into()),
                None => {}
            }
        }

        Commands::Schedule { name, once } => {
            let mut schedules = config.schedules.clone();
            if let Some(name) = &name {
                schedules.retain(|entry| entry.name == *name);
                if schedules.is_empty() {
                    anyhow::bail!("no configured schedule named {name:?}");
                }
            }
            if schedules.is_empty() {
                anyhow::bail!("no scheduled sources configured");
            }

            let runtime = app.runtime.clone();
            with_shutdown(&app, async move {
                if once {
                    for entry in schedules {
                        match runtime.run_scheduled_sweep(entry.clone()).await {
                            Ok(outcome) => println!(
                                "{}: collected {}, started {}, duplicates {}, failed {}",
                                entry.name,
                                outcome.collected,
                                outcome.started,
                                outcome.duplicates_skipped,
                                outcome.failed
                            ),
                            Err(e) => warn!("sweep for {} failed: {}", entry.name, e),
                        }
                    }
                    Ok(())
                } else {
                    let loops = schedules.into_iter().map(|entry| {
                        let runtime = runtime.clone();
                        async move { run_schedule_loop(&runtime, entry).await }
                    });
                    futures::future::try_join_all(loops).await?;
                    Ok(())
                }
            })
            .await?;
        }

        Commands::Get { id, json } => {
            let document = app.store.get_document(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&document)?);
            } else {
                let summary = document.summary();
                println!("id:      {}", summary.id);
                println!("source:  {} ({})", summary.url, summary.source_type);
                if let Some(title) = &summary.title {
                    println!("title:   {title}");
                }
                println!("text:    {} bytes", summary.text_length);
                println!("created: {}", summary.created_at);
            }
            app.finish().await;
        }

        Commands::List { filters } => {
            let filter = parse_pairs(&filters)?;
            let summaries = app.store.list_documents(&filter).await?;
            for summary in &summaries {
                println!(
                    "{}  {}  {}",
                    summary.id,
                    summary.title.as_deref().unwrap_or("-"),
                    summary.url
                );
            }
            println!("{} documents", summaries.len());
            app.finish().await;
        }

        Commands::Merge { branch } => {
            app.store.merge_branch(&branch).await?;
            println!("merged {branch}");
            app.finish().await;
        }

        Commands::Stats => {
            match app.store.health().await {
                Ok(()) => println!("store: healthy"),
                Err(e) => println!("store: unhealthy ({e})"),
            }
            let documents = app.store.list_documents(&BTreeMap::new()).await?;
            println!("documents: {}", documents.len());
            print_summary(&app.store.metrics().summary());
            app.finish().await;
        }

        Commands::Check => {
            let tesseract = which::which("tesseract").is_ok();
            println!(
                "tesseract: {}",
                if tesseract { "found" } else { "missing (image OCR unavailable)" }
            );
            match app.store.health().await {
                Ok(()) => println!("backends: healthy"),
                Err(e) => println!("backends: {e}"),
            }
            app.finish().await;
        }
    }

    Ok(())
}

/// Parse repeated `key=value` arguments.
fn parse_pairs(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("expected KEY=VALUE, got {pair:?}");
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

fn log_summary(summary: &MetricsSummary) {
    let counters = summary.backends;
    info!(
        primary_success = counters.primary_success,
        primary_errors = counters.primary_errors,
        fallback_success = counters.fallback_success,
        sync_success = counters.sync_success,
        sync_failures = counters.sync_failures,
        "final backend counters"
    );
}

fn print_summary(summary: &MetricsSummary) {
    let counters = summary.backends;
    println!("backend counters:");
    println!("  primary:  {} ok / {} errors", counters.primary_success, counters.primary_errors);
    println!(
        "  fallback: {} ok / {} errors",
        counters.fallback_success, counters.fallback_errors
    );
    println!("  sync:     {} ok / {} failed", counters.sync_success, counters.sync_failures);

    if summary.operations.is_empty() {
        return;
    }
    println!("operations:");
    let mut names: Vec<&String> = summary.operations.keys().collect();
    names.sort();
    for name in names {
        let stats = &summary.operations[name];
        println!(
            "  {:<24} {:>6} calls  {:>4} errors  avg {:?}",
            name,
            stats.count,
            stats.errors,
            stats.avg_duration()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let map = parse_pairs(&["a=1".to_string(), "b = two".to_string()]).unwrap();
        assert_eq!(map.get("a").unwrap(), "1");
        assert_eq!(map.get("b").unwrap(), "two");
        assert!(parse_pairs(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "granary", "ingest", "https://example.com/a", "--type", "pdf",
            "--meta", "category=news",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Ingest { .. }));
    }
}

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;

use metasync_kernel::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use metasync_kernel::config::SyncConfig;
use metasync_kernel::event::RawEvent;
use metasync_kernel::factory::EventFactory;
use metasync_kernel::mutator::{InMemoryMetadataCache, TableEntry};
use metasync_kernel::observability::{init_logging, LogFormat};
use metasync_kernel::processor::{EventProcessor, SyncReport};
use metasync_kernel::source::NotificationLog;

/// Metastore notification replay CLI
#[derive(Parser, Debug)]
#[command(name = "metasync")]
#[command(about = "Replay metastore notifications into a metadata cache", long_about = None)]
struct Cli {
    /// Path to a JSON array of metastore notifications
    #[arg(long)]
    events: String,

    /// Path to sync config JSON
    #[arg(long)]
    config: Option<String>,

    /// Resume after this notification id
    #[arg(long, conflicts_with = "checkpoint_file")]
    checkpoint: Option<u64>,

    /// Resume from, and persist progress to, this checkpoint file
    #[arg(long)]
    checkpoint_file: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputLogFormat::Pretty)]
    log_format: OutputLogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputLogFormat {
    Pretty,
    Json,
}

impl From<OutputLogFormat> for LogFormat {
    fn from(format: OutputLogFormat) -> Self {
        match format {
            OutputLogFormat::Pretty => LogFormat::Pretty,
            OutputLogFormat::Json => LogFormat::Json,
        }
    }
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    report: SyncReport,
    cache: std::collections::BTreeMap<String, TableEntry>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format.into());

    // ----------------------------
    // Load notifications
    // ----------------------------
    let data = fs::read_to_string(&cli.events)
        .with_context(|| format!("reading notifications from {}", cli.events))?;
    let events: Vec<RawEvent> = serde_json::from_str(&data)?;

    let mut log = NotificationLog::new();
    for event in events {
        log.append(event)?;
    }

    // ----------------------------
    // Load config
    // ----------------------------
    let config = match &cli.config {
        Some(path) => SyncConfig::load(path).with_context(|| format!("loading config {path}"))?,
        None => SyncConfig::default_config(),
    };

    // ----------------------------
    // Replay
    // ----------------------------
    let cache = Arc::new(InMemoryMetadataCache::new());
    let report = match &cli.checkpoint_file {
        Some(path) => {
            let store = FileCheckpointStore::open(path)
                .with_context(|| format!("opening checkpoint file {path}"))?;
            replay(log, Arc::clone(&cache), store, config)?
        }
        None => replay(
            log,
            Arc::clone(&cache),
            InMemoryCheckpointStore::new(cli.checkpoint),
            config,
        )?,
    };

    tracing::info!(
        checkpoint = ?report.checkpoint,
        skipped = report.skipped(),
        "replay finished"
    );

    // ----------------------------
    // Output
    // ----------------------------
    let output = CliOutput {
        report,
        cache: cache.snapshot(),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

fn replay<C: CheckpointStore>(
    log: NotificationLog,
    cache: Arc<InMemoryMetadataCache>,
    checkpoint: C,
    config: SyncConfig,
) -> Result<SyncReport> {
    let mut processor = EventProcessor::new(log, EventFactory::json(), cache, checkpoint, config);
    Ok(processor.run_until_caught_up()?)
}

//! Trace Replay Scanner
//!
//! This binary opens a replay dataset, streams one pass of batches and logs
//! per-batch statistics. It is useful for checking a dataset layout and
//! configuration before training on it.
//!
//! # Usage
//!
//! ```bash
//! # Scan with a configuration file
//! replay-scan --config replay.toml
//!
//! # Override the dataset root and stop after 100 batches
//! replay-scan --config replay.toml --root /data/traces --batches 100
//!
//! # Fill batches on a background thread
//! replay-scan --config replay.toml --prefetch
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replay_core::{BatchSummary, ReplayConfig, ReplayDataset};

/// Trace Replay Scanner
#[derive(Parser, Debug)]
#[command(name = "replay-scan")]
#[command(about = "Streams a trace dataset and reports per-batch statistics")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset root, overriding the configuration
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Stop after this many batches
    #[arg(short, long)]
    batches: Option<u64>,

    /// Seed for the session shuffle, overriding the configuration
    #[arg(long)]
    seed: Option<u64>,

    /// Fill batches on a background thread
    #[arg(long)]
    prefetch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default)]
struct Totals {
    batches: u64,
    rows: usize,
    padded: usize,
    new_sessions: usize,
    new_parts: usize,
}

impl Totals {
    fn record(&mut self, summary: &BatchSummary) {
        tracing::info!(
            "batch {}: {} rows, {} padded, {} new parts, {} new sessions, {} exhausted lanes",
            summary.batch_index,
            summary.rows_read,
            summary.padded_rows,
            summary.new_parts,
            summary.new_sessions,
            summary.exhausted_lanes
        );
        self.batches += 1;
        self.rows += summary.rows_read;
        self.padded += summary.padded_rows;
        self.new_sessions += summary.new_sessions;
        self.new_parts += summary.new_parts;
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => ReplayConfig::from_file(path)?,
        None => ReplayConfig::default(),
    }
    .with_env_overrides();
    if let Some(root) = args.root {
        config.dataset.root = root;
    }
    if let Some(seed) = args.seed {
        config.dataset.seed = Some(seed);
    }

    let dataset = ReplayDataset::from_config(config)?;
    let limit = args.batches.unwrap_or(u64::MAX);
    let started = Instant::now();
    let mut totals = Totals::default();

    if args.prefetch {
        let mut prefetcher = dataset.prefetch()?;
        while totals.batches < limit {
            let Some(batch) = prefetcher.next_batch()? else {
                break;
            };
            totals.record(&batch.summary);
            prefetcher.recycle(batch.buffers);
        }
    } else {
        let mut stream = dataset.stream()?;
        while totals.batches < limit {
            if stream.next_batch()?.is_none() {
                break;
            }
            if let Some(summary) = stream.last_summary() {
                totals.record(summary);
            }
        }
    }

    let elapsed = started.elapsed();
    tracing::info!("Scanned {} batches in {:.2?}", totals.batches, elapsed);
    tracing::info!("  Rows read: {}", totals.rows);
    tracing::info!("  Padded rows: {}", totals.padded);
    tracing::info!("  Sessions started: {}", totals.new_sessions);
    tracing::info!("  Parts opened: {}", totals.new_parts);

    Ok(())
}

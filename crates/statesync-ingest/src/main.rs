//! statesync-ingest - status document dry-run tool

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use statesync_common::logging::{init_logging, LogConfig, LogLevel};
use statesync_common::StateRecord;
use statesync_ingest::{SourceScanner, StatePolicyKind};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "statesync-ingest")]
#[command(author, version, about = "statesync status document tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Parse a directory once and print each batch as JSON, without publishing
    Scan {
        /// Directory holding status documents
        #[arg(short, long, env = "INGEST_DIRECTORY", default_value = "./XmlFiles")]
        dir: PathBuf,

        /// File extension to scan
        #[arg(short, long, env = "INGEST_EXTENSION", default_value = "xml")]
        extension: String,

        /// State policy: reported, random or fixed:<State>
        #[arg(short, long, env = "INGEST_STATE_POLICY", default_value = "reported")]
        policy: StatePolicyKind,
    },
}

#[derive(Serialize)]
struct ScannedFile<'a> {
    path: String,
    records: &'a [StateRecord],
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };

    // Console logs go to stderr; stdout carries the JSON
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("statesync-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Scan {
            dir,
            extension,
            policy,
        } => scan(dir, extension, policy).await,
    }
}

async fn scan(dir: PathBuf, extension: String, policy: StatePolicyKind) -> Result<()> {
    info!(directory = %dir.display(), %policy, "Scanning");

    let scanner = SourceScanner::open(dir, extension, policy.build()).await?;
    let report = scanner.scan().await?;

    for source in &report.batches {
        let line = serde_json::to_string(&ScannedFile {
            path: source.path.display().to_string(),
            records: source.batch.records(),
        })?;
        println!("{line}");
    }

    for failure in &report.failures {
        eprintln!("{}: {}", failure.path.display(), failure.error);
    }

    info!(
        files = report.batches.len(),
        records = report.record_count(),
        failures = report.failures.len(),
        "Scan complete"
    );

    if !report.failures.is_empty() {
        anyhow::bail!("{} file(s) could not be parsed", report.failures.len());
    }

    Ok(())
}

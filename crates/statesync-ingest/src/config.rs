//! Ingest configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::policy::StatePolicyKind;
use crate::producer::{
    ProcessedFilePolicy, ProducerConfig, DEFAULT_MAX_BACKOFF, DEFAULT_POLL_INTERVAL,
    DEFAULT_PROCESSED_SUFFIX,
};
use crate::scanner::DEFAULT_EXTENSION;

// ============================================================================
// Ingest Configuration Constants
// ============================================================================

/// Default directory scanned for status documents.
pub const DEFAULT_INGEST_DIRECTORY: &str = "./XmlFiles";

/// Scanner and producer settings
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub directory: PathBuf,
    pub extension: String,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub state_policy: StatePolicyKind,
    pub processed: ProcessedFilePolicy,
}

impl IngestConfig {
    /// Load from `INGEST_*` environment variables, falling back to defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let state_policy = match std::env::var("INGEST_STATE_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.state_policy,
        };

        let mark_processed = match std::env::var("INGEST_MARK_PROCESSED") {
            Ok(value) => parse_flag("INGEST_MARK_PROCESSED", &value)?,
            Err(_) => false,
        };
        let processed = if mark_processed {
            ProcessedFilePolicy::Rename {
                suffix: std::env::var("INGEST_PROCESSED_SUFFIX")
                    .unwrap_or_else(|_| DEFAULT_PROCESSED_SUFFIX.to_string()),
            }
        } else {
            ProcessedFilePolicy::Keep
        };

        let config = IngestConfig {
            directory: std::env::var("INGEST_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.directory),
            extension: std::env::var("INGEST_EXTENSION").unwrap_or(defaults.extension),
            poll_interval: std::env::var("INGEST_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            max_backoff: std::env::var("INGEST_MAX_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            state_policy,
            processed,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.directory.as_os_str().is_empty() {
            anyhow::bail!("Ingest directory cannot be empty");
        }

        if self.extension.trim_start_matches('.').is_empty() {
            anyhow::bail!("Ingest file extension cannot be empty");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("Ingest poll interval must be greater than 0");
        }

        if self.max_backoff < self.poll_interval {
            anyhow::bail!(
                "Ingest max backoff ({:?}) cannot be shorter than the poll interval ({:?})",
                self.max_backoff,
                self.poll_interval
            );
        }

        if let ProcessedFilePolicy::Rename { suffix } = &self.processed {
            if suffix.is_empty() {
                anyhow::bail!("Processed file suffix cannot be empty");
            }
            // A suffix ending in the scanned extension would be picked up again
            let extension = self.extension.trim_start_matches('.');
            if suffix
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", extension.to_ascii_lowercase()))
            {
                anyhow::bail!(
                    "Processed file suffix '{}' must not end with the scanned extension",
                    suffix
                );
            }
        }

        Ok(())
    }

    /// Producer settings for publishing to `queue`
    pub fn producer_config(&self, queue: impl Into<String>) -> ProducerConfig {
        ProducerConfig {
            queue: queue.into(),
            poll_interval: self.poll_interval,
            max_backoff: self.max_backoff,
            processed: self.processed.clone(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_INGEST_DIRECTORY),
            extension: DEFAULT_EXTENSION.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
            state_policy: StatePolicyKind::Reported,
            processed: ProcessedFilePolicy::Keep,
        }
    }
}

/// Boolean env value; anything unrecognised is an error rather than `false`
fn parse_flag(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("Invalid value '{}' for {}, expected true or false", other, name),
    }
}

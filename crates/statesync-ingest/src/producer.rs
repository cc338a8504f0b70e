//! Producer loop: scan the source directory and publish one message per file
//!
//! Every tick scans the directory and publishes each non-empty batch in file
//! name order. The first publish failure ends the tick; the unpublished files
//! are picked up again by the next tick. Failed ticks back off exponentially
//! up to `max_backoff`. A closed channel ends the loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use statesync_common::{MessageChannel, DEFAULT_QUEUE_NAME};

use crate::error::ProducerError;
use crate::scanner::SourceScanner;

/// Default pause between ticks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default ceiling for the retry delay after failed ticks
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default suffix appended to files whose batch was published
pub const DEFAULT_PROCESSED_SUFFIX: &str = ".processed";

/// What happens to a source file once its batch was published
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProcessedFilePolicy {
    /// Leave the file alone; it is published again on every tick
    #[default]
    Keep,
    /// Rename `a.xml` to `a.xml<suffix>` so it no longer matches the scan
    Rename { suffix: String },
}

impl ProcessedFilePolicy {
    pub fn rename() -> Self {
        Self::Rename {
            suffix: DEFAULT_PROCESSED_SUFFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub queue: String,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub processed: ProcessedFilePolicy,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE_NAME.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
            processed: ProcessedFilePolicy::Keep,
        }
    }
}

/// Counters for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub published: usize,
    pub records: usize,
    pub empty: usize,
    pub failed_files: usize,
}

/// Counters accumulated over a whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub batches_published: u64,
    pub records_published: u64,
    pub failed_files: u64,
}

impl ProducerStats {
    fn absorb(&mut self, tick: &TickSummary) {
        self.batches_published += tick.published as u64;
        self.records_published += tick.records as u64;
        self.failed_files += tick.failed_files as u64;
    }
}

pub struct BatchProducer {
    scanner: SourceScanner,
    channel: Arc<dyn MessageChannel>,
    config: ProducerConfig,
}

impl BatchProducer {
    pub fn new(
        scanner: SourceScanner,
        channel: Arc<dyn MessageChannel>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            scanner,
            channel,
            config,
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Scan once and publish what was found
    pub async fn tick(&self) -> Result<TickSummary, ProducerError> {
        let mut summary = TickSummary::default();
        self.tick_into(&mut summary).await?;
        Ok(summary)
    }

    async fn tick_into(&self, summary: &mut TickSummary) -> Result<(), ProducerError> {
        let report = self.scanner.scan().await?;
        summary.failed_files = report.failures.len();

        for source in report.batches {
            if source.batch.is_empty() {
                debug!(path = %source.path.display(), "Source file has no records, not publishing");
                summary.empty += 1;
                self.mark_processed(&source.path).await;
                continue;
            }

            self.channel
                .publish(&self.config.queue, &source.batch)
                .await
                .map_err(|e| ProducerError::Publish {
                    path: source.path.clone(),
                    source: e,
                })?;

            info!(
                path = %source.path.display(),
                queue = %self.config.queue,
                records = source.batch.len(),
                "Published batch"
            );
            summary.published += 1;
            summary.records += source.batch.len();
            self.mark_processed(&source.path).await;
        }

        Ok(())
    }

    async fn mark_processed(&self, path: &Path) {
        let ProcessedFilePolicy::Rename { suffix } = &self.config.processed else {
            return;
        };

        let target = processed_path(path, suffix);
        if let Err(e) = tokio::fs::rename(path, &target).await {
            // The file stays eligible and is published again next tick
            warn!(
                path = %path.display(),
                target = %target.display(),
                error = %e,
                "Failed to mark source file as processed"
            );
        }
    }

    /// Tick until cancelled, or until the channel is closed
    pub async fn run(&self, cancel: CancellationToken) -> Result<ProducerStats, ProducerError> {
        let mut stats = ProducerStats::default();
        let mut consecutive_failures: u32 = 0;

        info!(
            directory = %self.scanner.directory().display(),
            queue = %self.config.queue,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Producer started"
        );

        while !cancel.is_cancelled() {
            let mut summary = TickSummary::default();
            let result = self.tick_into(&mut summary).await;
            stats.ticks += 1;
            stats.absorb(&summary);

            let delay = match result {
                Ok(()) => {
                    consecutive_failures = 0;
                    self.config.poll_interval
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Producer stopping");
                    return Err(e);
                }
                Err(e) => {
                    stats.failed_ticks += 1;
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = backoff_delay(
                        self.config.poll_interval,
                        self.config.max_backoff,
                        consecutive_failures,
                    );
                    warn!(
                        error = %e,
                        consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Producer tick failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            ticks = stats.ticks,
            batches = stats.batches_published,
            records = stats.records_published,
            "Producer stopped"
        );
        Ok(stats)
    }
}

/// `a.xml` + `.processed` -> `a.xml.processed`
pub fn processed_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Poll interval doubled per consecutive failure, capped at `max`
fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.min(16);
    base.saturating_mul(factor).min(max.max(base))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);

        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, max, 4), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[test]
    fn test_backoff_never_below_poll_interval() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, Duration::from_secs(1), 3), base);
    }

    #[test]
    fn test_processed_path_appends_suffix() {
        assert_eq!(
            processed_path(Path::new("/data/XmlFiles/a.xml"), ".processed"),
            PathBuf::from("/data/XmlFiles/a.xml.processed")
        );
    }
}

//! Configuration management

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use statesync_common::channel::DEFAULT_MAX_DELIVERIES;
use statesync_common::{QueueOptions, DEFAULT_QUEUE_NAME};
use statesync_ingest::IngestConfig;

use crate::channel::{PgChannelOptions, DEFAULT_POLL_INTERVAL, DEFAULT_VISIBILITY_TIMEOUT};
use crate::consumer::{
    ConsumerConfig, DEFAULT_MAX_IN_FLIGHT, DEFAULT_PREFETCH, DEFAULT_REQUEUE_DELAY,
};
use crate::db::DbConfig;

// ============================================================================
// Process Configuration Constants
// ============================================================================

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Which loops this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineRole {
    #[default]
    All,
    Producer,
    Consumer,
}

impl PipelineRole {
    pub fn runs_producer(self) -> bool {
        matches!(self, PipelineRole::All | PipelineRole::Producer)
    }

    pub fn runs_consumer(self) -> bool {
        matches!(self, PipelineRole::All | PipelineRole::Consumer)
    }
}

impl FromStr for PipelineRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(PipelineRole::All),
            "producer" => Ok(PipelineRole::Producer),
            "consumer" => Ok(PipelineRole::Consumer),
            _ => Err(anyhow::anyhow!(
                "Invalid pipeline role '{}', expected all, producer or consumer",
                s
            )),
        }
    }
}

impl fmt::Display for PipelineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineRole::All => "all",
            PipelineRole::Producer => "producer",
            PipelineRole::Consumer => "consumer",
        })
    }
}

/// Message channel implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelBackend {
    /// In-process broker; producer and consumer must share the process
    #[default]
    Memory,
    Postgres,
}

impl FromStr for ChannelBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(ChannelBackend::Memory),
            "postgres" | "postgresql" => Ok(ChannelBackend::Postgres),
            _ => Err(anyhow::anyhow!(
                "Invalid channel backend '{}', expected memory or postgres",
                s
            )),
        }
    }
}

impl fmt::Display for ChannelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelBackend::Memory => "memory",
            ChannelBackend::Postgres => "postgres",
        })
    }
}

/// Message channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub backend: ChannelBackend,
    pub queue: String,
    pub max_deliveries: u32,
    /// PostgreSQL backend: wait between claims on an empty queue
    pub poll_interval: Duration,
    /// PostgreSQL backend: age at which an unsettled delivery is reclaimed
    pub visibility_timeout: Duration,
}

impl ChannelConfig {
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_deliveries: self.max_deliveries,
            ..QueueOptions::default()
        }
    }

    pub fn pg_options(&self) -> PgChannelOptions {
        PgChannelOptions {
            poll_interval: self.poll_interval,
            visibility_timeout: self.visibility_timeout,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backend: ChannelBackend::Memory,
            queue: DEFAULT_QUEUE_NAME.to_string(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: PipelineRole,
    pub database: DbConfig,
    pub ingest: IngestConfig,
    pub channel: ChannelConfig,
    pub consumer: ConsumerConfig,
    pub shutdown_timeout_secs: u64,
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let channel_defaults = ChannelConfig::default();
        let consumer_defaults = ConsumerConfig::default();

        let config = Config {
            role: match std::env::var("PIPELINE_ROLE") {
                Ok(role) => role.parse()?,
                Err(_) => PipelineRole::default(),
            },
            database: DbConfig::from_env()?,
            ingest: IngestConfig::from_env()?,
            channel: ChannelConfig {
                backend: match std::env::var("CHANNEL_BACKEND") {
                    Ok(backend) => backend.parse()?,
                    Err(_) => channel_defaults.backend,
                },
                queue: std::env::var("CHANNEL_QUEUE").unwrap_or(channel_defaults.queue),
                max_deliveries: env_parse("CHANNEL_MAX_DELIVERIES")
                    .unwrap_or(channel_defaults.max_deliveries),
                poll_interval: env_parse("CHANNEL_POLL_INTERVAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(channel_defaults.poll_interval),
                visibility_timeout: env_parse("CHANNEL_VISIBILITY_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(channel_defaults.visibility_timeout),
            },
            consumer: ConsumerConfig {
                queue: std::env::var("CHANNEL_QUEUE").unwrap_or(consumer_defaults.queue),
                max_in_flight: env_parse("CONSUMER_MAX_IN_FLIGHT")
                    .unwrap_or(DEFAULT_MAX_IN_FLIGHT),
                prefetch: env_parse("CONSUMER_PREFETCH").unwrap_or(DEFAULT_PREFETCH),
                requeue_delay: env_parse("CONSUMER_REQUEUE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_REQUEUE_DELAY),
            },
            shutdown_timeout_secs: env_parse("SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.database.validate()?;
        self.ingest.validate()?;

        if self.channel.queue.trim().is_empty() {
            anyhow::bail!("Channel queue name cannot be empty");
        }

        if self.channel.max_deliveries == 0 {
            anyhow::bail!("Channel max_deliveries must be greater than 0");
        }

        if self.channel.backend == ChannelBackend::Postgres && self.channel.poll_interval.is_zero()
        {
            anyhow::bail!("Channel poll interval must be greater than 0");
        }

        // Producer and consumer only meet through a shared broker
        if self.channel.backend == ChannelBackend::Memory && self.role != PipelineRole::All {
            anyhow::bail!(
                "Pipeline role '{}' requires CHANNEL_BACKEND=postgres; the memory channel only works with role 'all'",
                self.role
            );
        }

        if self.consumer.max_in_flight == 0 {
            anyhow::bail!("Consumer max_in_flight must be greater than 0");
        }

        if self.consumer.prefetch == 0 {
            anyhow::bail!("Consumer prefetch must be greater than 0");
        }

        if self.consumer.prefetch < self.consumer.max_in_flight {
            tracing::warn!(
                prefetch = self.consumer.prefetch,
                max_in_flight = self.consumer.max_in_flight,
                "Consumer prefetch is below max_in_flight; some handlers will stay idle"
            );
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

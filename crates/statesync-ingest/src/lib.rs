//! statesync ingest library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Reads module status documents from a directory and publishes them to the
//! message channel, one batch per file.
//!
//! # Components
//!
//! - **Parser**: XML status documents to record nodes
//! - **Policy**: how a record's state is chosen
//! - **Scanner**: directory listing with per-file error isolation
//! - **Producer**: the poll/publish loop
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use statesync_common::{MemoryChannel, QueueOptions, DEFAULT_QUEUE_NAME};
//! use statesync_common::MessageChannel;
//! use statesync_ingest::{BatchProducer, IngestConfig, SourceScanner};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let scanner =
//!         SourceScanner::open(&config.directory, &config.extension, config.state_policy.build())
//!             .await?;
//!
//!     let channel = Arc::new(MemoryChannel::new());
//!     channel.declare(DEFAULT_QUEUE_NAME, &QueueOptions::default()).await?;
//!
//!     let producer =
//!         BatchProducer::new(scanner, channel, config.producer_config(DEFAULT_QUEUE_NAME));
//!     producer.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod parser;
pub mod policy;
pub mod producer;
pub mod scanner;

pub use config::IngestConfig;
pub use error::{ParseError, ProducerError, ScanError};
pub use policy::{
    FixedStatePolicy, RandomStatePolicy, ReportedStatePolicy, StatePolicy, StatePolicyKind,
};
pub use producer::{BatchProducer, ProcessedFilePolicy, ProducerConfig, ProducerStats, TickSummary};
pub use scanner::{FileFailure, ScanReport, SourceBatch, SourceScanner};

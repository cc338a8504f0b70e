//! statesync server library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Consumes state batches from the message channel and reconciles them into
//! the `modules` table.
//!
//! # Overview
//!
//! - **Reconciliation**: per-batch upsert into a [`reconcile::StateStore`]
//! - **Consumer**: subscription loop with bounded concurrency; a delivery is
//!   acknowledged only after its batch was committed
//! - **Channel**: the PostgreSQL queue that lets producer and consumer run as
//!   separate processes
//! - **Pipeline**: runs the producer and consumer loops selected by the
//!   process role
//!
//! # Example
//!
//! ```no_run
//! use statesync_server::{config::Config, db, pipeline::Pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     db::run_migrations(&pool).await?;
//!
//!     let pipeline = Pipeline::from_config(&config, pool).await?;
//!     let report = pipeline.run(CancellationToken::new()).await?;
//!     assert!(report.is_success());
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod consumer;
pub mod db;
pub mod pipeline;
pub mod reconcile;

// Re-export commonly used types
pub use consumer::{BatchConsumer, ConsumerConfig, ConsumerError, ConsumerStats};
pub use pipeline::{LoopOutcome, Pipeline, PipelineError, PipelineReport};
pub use reconcile::{ReconcileError, ReconcileSummary, ReconciliationEngine, StateStore};

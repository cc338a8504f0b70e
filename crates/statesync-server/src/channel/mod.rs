//! Message channel backends available to the server

mod postgres;

pub use postgres::{
    PgChannel, PgChannelOptions, DEFAULT_POLL_INTERVAL, DEFAULT_VISIBILITY_TIMEOUT,
};

use sqlx::PgPool;
use std::sync::Arc;

use statesync_common::{MemoryChannel, MessageChannel};

use crate::config::{ChannelBackend, ChannelConfig};

/// Build the configured channel. The queue is declared later by the pipeline.
pub fn open_channel(config: &ChannelConfig, pool: &PgPool) -> Arc<dyn MessageChannel> {
    match config.backend {
        ChannelBackend::Memory => Arc::new(MemoryChannel::new()),
        ChannelBackend::Postgres => Arc::new(PgChannel::new(pool.clone(), config.pg_options())),
    }
}

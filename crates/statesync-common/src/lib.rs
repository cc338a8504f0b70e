//! statesync common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared record model, message channel contract, error handling and logging
//! for the statesync workspace.
//!
//! # Overview
//!
//! - **Types**: [`StateRecord`], [`ModuleState`] and [`Batch`], the data contract
//!   shared by the file scanner and the reconciliation side
//! - **Channel**: the [`MessageChannel`] publish/consume/ack contract and the
//!   in-process [`MemoryChannel`] broker
//! - **Error Handling**: record-level error type and result alias
//! - **Logging**: tracing subscriber setup shared by both binaries
//!
//! # Example
//!
//! ```no_run
//! use statesync_common::{Batch, ModuleState, StateRecord};
//!
//! fn encode() -> statesync_common::Result<Vec<u8>> {
//!     let batch = Batch::new(vec![StateRecord::new("M1", ModuleState::Online)?]);
//!     batch.to_json_bytes()
//! }
//! ```

pub mod channel;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use channel::{
    ChannelError, ChannelResult, Delivery, DeliveryTag, MemoryChannel, Message, MessageChannel,
    QueueOptions, Subscription, DEFAULT_QUEUE_NAME,
};
pub use error::{RecordError, Result};
pub use types::{Batch, ModuleState, StateRecord};

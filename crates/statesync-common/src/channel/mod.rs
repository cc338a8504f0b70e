//! Message channel contract
//!
//! Publish/consume/acknowledge semantics over a broker, modelled on a single
//! work queue with at-least-once delivery:
//!
//! - a delivered message stays owned by the broker until it is settled with
//!   [`MessageChannel::ack`] or [`MessageChannel::nack`]
//! - a delivery tag can be settled once; settling it again is
//!   [`ChannelError::UnknownDeliveryTag`]
//! - deliveries a subscription never settled are requeued when it closes
//! - a message nacked too many times moves to the queue's dead letters
//!
//! [`MemoryChannel`] is the in-process broker. Other backends live with the
//! process that owns their connection.

mod memory;

pub use memory::MemoryChannel;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RecordError;
use crate::types::Batch;

/// Queue the scanner publishes to and the processor consumes from
pub const DEFAULT_QUEUE_NAME: &str = "DataProcessorQueue";

/// Deliveries a queue attempts before dead-lettering a message
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Result type alias for channel operations
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Channel operation errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel (or its connection) was closed
    #[error("Channel is closed")]
    Closed,

    #[error("Queue '{0}' has not been declared")]
    QueueNotDeclared(String),

    /// Tag was never issued, or was already acked/nacked
    #[error("Unknown or already settled delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("Failed to encode message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid message payload: {0}")]
    InvalidPayload(#[from] RecordError),

    /// Transport-specific failure (connection refused, query error, ...)
    #[error("Channel backend error: {0}")]
    Backend(String),
}

impl ChannelError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Whether the channel can no longer be used at all
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

/// Opaque handle identifying one delivery of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue declaration arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts (ignored by [`MemoryChannel`])
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Deliveries before a requeued message is dead-lettered instead
    pub max_deliveries: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: false,
            exclusive: false,
            auto_delete: false,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }
}

/// A message handed to a subscriber, not yet settled
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// Set when the message was delivered before and requeued
    pub redelivered: bool,
    /// Delivery attempts including this one
    pub delivery_count: u32,
}

impl Delivery {
    /// Decode the body into a [`Message`]
    pub fn decode(&self) -> ChannelResult<Message> {
        let batch = Batch::from_json_slice(&self.body)?;
        Ok(Message {
            batch,
            tag: self.tag,
        })
    }
}

/// Decoded delivery: the batch plus the tag that settles it
#[derive(Debug, Clone)]
pub struct Message {
    pub batch: Batch,
    pub tag: DeliveryTag,
}

/// Broker abstraction used by the producer and consumer loops
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Create the queue if it does not exist
    async fn declare(&self, queue: &str, options: &QueueOptions) -> ChannelResult<()>;

    /// Publish one batch as one message; no publisher confirm is awaited
    async fn publish(&self, queue: &str, batch: &Batch) -> ChannelResult<()>;

    /// Start consuming with at most `prefetch` unsettled deliveries buffered
    async fn consume(&self, queue: &str, prefetch: usize) -> ChannelResult<Subscription>;

    async fn ack(&self, tag: DeliveryTag) -> ChannelResult<()>;

    /// Reject a delivery; requeued messages past their delivery limit are
    /// dead-lettered, as are messages rejected with `requeue = false`
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> ChannelResult<()>;

    /// Close the channel, ending every subscription
    async fn close(&self) -> ChannelResult<()>;
}

/// Stream of deliveries fed by a backend pump task through a bounded buffer
///
/// Dropping or closing the subscription stops the pump. The pump is
/// responsible for requeueing the deliveries it handed out but that were
/// never settled.
pub struct Subscription {
    consumer_tag: String,
    receiver: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a backend pump. `cancel` must stop the pump task.
    pub fn new(
        consumer_tag: impl Into<String>,
        receiver: mpsc::Receiver<Delivery>,
        cancel: CancellationToken,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            receiver,
            cancel,
            pump: Some(pump),
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Next delivery, or `None` once the subscription or channel has closed
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Stop the pump and wait for it to release unsettled deliveries
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.receiver.close();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                tracing::warn!(
                    consumer_tag = %self.consumer_tag,
                    error = %e,
                    "Subscription pump ended abnormally"
                );
            }
        }
        tracing::debug!(consumer_tag = %self.consumer_tag, "Subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

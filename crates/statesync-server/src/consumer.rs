//! Consumer loop: reconcile delivered batches and settle their tags
//!
//! A delivery is acknowledged only after its batch was committed. A batch
//! that fails to reconcile is rejected with requeue after `requeue_delay`, so
//! the channel redelivers it until its delivery limit dead-letters it. A body
//! that does not decode is dead-lettered at once.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use statesync_common::{
    ChannelError, Delivery, DeliveryTag, MessageChannel, Subscription, DEFAULT_QUEUE_NAME,
};

use crate::reconcile::ReconciliationEngine;

/// Default number of deliveries handled concurrently
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Default number of deliveries buffered ahead of the handlers
pub const DEFAULT_PREFETCH: usize = 8;

/// Default pause before a failed delivery is handed back
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to subscribe to queue '{queue}': {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: ChannelError,
    },

    /// The channel ended the subscription without being asked to
    #[error("Subscription to queue '{0}' ended unexpectedly")]
    SubscriptionEnded(String),
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    pub max_in_flight: usize,
    pub prefetch: usize,
    pub requeue_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE_NAME.to_string(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            prefetch: DEFAULT_PREFETCH,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

/// Counters accumulated over a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    /// Undecodable deliveries sent to the dead letters
    pub rejected: u64,
    /// Deliveries whose ack/nack failed, or whose handler panicked
    pub unsettled: u64,
    pub records_reconciled: u64,
}

/// How a single delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked { records: usize },
    Requeued,
    Rejected,
    Unsettled,
}

impl ConsumerStats {
    fn record(&mut self, result: Result<Outcome, JoinError>) {
        match result {
            Ok(Outcome::Acked { records }) => {
                self.acked += 1;
                self.records_reconciled += records as u64;
            }
            Ok(Outcome::Requeued) => self.requeued += 1,
            Ok(Outcome::Rejected) => self.rejected += 1,
            Ok(Outcome::Unsettled) => self.unsettled += 1,
            Err(e) => {
                // The tag is released when the subscription closes
                error!(error = %e, "Delivery handler panicked");
                self.unsettled += 1;
            }
        }
    }
}

pub struct BatchConsumer {
    channel: Arc<dyn MessageChannel>,
    engine: ReconciliationEngine,
    config: ConsumerConfig,
}

impl BatchConsumer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        engine: ReconciliationEngine,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            channel,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Subscribe to the configured queue
    pub async fn subscribe(&self) -> Result<Subscription, ConsumerError> {
        self.channel
            .consume(&self.config.queue, self.config.prefetch)
            .await
            .map_err(|source| ConsumerError::Subscribe {
                queue: self.config.queue.clone(),
                source,
            })
    }

    /// Subscribe, then consume until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<ConsumerStats, ConsumerError> {
        let subscription = self.subscribe().await?;
        self.run_with(subscription, cancel).await
    }

    /// Consume from `subscription` until cancelled, then finish in-flight
    /// deliveries and close the subscription
    pub async fn run_with(
        &self,
        mut subscription: Subscription,
        cancel: CancellationToken,
    ) -> Result<ConsumerStats, ConsumerError> {
        let queue = self.config.queue.clone();

        info!(
            queue = %queue,
            consumer_tag = %subscription.consumer_tag(),
            max_in_flight = self.config.max_in_flight,
            prefetch = self.config.prefetch,
            "Consumer started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut handlers: JoinSet<Outcome> = JoinSet::new();
        let mut stats = ConsumerStats::default();

        let result = loop {
            while let Some(finished) = handlers.try_join_next() {
                stats.record(finished);
            }

            // A free handler slot comes first, so no delivery waits unowned
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                delivery = subscription.next() => delivery,
            };

            let Some(delivery) = delivery else {
                break Err(ConsumerError::SubscriptionEnded(queue.clone()));
            };

            stats.received += 1;
            let channel = self.channel.clone();
            let engine = self.engine.clone();
            let requeue_delay = self.config.requeue_delay;
            handlers.spawn(async move {
                let _permit = permit;
                handle_delivery(channel.as_ref(), &engine, delivery, requeue_delay).await
            });
        };

        if !handlers.is_empty() {
            debug!(in_flight = handlers.len(), "Waiting for in-flight deliveries");
        }
        while let Some(finished) = handlers.join_next().await {
            stats.record(finished);
        }
        subscription.close().await;

        match result {
            Ok(()) => {
                info!(
                    queue = %queue,
                    received = stats.received,
                    acked = stats.acked,
                    requeued = stats.requeued,
                    rejected = stats.rejected,
                    "Consumer stopped"
                );
                Ok(stats)
            }
            Err(e) => {
                error!(queue = %queue, error = %e, acked = stats.acked, "Consumer stopping");
                Err(e)
            }
        }
    }
}

/// Decode, reconcile and settle one delivery. The tag is settled exactly once.
async fn handle_delivery(
    channel: &dyn MessageChannel,
    engine: &ReconciliationEngine,
    delivery: Delivery,
    requeue_delay: Duration,
) -> Outcome {
    let tag = delivery.tag;

    let message = match delivery.decode() {
        Ok(message) => message,
        Err(e) => {
            warn!(tag = %tag, error = %e, "Undecodable message, dead-lettering");
            return match channel.nack(tag, false).await {
                Ok(()) => Outcome::Rejected,
                Err(e) => settle_failed(tag, e),
            };
        }
    };

    match engine.reconcile(&message.batch).await {
        Ok(summary) => match channel.ack(tag).await {
            Ok(()) => {
                debug!(
                    tag = %tag,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "Batch reconciled"
                );
                Outcome::Acked {
                    records: message.batch.len(),
                }
            }
            Err(e) => settle_failed(tag, e),
        },
        Err(e) => {
            warn!(
                tag = %tag,
                records = message.batch.len(),
                delivery_count = delivery.delivery_count,
                error = %e,
                "Reconciliation failed, requeueing"
            );
            tokio::time::sleep(requeue_delay).await;
            match channel.nack(tag, true).await {
                Ok(()) => Outcome::Requeued,
                Err(e) => settle_failed(tag, e),
            }
        }
    }
}

fn settle_failed(tag: DeliveryTag, e: ChannelError) -> Outcome {
    error!(tag = %tag, error = %e, "Failed to settle delivery");
    Outcome::Unsettled
}

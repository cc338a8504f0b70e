//! In-process broker
//!
//! Queues live in memory and vanish with the process, like a non-durable
//! queue on a broker that restarts. Everything else follows the channel
//! contract: unsettled deliveries are tracked per consumer, requeued on
//! close, and dead-lettered once they exceed the queue's delivery limit.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ChannelError, ChannelResult, Delivery, DeliveryTag, MessageChannel, QueueOptions,
    Subscription,
};
use crate::types::Batch;

/// In-memory [`MessageChannel`]; clones share the same broker
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    /// Woken on publish and requeue so idle pumps re-check their queue
    notify: Notify,
    closed: CancellationToken,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: u64,
    next_consumer: u64,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Envelope>,
    dead_letters: Vec<Envelope>,
}

#[derive(Debug, Clone)]
struct Envelope {
    body: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    envelope: Envelope,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting for delivery on `queue`
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out and not yet settled, across all queues
    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    /// Bodies of the messages dead-lettered on `queue`, oldest first
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Enqueue a raw body, as a foreign publisher would
    pub fn publish_bytes(&self, queue: &str, body: Vec<u8>) -> ChannelResult<()> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| ChannelError::QueueNotDeclared(queue.to_string()))?;
            queue_state.ready.push_back(Envelope {
                body,
                delivery_count: 0,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // State stays consistent across panics: every mutation is a single move
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_next(&self, queue: &str, consumer_tag: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let mut envelope = state.queues.get_mut(queue)?.ready.pop_front()?;
        envelope.delivery_count += 1;

        state.next_tag += 1;
        let tag = DeliveryTag::new(state.next_tag);
        let delivery = Delivery {
            tag,
            body: envelope.body.clone(),
            redelivered: envelope.delivery_count > 1,
            delivery_count: envelope.delivery_count,
        };
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
                envelope,
            },
        );
        Some(delivery)
    }

    /// Requeue every unsettled delivery matching `owned`, keeping their order
    fn requeue_where(&self, owned: impl Fn(&Unacked) -> bool) -> usize {
        let mut state = self.lock();
        let mut tags: Vec<DeliveryTag> = state
            .unacked
            .iter()
            .filter(|(_, unacked)| owned(unacked))
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first, so pushing to the front restores delivery order
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let count = tags.len();
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(unacked.envelope);
                }
            }
        }
        drop(state);

        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn declare(&self, queue: &str, options: &QueueOptions) -> ChannelResult<()> {
        self.ensure_open()?;
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                options: options.clone(),
                ready: VecDeque::new(),
                dead_letters: Vec::new(),
            });
        debug!(queue = %queue, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, batch: &Batch) -> ChannelResult<()> {
        self.publish_bytes(queue, batch.to_json_bytes()?)
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> ChannelResult<Subscription> {
        self.ensure_open()?;
        let consumer_tag = {
            let mut state = self.shared.lock();
            if !state.queues.contains_key(queue) {
                return Err(ChannelError::QueueNotDeclared(queue.to_string()));
            }
            state.next_consumer += 1;
            format!("memory-consumer-{}", state.next_consumer)
        };

        let (tx, rx) = mpsc::channel(prefetch.max(1));
        let cancel = self.shared.closed.child_token();
        let pump = tokio::spawn(pump(
            self.shared.clone(),
            queue.to_string(),
            consumer_tag.clone(),
            tx,
            cancel.clone(),
        ));

        debug!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Consumer started");
        Ok(Subscription::new(consumer_tag, rx, cancel, pump))
    }

    async fn ack(&self, tag: DeliveryTag) -> ChannelResult<()> {
        self.ensure_open()?;
        self.shared
            .lock()
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(ChannelError::UnknownDeliveryTag(tag))
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> ChannelResult<()> {
        self.ensure_open()?;
        let requeued = {
            let mut state = self.shared.lock();
            let unacked = state
                .unacked
                .remove(&tag)
                .ok_or(ChannelError::UnknownDeliveryTag(tag))?;
            let Some(queue) = state.queues.get_mut(&unacked.queue) else {
                return Ok(());
            };

            let delivery_count = unacked.envelope.delivery_count;
            if requeue && delivery_count < queue.options.max_deliveries {
                queue.ready.push_front(unacked.envelope);
                true
            } else {
                warn!(
                    queue = %unacked.queue,
                    tag = %tag,
                    delivery_count,
                    "Message dead-lettered"
                );
                queue.dead_letters.push(unacked.envelope);
                false
            }
        };

        if requeued {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    async fn close(&self) -> ChannelResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.shared.closed.cancel();
        let requeued = self.shared.requeue_where(|_| true);
        debug!(requeued, "Memory channel closed");
        Ok(())
    }
}

/// Moves messages from the queue into the subscription buffer, one reserved
/// slot at a time so the buffer never holds more than `prefetch` deliveries
async fn pump(
    shared: Arc<Shared>,
    queue: String,
    consumer_tag: String,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking, or a publish in between is missed
            notified.as_mut().enable();

            if let Some(delivery) = shared.take_next(&queue, &consumer_tag) {
                break Some(delivery);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                _ = &mut notified => {}
            }
        };

        match delivery {
            Some(delivery) => permit.send(delivery),
            None => break,
        }
    }

    let released = shared.requeue_where(|unacked| unacked.consumer_tag == consumer_tag);
    debug!(consumer_tag = %consumer_tag, released, "Consumer stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{ModuleState, StateRecord};
    use std::time::Duration;

    const QUEUE: &str = "test-queue";

    fn batch(key: &str) -> Batch {
        Batch::new(vec![StateRecord::new(key, ModuleState::Online).unwrap()])
    }

    async fn declared(max_deliveries: u32) -> MemoryChannel {
        let channel = MemoryChannel::new();
        let options = QueueOptions {
            max_deliveries,
            ..QueueOptions::default()
        };
        channel.declare(QUEUE, &options).await.unwrap();
        channel
    }

    async fn next(subscription: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("delivery within timeout")
            .expect("subscription open")
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_fails() {
        let channel = MemoryChannel::new();
        let err = channel.publish("missing", &batch("M1")).await.unwrap_err();
        assert!(matches!(err, ChannelError::QueueNotDeclared(q) if q == "missing"));
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let channel = declared(5).await;
        channel.publish(QUEUE, &batch("M1")).await.unwrap();

        let mut subscription = channel.consume(QUEUE, 1).await.unwrap();
        let delivery = next(&mut subscription).await;
        assert!(!delivery.redelivered);
        assert_eq!(delivery.decode().unwrap().batch, batch("M1"));
        assert_eq!(channel.unacked_count(), 1);

        channel.ack(delivery.tag).await.unwrap();
        assert_eq!(channel.unacked_count(), 0);
        assert_eq!(channel.ready_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_tag_settles_exactly_once() {
        let channel = declared(5).await;
        channel.publish(QUEUE, &batch("M1")).await.unwrap();
        let mut subscription = channel.consume(QUEUE, 1).await.unwrap();
        let delivery = next(&mut subscription).await;

        channel.ack(delivery.tag).await.unwrap();
        assert!(matches!(
            channel.ack(delivery.tag).await,
            Err(ChannelError::UnknownDeliveryTag(_))
        ));
        assert!(matches!(
            channel.nack(delivery.tag, true).await,
            Err(ChannelError::UnknownDeliveryTag(_))
        ));
    }

    #[tokio::test]
    async fn test_nack_requeues_for_redelivery() {
        let channel = declared(5).await;
        channel.publish(QUEUE, &batch("M1")).await.unwrap();
        let mut subscription = channel.consume(QUEUE, 1).await.unwrap();

        let first = next(&mut subscription).await;
        channel.nack(first.tag, true).await.unwrap();

        let second = next(&mut subscription).await;
        assert_ne!(first.tag, second.tag);
        assert!(second.redelivered);
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.body, first.body);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_deliveries() {
        let channel = declared(2).await;
        channel.publish(QUEUE, &batch("M1")).await.unwrap();
        let mut subscription = channel.consume(QUEUE, 1).await.unwrap();

        let first = next(&mut subscription).await;
        channel.nack(first.tag, true).await.unwrap();
        let second = next(&mut subscription).await;
        channel.nack(second.tag, true).await.unwrap();

        assert_eq!(channel.ready_count(QUEUE), 0);
        assert_eq!(channel.unacked_count(), 0);
        assert_eq!(channel.dead_letters(QUEUE), vec![second.body]);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters_immediately() {
        let channel = declared(5).await;
        channel.publish(QUEUE, &batch("M1")).await.unwrap();
        let mut subscription = channel.consume(QUEUE, 1).await.unwrap();

        let delivery = next(&mut subscription).await;
        channel.nack(delivery.tag, false).await.unwrap();
        assert_eq!(channel.dead_letters(QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unsettled_deliveries() {
        let channel = declared(5).await;
        for key in ["M1", "M2", "M3", "M4"] {
            channel.publish(QUEUE, &batch(key)).await.unwrap();
        }

        let mut subscription = channel.consume(QUEUE, 2).await.unwrap();
        let first = next(&mut subscription).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One delivery taken, two more buffered at most
        assert!(channel.unacked_count() <= 3);
        assert!(channel.ready_count(QUEUE) >= 1);
        channel.ack(first.tag).await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_subscription_requeues_unsettled() {
        let channel = declared(5).await;
        channel.publish(QUEUE, &batch("M1")).await.unwrap();
        channel.publish(QUEUE, &batch("M2")).await.unwrap();

        let mut subscription = channel.consume(QUEUE, 2).await.unwrap();
        let first = next(&mut subscription).await;
        subscription.close().await;

        assert_eq!(channel.unacked_count(), 0);
        assert_eq!(channel.ready_count(QUEUE), 2);
        assert!(matches!(
            channel.ack(first.tag).await,
            Err(ChannelError::UnknownDeliveryTag(_))
        ));

        // Original order is preserved for the next consumer
        let mut again = channel.consume(QUEUE, 1).await.unwrap();
        let redelivered = next(&mut again).await;
        assert_eq!(redelivered.body, first.body);
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_message_published_after_subscribe_is_delivered() {
        let channel = declared(5).await;
        let mut subscription = channel.consume(QUEUE, 1).await.unwrap();

        let publisher = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(QUEUE, &batch("late")).await.unwrap();
        });

        let delivery = next(&mut subscription).await;
        assert_eq!(delivery.decode().unwrap().batch, batch("late"));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_operations() {
        let channel = declared(5).await;
        let mut subscription = channel.consume(QUEUE, 1).await.unwrap();

        channel.close().await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .unwrap();
        assert!(ended.is_none());

        assert!(channel
            .publish(QUEUE, &batch("M1"))
            .await
            .unwrap_err()
            .is_closed());
        assert!(channel.consume(QUEUE, 1).await.unwrap_err().is_closed());
        channel.close().await.unwrap();
    }
}

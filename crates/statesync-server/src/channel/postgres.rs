//! PostgreSQL-backed message channel
//!
//! Messages are rows in `channel_messages`. A consumer claims one row at a
//! time with `FOR UPDATE SKIP LOCKED`, so any number of consumer processes can
//! share a queue. Acking deletes the row; nacking returns it to `ready` or
//! marks it `dead`. A row left `delivered` longer than the visibility timeout
//! (a consumer that died without settling) is put back to `ready`, or to
//! `dead` when it already reached the queue's delivery limit.
//!
//! Unlike the in-memory broker the queue survives restarts of both sides.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use statesync_common::{
    Batch, ChannelError, ChannelResult, Delivery, DeliveryTag, MessageChannel, QueueOptions,
    Subscription,
};

/// Default wait between claim attempts on an empty queue
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default time a delivery may stay unsettled before it is reclaimed
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PgChannelOptions {
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
}

impl Default for PgChannelOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

/// [`MessageChannel`] over the `channel_queues` / `channel_messages` tables
#[derive(Debug, Clone)]
pub struct PgChannel {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    pool: PgPool,
    options: PgChannelOptions,
    /// Deliveries this process handed out and has not settled
    claims: Mutex<HashMap<DeliveryTag, Claim>>,
    next_tag: AtomicU64,
    closed: CancellationToken,
}

/// Identifies one delivery of a row; a reclaimed row gets a new claim
#[derive(Debug, Clone)]
struct Claim {
    message_id: i64,
    consumer_tag: String,
    delivery_count: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    payload: Vec<u8>,
    delivery_count: i32,
}

fn backend(e: sqlx::Error) -> ChannelError {
    ChannelError::backend(e.to_string())
}

impl PgChannel {
    pub fn new(pool: PgPool, options: PgChannelOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                options,
                claims: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(0),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Messages waiting for delivery on `queue`
    pub async fn ready_count(&self, queue: &str) -> ChannelResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_messages WHERE queue = $1 AND status = 'ready'",
        )
        .bind(queue)
        .fetch_one(&self.shared.pool)
        .await
        .map_err(backend)?;
        Ok(count.max(0) as u64)
    }

    /// Bodies of the messages dead-lettered on `queue`, oldest first
    pub async fn dead_letters(&self, queue: &str) -> ChannelResult<Vec<Vec<u8>>> {
        sqlx::query_scalar(
            r#"
            SELECT payload FROM channel_messages
            WHERE queue = $1 AND status = 'dead'
            ORDER BY dead_at, id
            "#,
        )
        .bind(queue)
        .fetch_all(&self.shared.pool)
        .await
        .map_err(backend)
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

impl Shared {
    fn claims(&self) -> MutexGuard<'_, HashMap<DeliveryTag, Claim>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_claim(&self, tag: DeliveryTag) -> ChannelResult<Claim> {
        self.claims()
            .remove(&tag)
            .ok_or(ChannelError::UnknownDeliveryTag(tag))
    }

    /// Claim the next ready row of `queue` for `consumer_tag`
    async fn claim_next(&self, queue: &str, consumer_tag: &str) -> ChannelResult<Option<Delivery>> {
        let row: Option<ClaimedRow> = sqlx::query_as(
            r#"
            UPDATE channel_messages
            SET status = 'delivered',
                consumer_tag = $2,
                delivery_count = delivery_count + 1,
                delivered_at = NOW()
            WHERE id = (
                SELECT id FROM channel_messages
                WHERE queue = $1 AND status = 'ready'
                ORDER BY requeued_at DESC NULLS LAST, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, delivery_count
            "#,
        )
        .bind(queue)
        .bind(consumer_tag)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tag = DeliveryTag::new(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        self.claims().insert(
            tag,
            Claim {
                message_id: row.id,
                consumer_tag: consumer_tag.to_string(),
                delivery_count: row.delivery_count,
            },
        );

        let delivery_count = u32::try_from(row.delivery_count).unwrap_or(u32::MAX);
        Ok(Some(Delivery {
            tag,
            body: row.payload,
            redelivered: delivery_count > 1,
            delivery_count,
        }))
    }

    /// Put rows whose consumer stopped answering back in the queue, or in the
    /// dead letters once they used up their deliveries
    async fn reclaim_expired(&self, queue: &str) -> ChannelResult<u64> {
        let statuses: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE channel_messages m
            SET status = CASE
                    WHEN m.delivery_count >= q.max_deliveries THEN 'dead'
                    ELSE 'ready'
                END,
                consumer_tag = NULL,
                requeued_at = NOW(),
                dead_at = CASE
                    WHEN m.delivery_count >= q.max_deliveries THEN NOW()
                    ELSE NULL
                END,
                last_error = 'visibility timeout expired'
            FROM channel_queues q
            WHERE m.queue = $1
              AND q.name = m.queue
              AND m.status = 'delivered'
              AND m.delivered_at < NOW() - make_interval(secs => $2)
            RETURNING m.status
            "#,
        )
        .bind(queue)
        .bind(self.options.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let dead = statuses.iter().filter(|s| s.as_str() == "dead").count();
        let reclaimed = statuses.len() - dead;
        if reclaimed > 0 {
            warn!(queue = %queue, reclaimed, "Reclaimed expired deliveries");
        }
        if dead > 0 {
            warn!(queue = %queue, dead, "Expired deliveries dead-lettered");
        }
        Ok(statuses.len() as u64)
    }

    /// Requeue every unsettled delivery of the given consumers
    async fn release(&self, consumer_tags: &[String]) -> ChannelResult<u64> {
        if consumer_tags.is_empty() {
            return Ok(0);
        }

        let (ids, counts): (Vec<i64>, Vec<i32>) = {
            let mut claims = self.claims();
            let tags: Vec<DeliveryTag> = claims
                .iter()
                .filter(|(_, c)| consumer_tags.contains(&c.consumer_tag))
                .map(|(tag, _)| *tag)
                .collect();
            tags.iter()
                .filter_map(|tag| claims.remove(tag))
                .map(|c| (c.message_id, c.delivery_count))
                .unzip()
        };

        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE channel_messages m
            SET status = 'ready',
                consumer_tag = NULL,
                requeued_at = NOW()
            FROM UNNEST($1::BIGINT[], $2::INTEGER[]) AS released (id, delivery_count)
            WHERE m.id = released.id
              AND m.delivery_count = released.delivery_count
              AND m.status = 'delivered'
            "#,
        )
        .bind(&ids)
        .bind(&counts)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MessageChannel for PgChannel {
    async fn declare(&self, queue: &str, options: &QueueOptions) -> ChannelResult<()> {
        self.ensure_open()?;
        let max_deliveries = i32::try_from(options.max_deliveries).unwrap_or(i32::MAX);

        sqlx::query(
            r#"
            INSERT INTO channel_queues (name, durable, max_deliveries)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                durable = EXCLUDED.durable,
                max_deliveries = EXCLUDED.max_deliveries
            "#,
        )
        .bind(queue)
        .bind(options.durable)
        .bind(max_deliveries)
        .execute(&self.shared.pool)
        .await
        .map_err(backend)?;

        debug!(queue = %queue, max_deliveries, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, batch: &Batch) -> ChannelResult<()> {
        self.ensure_open()?;
        let body = batch.to_json_bytes()?;

        let result = sqlx::query(
            r#"
            INSERT INTO channel_messages (queue, payload)
            SELECT name, $2 FROM channel_queues WHERE name = $1
            "#,
        )
        .bind(queue)
        .bind(body)
        .execute(&self.shared.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(ChannelError::QueueNotDeclared(queue.to_string()));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> ChannelResult<Subscription> {
        self.ensure_open()?;

        let declared: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM channel_queues WHERE name = $1)")
                .bind(queue)
                .fetch_one(&self.shared.pool)
                .await
                .map_err(backend)?;
        if !declared {
            return Err(ChannelError::QueueNotDeclared(queue.to_string()));
        }

        let consumer_tag = format!("pg-consumer-{}", Uuid::new_v4());
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
        let claim = self.shared.take_claim(tag)?;

        let result = sqlx::query(
            r#"
            DELETE FROM channel_messages
            WHERE id = $1 AND status = 'delivered' AND delivery_count = $2
            "#,
        )
        .bind(claim.message_id)
        .bind(claim.delivery_count)
        .execute(&self.shared.pool)
        .await
        .map_err(backend)?;

        // Reclaimed after the visibility timeout; someone else owns it now
        if result.rows_affected() == 0 {
            return Err(ChannelError::UnknownDeliveryTag(tag));
        }
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> ChannelResult<()> {
        self.ensure_open()?;
        let claim = self.shared.take_claim(tag)?;

        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE channel_messages m
            SET status = CASE
                    WHEN $3 AND m.delivery_count < q.max_deliveries THEN 'ready'
                    ELSE 'dead'
                END,
                consumer_tag = NULL,
                requeued_at = NOW(),
                dead_at = CASE
                    WHEN $3 AND m.delivery_count < q.max_deliveries THEN NULL
                    ELSE NOW()
                END,
                last_error = CASE WHEN $3 THEN 'rejected' ELSE 'rejected without requeue' END
            FROM channel_queues q
            WHERE m.id = $1
              AND m.delivery_count = $2
              AND m.status = 'delivered'
              AND q.name = m.queue
            RETURNING m.status
            "#,
        )
        .bind(claim.message_id)
        .bind(claim.delivery_count)
        .bind(requeue)
        .fetch_optional(&self.shared.pool)
        .await
        .map_err(backend)?;

        match status.as_deref() {
            None => Err(ChannelError::UnknownDeliveryTag(tag)),
            Some("dead") => {
                warn!(
                    message_id = claim.message_id,
                    tag = %tag,
                    delivery_count = claim.delivery_count,
                    "Message dead-lettered"
                );
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    async fn close(&self) -> ChannelResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.shared.closed.cancel();

        let consumers: Vec<String> = {
            let claims = self.shared.claims();
            let mut tags: Vec<String> = claims.values().map(|c| c.consumer_tag.clone()).collect();
            tags.sort();
            tags.dedup();
            tags
        };
        let released = self.shared.release(&consumers).await?;
        debug!(released, "PostgreSQL channel closed");
        Ok(())
    }
}

/// Claims rows into the subscription buffer, one reserved slot at a time
async fn pump(
    shared: Arc<Shared>,
    queue: String,
    consumer_tag: String,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    let poll_interval = shared.options.poll_interval;

    'outer: loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = loop {
            match shared.claim_next(&queue, &consumer_tag).await {
                Ok(Some(delivery)) => break delivery,
                Ok(None) => {
                    if let Err(e) = shared.reclaim_expired(&queue).await {
                        warn!(queue = %queue, error = %e, "Failed to reclaim expired deliveries");
                    }
                }
                Err(e) => {
                    warn!(queue = %queue, consumer_tag = %consumer_tag, error = %e, "Failed to claim message");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'outer,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        };

        permit.send(delivery);
    }

    match shared.release(std::slice::from_ref(&consumer_tag)).await {
        Ok(released) => debug!(consumer_tag = %consumer_tag, released, "Consumer stopped"),
        Err(e) => warn!(
            consumer_tag = %consumer_tag,
            error = %e,
            "Failed to release unsettled deliveries; they return after the visibility timeout"
        ),
    }
}

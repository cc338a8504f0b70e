//! Pipeline driver
//!
//! Declares the queue and subscribes the consumer, then runs the producer and
//! consumer loops side by side until cancelled. Failing to declare or to
//! subscribe ends the run before any loop starts. Once started, the loops are
//! independent tasks: one failing or panicking is reported but never stops
//! the other. The channel is closed once both have ended.

use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use statesync_common::{ChannelError, MessageChannel, QueueOptions};
use statesync_ingest::{
    BatchProducer, ProducerError, ProducerStats, ScanError, SourceScanner,
};

use crate::channel::open_channel;
use crate::config::Config;
use crate::consumer::{BatchConsumer, ConsumerError, ConsumerStats};
use crate::reconcile::{PgStateStore, ReconciliationEngine};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to declare queue '{queue}': {source}")]
    Declare {
        queue: String,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Subscribe(ConsumerError),

    #[error("Failed to open source directory: {0}")]
    Source(#[from] ScanError),

    #[error("Pipeline has neither a producer nor a consumer")]
    NothingToRun,
}

/// How one loop ended
#[derive(Debug)]
pub enum LoopOutcome<T, E> {
    /// The loop is not part of this process's role
    NotRun,
    Completed(T),
    Failed(E),
    Panicked(String),
}

impl<T, E> LoopOutcome<T, E> {
    pub fn is_failure(&self) -> bool {
        matches!(self, LoopOutcome::Failed(_) | LoopOutcome::Panicked(_))
    }

    pub fn completed(&self) -> Option<&T> {
        match self {
            LoopOutcome::Completed(stats) => Some(stats),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub producer: LoopOutcome<ProducerStats, ProducerError>,
    pub consumer: LoopOutcome<ConsumerStats, ConsumerError>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        !self.producer.is_failure() && !self.consumer.is_failure()
    }
}

pub struct Pipeline {
    channel: Arc<dyn MessageChannel>,
    queue: String,
    queue_options: QueueOptions,
    producer: Option<BatchProducer>,
    consumer: Option<BatchConsumer>,
}

impl Pipeline {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        queue: impl Into<String>,
        queue_options: QueueOptions,
    ) -> Self {
        Self {
            channel,
            queue: queue.into(),
            queue_options,
            producer: None,
            consumer: None,
        }
    }

    pub fn with_producer(mut self, producer: BatchProducer) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn with_consumer(mut self, consumer: BatchConsumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Wire up the loops selected by `config.role` over a PostgreSQL store
    pub async fn from_config(config: &Config, pool: PgPool) -> Result<Self, PipelineError> {
        let channel = open_channel(&config.channel, &pool);
        let mut pipeline = Pipeline::new(
            channel.clone(),
            config.channel.queue.clone(),
            config.channel.queue_options(),
        );

        if config.role.runs_producer() {
            let scanner = SourceScanner::open(
                &config.ingest.directory,
                &config.ingest.extension,
                config.ingest.state_policy.build(),
            )
            .await?;
            pipeline = pipeline.with_producer(BatchProducer::new(
                scanner,
                channel.clone(),
                config.ingest.producer_config(config.channel.queue.clone()),
            ));
        }

        if config.role.runs_consumer() {
            let engine = ReconciliationEngine::new(Arc::new(PgStateStore::new(pool)));
            pipeline = pipeline.with_consumer(BatchConsumer::new(
                channel,
                engine,
                config.consumer.clone(),
            ));
        }

        Ok(pipeline)
    }

    pub fn channel(&self) -> &Arc<dyn MessageChannel> {
        &self.channel
    }

    /// Run until `cancel` fires and both loops have wound down
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineReport, PipelineError> {
        if self.producer.is_none() && self.consumer.is_none() {
            return Err(PipelineError::NothingToRun);
        }

        self.channel
            .declare(&self.queue, &self.queue_options)
            .await
            .map_err(|source| PipelineError::Declare {
                queue: self.queue.clone(),
                source,
            })?;

        // No loop starts unless the consumer is attached
        let consumer = match self.consumer {
            Some(consumer) => match consumer.subscribe().await {
                Ok(subscription) => Some((consumer, subscription)),
                Err(e) => {
                    error!(error = %e, "Consumer failed to subscribe");
                    if let Err(close) = self.channel.close().await {
                        warn!(error = %close, "Failed to close channel");
                    }
                    return Err(PipelineError::Subscribe(e));
                }
            },
            None => None,
        };

        info!(
            queue = %self.queue,
            producer = self.producer.is_some(),
            consumer = consumer.is_some(),
            "Pipeline started"
        );

        let producer = self.producer.map(|producer| {
            let token = cancel.child_token();
            tokio::spawn(async move { producer.run(token).await })
        });
        let consumer = consumer.map(|(consumer, subscription)| {
            let token = cancel.child_token();
            tokio::spawn(async move { consumer.run_with(subscription, token).await })
        });

        let (producer, consumer) = tokio::join!(
            join_loop("producer", producer),
            join_loop("consumer", consumer)
        );

        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close channel");
        }

        let report = PipelineReport { producer, consumer };
        info!(success = report.is_success(), "Pipeline stopped");
        Ok(report)
    }
}

async fn join_loop<T, E: std::fmt::Display>(
    name: &'static str,
    handle: Option<JoinHandle<Result<T, E>>>,
) -> LoopOutcome<T, E> {
    let Some(handle) = handle else {
        return LoopOutcome::NotRun;
    };

    match handle.await {
        Ok(Ok(stats)) => LoopOutcome::Completed(stats),
        Ok(Err(e)) => {
            error!(loop_name = name, error = %e, "Loop failed");
            LoopOutcome::Failed(e)
        }
        Err(e) => {
            error!(loop_name = name, error = %e, "Loop panicked");
            LoopOutcome::Panicked(e.to_string())
        }
    }
}

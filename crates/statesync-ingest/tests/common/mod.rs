//! Shared helpers for ingest integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use statesync_common::{
    Batch, ChannelError, ChannelResult, DeliveryTag, MemoryChannel, MessageChannel, QueueOptions,
    Subscription,
};

pub const QUEUE: &str = "DataProcessorQueue";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,statesync_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Status document with one `<Module>` node per `(key, state)` pair
pub fn status_document(modules: &[(&str, &str)]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<Modules>\n");
    for (key, state) in modules {
        xml.push_str(&format!(
            "  <Module>\n    <ModuleCategoryID>{key}</ModuleCategoryID>\n    <ModuleState>{state}</ModuleState>\n  </Module>\n"
        ));
    }
    xml.push_str("</Modules>\n");
    xml
}

pub fn write_file(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// How [`ScriptedChannel`] answers publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Deliver,
    /// Fail every publish with a backend error
    Fail,
    /// Fail publishes after this many succeeded
    FailAfter(usize),
    /// Report the channel as closed
    Closed,
}

/// Memory broker whose publishes can be made to fail
pub struct ScriptedChannel {
    pub inner: MemoryChannel,
    mode: std::sync::Mutex<PublishMode>,
    pub attempts: AtomicUsize,
    delivered: AtomicUsize,
}

impl ScriptedChannel {
    pub async fn new(mode: PublishMode) -> Arc<Self> {
        let inner = MemoryChannel::new();
        inner.declare(QUEUE, &QueueOptions::default()).await.unwrap();
        Arc::new(Self {
            inner,
            mode: std::sync::Mutex::new(mode),
            attempts: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        })
    }

    pub fn set_mode(&self, mode: PublishMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Decoded bodies waiting in the queue, oldest first
    pub async fn drain(&self) -> Vec<Batch> {
        let ready = self.inner.ready_count(QUEUE);
        let mut batches = Vec::with_capacity(ready);
        if ready == 0 {
            return batches;
        }
        let mut subscription = self.inner.consume(QUEUE, ready).await.unwrap();
        for _ in 0..ready {
            let delivery = tokio::time::timeout(Duration::from_secs(1), subscription.next())
                .await
                .unwrap()
                .unwrap();
            batches.push(delivery.decode().unwrap().batch);
            self.inner.ack(delivery.tag).await.unwrap();
        }
        subscription.close().await;
        batches
    }
}

#[async_trait]
impl MessageChannel for ScriptedChannel {
    async fn declare(&self, queue: &str, options: &QueueOptions) -> ChannelResult<()> {
        self.inner.declare(queue, options).await
    }

    async fn publish(&self, queue: &str, batch: &Batch) -> ChannelResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            PublishMode::Deliver => {}
            PublishMode::Fail => return Err(ChannelError::backend("broker unreachable")),
            PublishMode::FailAfter(n) if self.delivered.load(Ordering::SeqCst) >= n => {
                return Err(ChannelError::backend("broker unreachable"));
            }
            PublishMode::FailAfter(_) => {}
            PublishMode::Closed => return Err(ChannelError::Closed),
        }
        self.inner.publish(queue, batch).await?;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> ChannelResult<Subscription> {
        self.inner.consume(queue, prefetch).await
    }

    async fn ack(&self, tag: DeliveryTag) -> ChannelResult<()> {
        self.inner.ack(tag).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> ChannelResult<()> {
        self.inner.nack(tag, requeue).await
    }

    async fn close(&self) -> ChannelResult<()> {
        self.inner.close().await
    }
}

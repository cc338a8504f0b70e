//! Shared helpers for server integration tests
//!
//! - [`TestStore`]: in-memory store with injectable failures and latency
//! - [`TestPostgres`]: PostgreSQL container with migrations applied (Docker)
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Notify;

use statesync_common::{Batch, ModuleState, StateRecord};
use statesync_server::reconcile::{
    MemoryStateStore, ReconcileError, ReconcileSummary, StateStore, StoredModule,
};

pub const QUEUE: &str = "DataProcessorQueue";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,statesync_server=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn batch(records: &[(&str, ModuleState)]) -> Batch {
    records
        .iter()
        .map(|(key, state)| StateRecord::new(*key, *state).unwrap())
        .collect()
}

/// Status document with one `<Module>` node per `(key, state)` pair
pub fn status_document(modules: &[(&str, &str)]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<Modules>\n");
    for (key, state) in modules {
        xml.push_str(&format!(
            "  <Module><ModuleCategoryID>{key}</ModuleCategoryID><ModuleState>{state}</ModuleState></Module>\n"
        ));
    }
    xml.push_str("</Modules>\n");
    xml
}

pub fn write_file(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Fault-injecting store
// ============================================================================

/// [`MemoryStateStore`] whose batches can be made to fail or to take time
#[derive(Default)]
pub struct TestStore {
    pub inner: MemoryStateStore,
    failures_left: AtomicUsize,
    fail_always: AtomicBool,
    delay: Duration,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Notified whenever a batch starts applying
    pub started: Notify,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` batches
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn always_failing(self) -> Self {
        self.fail_always.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_always_failing(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of batches that were applying at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn state_of(&self, key: &str) -> Option<ModuleState> {
        self.inner.get(key).await.unwrap().map(|m| m.state)
    }

    pub async fn rows(&self) -> u64 {
        self.inner.count().await.unwrap()
    }

    fn should_fail(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StateStore for TestStore {
    async fn apply_batch(
        &self,
        records: &[StateRecord],
    ) -> Result<ReconcileSummary, ReconcileError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.notify_waiters();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if self.should_fail() {
            Err(ReconcileError::store("injected commit failure"))
        } else {
            self.inner.apply_batch(records).await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get(&self, category_key: &str) -> Result<Option<StoredModule>, ReconcileError> {
        self.inner.get(category_key).await
    }

    async fn list(&self) -> Result<Vec<StoredModule>, ReconcileError> {
        self.inner.list().await
    }

    async fn count(&self) -> Result<u64, ReconcileError> {
        self.inner.count().await
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with the workspace migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .context("Failed to get container port")?;

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!(
                "postgresql://postgres:postgres@{}:{}/postgres",
                host, port
            ))
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

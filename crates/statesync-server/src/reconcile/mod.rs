//! Reconciliation of state batches against the module store
//!
//! Each batch is applied as one unit of work: every record is inserted when
//! its category key is new and overwrites the stored state otherwise. Either
//! the whole batch is committed or none of it is.
//!
//! ```no_run
//! use std::sync::Arc;
//! use statesync_common::{Batch, ModuleState, StateRecord};
//! use statesync_server::reconcile::{MemoryStateStore, ReconciliationEngine};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = ReconciliationEngine::new(Arc::new(MemoryStateStore::new()));
//! let batch = Batch::new(vec![StateRecord::new("M1", ModuleState::Online)?]);
//! let summary = engine.reconcile(&batch).await?;
//! assert_eq!(summary.inserted, 1);
//! # Ok(())
//! # }
//! ```

mod memory;
mod postgres;

pub use memory::MemoryStateStore;
pub use postgres::PgStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use statesync_common::{Batch, ModuleState, StateRecord};

/// Reconciliation errors. None of them lets a delivery be acknowledged.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// A stored row that no longer maps to the record model
    #[error("Invalid record '{key}': {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failure of a non-SQL store
    #[error("Store error: {0}")]
    Store(String),
}

impl ReconcileError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}

/// Outcome of one committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Records whose key was not in the store yet
    pub inserted: usize,
    /// Records that overwrote an existing row
    pub updated: usize,
}

impl ReconcileSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// A reconciled row as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredModule {
    pub category_key: String,
    pub state: ModuleState,
    pub updated_at: DateTime<Utc>,
}

/// Persistent keyed storage for module states
///
/// `apply_batch` must be atomic: on error nothing from the batch is visible.
/// Records are applied in order, so the last record for a key wins.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn apply_batch(&self, records: &[StateRecord])
        -> Result<ReconcileSummary, ReconcileError>;

    async fn get(&self, category_key: &str) -> Result<Option<StoredModule>, ReconcileError>;

    /// All rows ordered by category key
    async fn list(&self) -> Result<Vec<StoredModule>, ReconcileError>;

    async fn count(&self) -> Result<u64, ReconcileError>;
}

/// Applies batches to a [`StateStore`]
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn StateStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Upsert every record of the batch in one unit of work
    pub async fn reconcile(&self, batch: &Batch) -> Result<ReconcileSummary, ReconcileError> {
        if batch.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        let summary = self.store.apply_batch(batch.records()).await?;

        tracing::debug!(
            records = batch.len(),
            inserted = summary.inserted,
            updated = summary.updated,
            "Reconciled batch"
        );

        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and never touches storage
    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for CountingStore {
        async fn apply_batch(
            &self,
            records: &[StateRecord],
        ) -> Result<ReconcileSummary, ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReconcileSummary {
                inserted: records.len(),
                updated: 0,
            })
        }

        async fn get(&self, _key: &str) -> Result<Option<StoredModule>, ReconcileError> {
            Ok(None)
        }

        async fn list(&self) -> Result<Vec<StoredModule>, ReconcileError> {
            Ok(Vec::new())
        }

        async fn count(&self) -> Result<u64, ReconcileError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_empty_batch_opens_no_unit_of_work() {
        let store = Arc::new(CountingStore::default());
        let engine = ReconciliationEngine::new(store.clone());

        let summary = engine.reconcile(&Batch::default()).await.unwrap();

        assert_eq!(summary, ReconcileSummary::default());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_is_applied_once() {
        let store = Arc::new(CountingStore::default());
        let engine = ReconciliationEngine::new(store.clone());
        let batch = Batch::new(vec![
            StateRecord::new("M1", ModuleState::Online).unwrap(),
            StateRecord::new("M2", ModuleState::Run).unwrap(),
        ]);

        let summary = engine.reconcile(&batch).await.unwrap();

        assert_eq!(summary.total(), 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}

//! In-process module store

use async_trait::async_trait;
use chrono::Utc;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use statesync_common::StateRecord;

use super::{ReconcileError, ReconcileSummary, StateStore, StoredModule};

/// `BTreeMap` store; a batch is applied under a single lock acquisition
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    rows: Mutex<BTreeMap<String, StoredModule>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<String, StoredModule>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn apply_batch(
        &self,
        records: &[StateRecord],
    ) -> Result<ReconcileSummary, ReconcileError> {
        let mut rows = self.rows();
        let now = Utc::now();
        let mut summary = ReconcileSummary::default();

        for record in records {
            match rows.entry(record.category_key().to_string()) {
                Entry::Vacant(entry) => {
                    entry.insert(StoredModule {
                        category_key: record.category_key().to_string(),
                        state: record.state(),
                        updated_at: now,
                    });
                    summary.inserted += 1;
                }
                Entry::Occupied(mut entry) => {
                    let row = entry.get_mut();
                    row.state = record.state();
                    row.updated_at = now;
                    summary.updated += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn get(&self, category_key: &str) -> Result<Option<StoredModule>, ReconcileError> {
        Ok(self.rows().get(category_key).cloned())
    }

    async fn list(&self) -> Result<Vec<StoredModule>, ReconcileError> {
        Ok(self.rows().values().cloned().collect())
    }

    async fn count(&self) -> Result<u64, ReconcileError> {
        Ok(self.rows().len() as u64)
    }
}

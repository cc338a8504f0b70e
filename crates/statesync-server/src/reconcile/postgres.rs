//! PostgreSQL module store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use statesync_common::{ModuleState, StateRecord};

use super::{ReconcileError, ReconcileSummary, StateStore, StoredModule};

/// `modules` table store; one transaction per batch
#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct ModuleRow {
    module_category_id: String,
    module_state: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ModuleRow> for StoredModule {
    type Error = ReconcileError;

    fn try_from(row: ModuleRow) -> Result<Self, Self::Error> {
        let state = row
            .module_state
            .parse::<ModuleState>()
            .map_err(|e| ReconcileError::InvalidRecord {
                key: row.module_category_id.clone(),
                reason: e.to_string(),
            })?;

        Ok(StoredModule {
            category_key: row.module_category_id,
            state,
            updated_at: row.updated_at,
        })
    }
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn apply_batch(
        &self,
        records: &[StateRecord],
    ) -> Result<ReconcileSummary, ReconcileError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = ReconcileSummary::default();

        // One statement per record: a single multi-row upsert cannot touch
        // the same key twice, and later records must win
        for record in records {
            let inserted: bool = sqlx::query_scalar(
                r#"
                INSERT INTO modules (module_category_id, module_state)
                VALUES ($1, $2)
                ON CONFLICT (module_category_id)
                DO UPDATE SET
                    module_state = EXCLUDED.module_state,
                    updated_at = NOW()
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(record.category_key())
            .bind(record.state().as_str())
            .fetch_one(&mut *tx)
            .await?;

            if inserted {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }

        // Dropping the transaction on an earlier error rolls it back
        tx.commit().await?;

        Ok(summary)
    }

    async fn get(&self, category_key: &str) -> Result<Option<StoredModule>, ReconcileError> {
        let row: Option<ModuleRow> = sqlx::query_as(
            r#"
            SELECT module_category_id, module_state, updated_at
            FROM modules
            WHERE module_category_id = $1
            "#,
        )
        .bind(category_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredModule::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<StoredModule>, ReconcileError> {
        let rows: Vec<ModuleRow> = sqlx::query_as(
            r#"
            SELECT module_category_id, module_state, updated_at
            FROM modules
            ORDER BY module_category_id COLLATE "C"
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredModule::try_from).collect()
    }

    async fn count(&self) -> Result<u64, ReconcileError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM modules")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

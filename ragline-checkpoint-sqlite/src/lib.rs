//! SQLite-backed [`CheckpointStore`].

mod error;
mod ops;
pub mod schema;

use std::str::FromStr;

use async_trait::async_trait;
use ragline_core::{
    Checkpoint, CheckpointMetadata, CheckpointStore, FailureMark, StoreError, WriteDecision,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub use error::SqliteStoreError;

use error::store_error;
use ops::{checkpoint_from_row, failure_from_row, metadata_from_row, step_param};
use schema::{MIGRATION_STATEMENTS_SQL, SELECT_CHECKPOINT_COLUMNS};

#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct SqliteCheckpointStoreBuilder {
    database_url: String,
    max_connections: u32,
    create_if_missing: bool,
}

impl SqliteCheckpointStore {
    pub fn builder(database_url: impl Into<String>) -> SqliteCheckpointStoreBuilder {
        SqliteCheckpointStoreBuilder {
            database_url: database_url.into(),
            max_connections: 1,
            create_if_missing: true,
        }
    }

    /// Wraps an existing pool; the schema must already exist.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl SqliteCheckpointStoreBuilder {
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn create_if_missing(mut self, create_if_missing: bool) -> Self {
        self.create_if_missing = create_if_missing;
        self
    }

    pub async fn build(self) -> Result<SqliteCheckpointStore, SqliteStoreError> {
        let options = SqliteConnectOptions::from_str(&self.database_url)
            .map_err(SqliteStoreError::InvalidUrl)?
            .create_if_missing(self.create_if_missing);
        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(SqliteStoreError::Connection)?;

        for statement in MIGRATION_STATEMENTS_SQL {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(SqliteStoreError::Migration)?;
        }
        tracing::debug!(url = %self.database_url, "sqlite checkpoint store ready");

        Ok(SqliteCheckpointStore { pool })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let step = step_param(checkpoint.step)?;
        let state_blob = checkpoint.state_blob()?;
        let status = checkpoint.status_blob()?;

        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let existing = sqlx::query(&format!(
            "{SELECT_CHECKPOINT_COLUMNS} WHERE run_id = ? AND step = ?"
        ))
        .bind(&checkpoint.run_id)
        .bind(step)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?
        .map(|row| checkpoint_from_row(&row))
        .transpose()?;
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(step) FROM checkpoints WHERE run_id = ?")
                .bind(&checkpoint.run_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(store_error)?;
        let latest = latest.map(|step| step.max(0) as u64);

        if WriteDecision::check(checkpoint, existing.as_ref(), latest)?
            == WriteDecision::AlreadyCommitted
        {
            return Ok(());
        }

        let inserted = sqlx::query(
            "INSERT INTO checkpoints \
             (run_id, step, conversation_id, state_blob, next_node, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.run_id)
        .bind(step)
        .bind(&checkpoint.conversation_id)
        .bind(&state_blob)
        .bind(&checkpoint.next_node)
        .bind(&status)
        .bind(&checkpoint.created_at)
        .execute(&mut *tx)
        .await;
        if let Err(sqlx::Error::Database(db)) = &inserted {
            if db.is_unique_violation() {
                return Err(StoreError::Conflict {
                    run_id: checkpoint.run_id.clone(),
                    step: checkpoint.step,
                });
            }
        }
        inserted.map_err(store_error)?;

        if checkpoint.step == 1 {
            sqlx::query(
                "INSERT INTO conversations (conversation_id, run_id, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(conversation_id) DO UPDATE SET \
                 run_id = excluded.run_id, updated_at = excluded.updated_at",
            )
            .bind(&checkpoint.conversation_id)
            .bind(&checkpoint.run_id)
            .bind(&checkpoint.created_at)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)
    }

    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        sqlx::query(&format!(
            "{SELECT_CHECKPOINT_COLUMNS} WHERE run_id = ? ORDER BY step DESC LIMIT 1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?
        .map(|row| checkpoint_from_row(&row))
        .transpose()
    }

    async fn load_at(&self, run_id: &str, step: u64) -> Result<Option<Checkpoint>, StoreError> {
        sqlx::query(&format!(
            "{SELECT_CHECKPOINT_COLUMNS} WHERE run_id = ? AND step = ?"
        ))
        .bind(run_id)
        .bind(step_param(step)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?
        .map(|row| checkpoint_from_row(&row))
        .transpose()
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let run_id: Option<String> =
            sqlx::query_scalar("SELECT run_id FROM conversations WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;
        match run_id {
            Some(run_id) => self.load_latest(&run_id).await,
            None => Ok(None),
        }
    }

    async fn history(&self, run_id: &str) -> Result<Vec<CheckpointMetadata>, StoreError> {
        sqlx::query(
            "SELECT step, created_at, next_node, status FROM checkpoints \
             WHERE run_id = ? ORDER BY step ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?
        .iter()
        .map(metadata_from_row)
        .collect()
    }

    async fn mark_failed(&self, mark: &FailureMark) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO failures (run_id, step, reason, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(run_id) DO UPDATE SET \
             step = excluded.step, reason = excluded.reason, created_at = excluded.created_at",
        )
        .bind(&mark.run_id)
        .bind(step_param(mark.step)?)
        .bind(&mark.reason)
        .bind(&mark.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn failure(&self, run_id: &str) -> Result<Option<FailureMark>, StoreError> {
        sqlx::query("SELECT run_id, step, reason, created_at FROM failures WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .map(|row| failure_from_row(&row))
            .transpose()
    }

    async fn clear_failure(&self, run_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM failures WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

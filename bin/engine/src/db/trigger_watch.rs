//! Database repository for trigger watches.

use super::{parse_column, parse_id, storage_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::{TriggerWatchId, WorkflowId};
use runwright_trigger::{TriggerWatch, TriggerWatchRepository, WatchConfig, WatchKind, WatchState};
use runwright_workflow::RepositoryError;
use sqlx::{FromRow, PgConnection, PgPool};

/// Row type for watch queries.
#[derive(FromRow)]
struct TriggerWatchRow {
    id: String,
    workflow_id: String,
    user_id: String,
    node_id: String,
    config: serde_json::Value,
    sync_cursor: Option<String>,
    state: String,
    last_polled_at: Option<DateTime<Utc>>,
}

impl TriggerWatchRow {
    fn try_into_watch(self) -> Result<TriggerWatch, RepositoryError> {
        let config: WatchConfig =
            serde_json::from_value(self.config).map_err(|e| RepositoryError::Corrupt {
                message: format!("invalid config on watch '{}': {e}", self.id),
            })?;
        Ok(TriggerWatch {
            id: parse_id(&self.id)?,
            workflow_id: parse_id(&self.workflow_id)?,
            user_id: parse_id(&self.user_id)?,
            node_id: parse_id(&self.node_id)?,
            config,
            sync_cursor: self.sync_cursor,
            state: parse_column("watch state", &self.state, WatchState::parse)?,
            last_polled_at: self.last_polled_at,
        })
    }
}

/// Replaces the watches of a workflow on an open connection.
pub(crate) async fn replace_watches(
    conn: &mut PgConnection,
    workflow_id: WorkflowId,
    watches: &[TriggerWatch],
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM trigger_watches WHERE workflow_id = $1")
        .bind(workflow_id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

    for watch in watches {
        let config = serde_json::to_value(&watch.config).map_err(|e| RepositoryError::Corrupt {
            message: format!("unencodable config on watch '{}': {e}", watch.id),
        })?;
        sqlx::query(
            r#"
            INSERT INTO trigger_watches
                (id, workflow_id, user_id, node_id, kind, config, sync_cursor, state, last_polled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(watch.id.to_string())
        .bind(watch.workflow_id.to_string())
        .bind(watch.user_id.to_string())
        .bind(watch.node_id.to_string())
        .bind(watch.kind().as_str())
        .bind(config)
        .bind(&watch.sync_cursor)
        .bind(watch.state.as_str())
        .bind(watch.last_polled_at)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;
    }
    Ok(())
}

/// Repository for trigger watches.
#[derive(Clone)]
pub struct PgTriggerWatchRepository {
    pool: PgPool,
}

impl PgTriggerWatchRepository {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerWatchRepository for PgTriggerWatchRepository {
    async fn list_active(&self, kind: WatchKind) -> Result<Vec<TriggerWatch>, RepositoryError> {
        let rows: Vec<TriggerWatchRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, user_id, node_id, config, sync_cursor, state, last_polled_at
            FROM trigger_watches
            WHERE kind = $1 AND state <> 'paused'
            ORDER BY id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(TriggerWatchRow::try_into_watch).collect()
    }

    async fn set_state(&self, id: TriggerWatchId, state: WatchState) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE trigger_watches SET state = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "trigger watch",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn save_poll(
        &self,
        id: TriggerWatchId,
        sync_cursor: Option<String>,
        state: WatchState,
        polled_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE trigger_watches
            SET sync_cursor = $2, state = $3, last_polled_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(sync_cursor)
        .bind(state.as_str())
        .bind(polled_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "trigger watch",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn replace_for_workflow(
        &self,
        workflow_id: WorkflowId,
        watches: &[TriggerWatch],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        replace_watches(&mut *tx, workflow_id, watches).await?;
        tx.commit().await.map_err(storage_error)
    }
}

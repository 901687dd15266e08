//! Database repository for workflow runs and node runs.

use super::{parse_column, parse_id, storage_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::{NodeId, NodeRunId, WorkflowId, WorkflowRunId};
use runwright_workflow::{
    NodeRunStatus, RepositoryError, RunRepository, RunStatus, WorkflowNodeRun, WorkflowRun,
};
use sqlx::{FromRow, PgPool};

/// Row type for run queries.
#[derive(FromRow)]
struct WorkflowRunRow {
    id: String,
    workflow_id: String,
    user_id: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRunRow {
    fn try_into_run(self) -> Result<WorkflowRun, RepositoryError> {
        Ok(WorkflowRun {
            id: parse_id(&self.id)?,
            workflow_id: parse_id(&self.workflow_id)?,
            user_id: parse_id(&self.user_id)?,
            status: parse_column("run status", &self.status, RunStatus::parse)?,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

/// Row type for node run queries.
#[derive(FromRow)]
struct NodeRunRow {
    id: String,
    workflow_run_id: String,
    node_id: String,
    status: String,
    retry_count: i32,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl NodeRunRow {
    fn try_into_node_run(self) -> Result<WorkflowNodeRun, RepositoryError> {
        let retry_count = u32::try_from(self.retry_count).map_err(|_| RepositoryError::Corrupt {
            message: format!("negative retry count on node run '{}'", self.id),
        })?;
        Ok(WorkflowNodeRun {
            id: parse_id(&self.id)?,
            workflow_run_id: parse_id(&self.workflow_run_id)?,
            node_id: parse_id(&self.node_id)?,
            status: parse_column("node run status", &self.status, NodeRunStatus::parse)?,
            retry_count,
            error_message: self.error_message,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

const NODE_RUN_COLUMNS: &str = "id, workflow_run_id, node_id, status, retry_count, error_message, started_at, finished_at";

fn node_runs(rows: Vec<NodeRunRow>) -> Result<Vec<WorkflowNodeRun>, RepositoryError> {
    rows.into_iter().map(NodeRunRow::try_into_node_run).collect()
}

/// Repository for runs and node runs.
#[derive(Clone)]
pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lists recent runs of a workflow, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list_by_workflow(
        &self,
        workflow_id: WorkflowId,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows: Vec<WorkflowRunRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, user_id, status, started_at, finished_at
            FROM workflow_runs
            WHERE workflow_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(WorkflowRunRow::try_into_run).collect()
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create_run(
        &self,
        run: &WorkflowRun,
        node_runs: &[WorkflowNodeRun],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, user_id, status, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.user_id.to_string())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        for node_run in node_runs {
            sqlx::query(
                r#"
                INSERT INTO workflow_node_runs
                    (id, workflow_run_id, node_id, status, retry_count, error_message, started_at, finished_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(node_run.id.to_string())
            .bind(node_run.workflow_run_id.to_string())
            .bind(node_run.node_id.to_string())
            .bind(node_run.status.as_str())
            .bind(i32::try_from(node_run.retry_count).unwrap_or(i32::MAX))
            .bind(&node_run.error_message)
            .bind(node_run.started_at)
            .bind(node_run.finished_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        }

        tx.commit().await.map_err(storage_error)
    }

    async fn get_run(&self, run_id: WorkflowRunId) -> Result<WorkflowRun, RepositoryError> {
        let row: Option<WorkflowRunRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, user_id, status, started_at, finished_at
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.ok_or_else(|| RepositoryError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })?
        .try_into_run()
    }

    async fn get_node_run(
        &self,
        run_id: WorkflowRunId,
        node_id: NodeId,
    ) -> Result<WorkflowNodeRun, RepositoryError> {
        let row: Option<NodeRunRow> = sqlx::query_as(&format!(
            "SELECT {NODE_RUN_COLUMNS} FROM workflow_node_runs WHERE workflow_run_id = $1 AND node_id = $2"
        ))
        .bind(run_id.to_string())
        .bind(node_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.ok_or_else(|| RepositoryError::NotFound {
            entity: "node run",
            id: format!("{run_id}/{node_id}"),
        })?
        .try_into_node_run()
    }

    async fn get_child_node_runs(
        &self,
        run_id: WorkflowRunId,
        node_ids: &[NodeId],
    ) -> Result<Vec<WorkflowNodeRun>, RepositoryError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = node_ids.iter().map(ToString::to_string).collect();
        let rows: Vec<NodeRunRow> = sqlx::query_as(&format!(
            "SELECT {NODE_RUN_COLUMNS} FROM workflow_node_runs WHERE workflow_run_id = $1 AND node_id = ANY($2)"
        ))
        .bind(run_id.to_string())
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        node_runs(rows)
    }

    async fn list_node_runs(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Vec<WorkflowNodeRun>, RepositoryError> {
        let rows: Vec<NodeRunRow> = sqlx::query_as(&format!(
            "SELECT {NODE_RUN_COLUMNS} FROM workflow_node_runs WHERE workflow_run_id = $1 ORDER BY id"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        node_runs(rows)
    }

    async fn start_node_run(
        &self,
        node_run_id: NodeRunId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_node_runs
            SET status = 'running', started_at = $2, retry_count = retry_count + 1
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(node_run_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_node_run(&self, node_run_id: NodeRunId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_node_runs
            SET status = 'pending', started_at = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(node_run_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_node_run_status(
        &self,
        node_run_id: NodeRunId,
        status: NodeRunStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let finished_at = status.is_terminal().then_some(now);
        let result = sqlx::query(
            r#"
            UPDATE workflow_node_runs
            SET status = $2, error_message = $3, finished_at = COALESCE($4, finished_at)
            WHERE id = $1
            "#,
        )
        .bind(node_run_id.to_string())
        .bind(status.as_str())
        .bind(error_message)
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "node run",
                id: node_run_id.to_string(),
            });
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: WorkflowRunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, finished_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id.to_string())
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() == 1)
    }
}

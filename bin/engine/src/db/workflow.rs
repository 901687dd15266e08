//! Database repository for workflow graphs.

use super::storage_error;
use super::schedule::replace_schedules;
use super::trigger_watch::replace_watches;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::{UserId, WorkflowId};
use runwright_scheduler::schedules_for_graph;
use runwright_trigger::watches_for_graph;
use runwright_workflow::{GraphRepository, RepositoryError, WorkflowGraph};
use sqlx::PgPool;

/// Repository for workflow graphs.
#[derive(Clone)]
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stores a workflow graph and rebuilds its schedules and trigger watches
    /// from the graph's trigger nodes, in one transaction.
    ///
    /// The graph is stored as given; validate it against the handler registry
    /// before saving.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be encoded or a write fails.
    pub async fn save_workflow(
        &self,
        user_id: UserId,
        name: &str,
        graph: &WorkflowGraph,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let document = serde_json::to_value(graph).map_err(|e| RepositoryError::Corrupt {
            message: format!("unencodable graph for workflow '{}': {e}", graph.id()),
        })?;

        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, user_id, name, graph, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, graph = EXCLUDED.graph, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(graph.id().to_string())
        .bind(user_id.to_string())
        .bind(name)
        .bind(document)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        replace_schedules(&mut *tx, graph.id(), &schedules_for_graph(graph, user_id, now))
            .await
            .map_err(storage_error)?;
        replace_watches(&mut *tx, graph.id(), &watches_for_graph(graph, user_id)).await?;

        tx.commit().await.map_err(storage_error)?;
        tracing::info!(workflow_id = %graph.id(), "Saved workflow");
        Ok(())
    }

    /// Deletes a workflow. Its runs, schedules and watches go with it.
    ///
    /// Returns false if the workflow did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_workflow(&self, workflow_id: WorkflowId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(workflow_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl GraphRepository for PgWorkflowRepository {
    async fn load_graph(&self, workflow_id: WorkflowId) -> Result<WorkflowGraph, RepositoryError> {
        let document: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT graph FROM workflows WHERE id = $1")
                .bind(workflow_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;

        let document = document.ok_or_else(|| RepositoryError::NotFound {
            entity: "workflow",
            id: workflow_id.to_string(),
        })?;

        serde_json::from_value(document).map_err(|e| RepositoryError::Corrupt {
            message: format!("invalid graph for workflow '{workflow_id}': {e}"),
        })
    }
}

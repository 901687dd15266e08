//! Database repository for workflow schedules.

use super::{parse_column, parse_id, storage_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::{ScheduleId, WorkflowId};
use runwright_scheduler::{ScheduleRepository, ScheduleState, WorkflowSchedule};
use runwright_workflow::RepositoryError;
use runwright_workflow::trigger::ScheduleType;
use sqlx::{FromRow, PgConnection, PgPool};
use std::time::Duration;

/// Row type for schedule queries.
#[derive(FromRow)]
struct ScheduleRow {
    id: String,
    workflow_id: String,
    user_id: String,
    node_id: String,
    schedule_type: String,
    starts_at: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    state: String,
    claimed_at: Option<DateTime<Utc>>,
    retrying: bool,
}

impl ScheduleRow {
    fn try_into_schedule(self) -> Result<WorkflowSchedule, RepositoryError> {
        Ok(WorkflowSchedule {
            id: parse_id(&self.id)?,
            workflow_id: parse_id(&self.workflow_id)?,
            user_id: parse_id(&self.user_id)?,
            node_id: parse_id(&self.node_id)?,
            schedule_type: parse_column("schedule type", &self.schedule_type, ScheduleType::parse)?,
            starts_at: self.starts_at,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            state: parse_column("schedule state", &self.state, ScheduleState::parse)?,
            claimed_at: self.claimed_at,
            retrying: self.retrying,
        })
    }
}

/// Replaces the schedules of a workflow on an open connection.
pub(crate) async fn replace_schedules(
    conn: &mut PgConnection,
    workflow_id: WorkflowId,
    schedules: &[WorkflowSchedule],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM workflow_schedules WHERE workflow_id = $1")
        .bind(workflow_id.to_string())
        .execute(&mut *conn)
        .await?;

    for schedule in schedules {
        sqlx::query(
            r#"
            INSERT INTO workflow_schedules
                (id, workflow_id, user_id, node_id, schedule_type, starts_at,
                 next_run_at, last_run_at, state, claimed_at, retrying)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(schedule.id.to_string())
        .bind(schedule.workflow_id.to_string())
        .bind(schedule.user_id.to_string())
        .bind(schedule.node_id.to_string())
        .bind(schedule.schedule_type.as_str())
        .bind(schedule.starts_at)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.state.as_str())
        .bind(schedule.claimed_at)
        .bind(schedule.retrying)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Repository for workflow schedules.
#[derive(Clone)]
pub struct PgScheduleRepository {
    pool: PgPool,
}

impl PgScheduleRepository {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleRepository for PgScheduleRepository {
    async fn get_due_schedules_locked(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_timeout: Duration,
    ) -> Result<Vec<WorkflowSchedule>, RepositoryError> {
        let stale_claim = chrono::Duration::from_std(claim_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        // `due` is evaluated before the update, so RETURNING yields the
        // pre-claim state.
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            WITH due AS (
                SELECT id, workflow_id, user_id, node_id, schedule_type, starts_at,
                       next_run_at, last_run_at, state, claimed_at, retrying
                FROM workflow_schedules
                WHERE next_run_at <= $1
                  AND (state = 'queued'
                       OR (state = 'running' AND (claimed_at IS NULL OR claimed_at < $2)))
                ORDER BY next_run_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_schedules s
            SET state = 'running', claimed_at = $1
            FROM due
            WHERE s.id = due.id
            RETURNING due.*
            "#,
        )
        .bind(now)
        .bind(stale_claim)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let mut schedules = rows
            .into_iter()
            .map(ScheduleRow::try_into_schedule)
            .collect::<Result<Vec<_>, _>>()?;
        schedules.sort_by_key(|s| (s.next_run_at, s.id));
        Ok(schedules)
    }

    async fn update_next_run(
        &self,
        id: ScheduleId,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
        state: ScheduleState,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_schedules
            SET next_run_at = $2, last_run_at = $3, state = $4, claimed_at = NULL, retrying = FALSE
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(next_run_at)
        .bind(last_run_at)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "schedule",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn release_claim(&self, id: ScheduleId) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_schedules
            SET state = 'queued', claimed_at = NULL, retrying = TRUE
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "schedule",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn replace_for_workflow(
        &self,
        workflow_id: WorkflowId,
        schedules: &[WorkflowSchedule],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        replace_schedules(&mut *tx, workflow_id, schedules)
            .await
            .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)
    }
}

//! Schedule persistence contract.

use crate::schedule::{ScheduleState, WorkflowSchedule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::{ScheduleId, WorkflowId};
use runwright_workflow::RepositoryError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Stores workflow schedules.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Fetches up to `limit` due schedules and claims them.
    ///
    /// Claimed schedules are marked `running` with `claimed_at = now` in the
    /// same atomic step, so concurrent schedulers never receive the same
    /// schedule. The returned records carry the state they had *before* the
    /// claim. A `running` schedule whose claim is older than `claim_timeout`
    /// is due again.
    async fn get_due_schedules_locked(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_timeout: Duration,
    ) -> Result<Vec<WorkflowSchedule>, RepositoryError>;

    /// Records the outcome of a dispatch and clears the claim and any retry
    /// marker.
    async fn update_next_run(
        &self,
        id: ScheduleId,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
        state: ScheduleState,
    ) -> Result<(), RepositoryError>;

    /// Returns a claimed schedule to `queued` without touching its run times
    /// and marks it `retrying`, so the next poll dispatches it however late
    /// it has become.
    async fn release_claim(&self, id: ScheduleId) -> Result<(), RepositoryError>;

    /// Replaces every schedule of a workflow.
    async fn replace_for_workflow(
        &self,
        workflow_id: WorkflowId,
        schedules: &[WorkflowSchedule],
    ) -> Result<(), RepositoryError>;
}

/// In-memory schedule store.
#[derive(Debug, Default)]
pub struct InMemoryScheduleRepository {
    schedules: Mutex<HashMap<ScheduleId, WorkflowSchedule>>,
}

impl InMemoryScheduleRepository {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a schedule.
    pub fn insert(&self, schedule: WorkflowSchedule) {
        self.lock().insert(schedule.id, schedule);
    }

    /// Returns a stored schedule.
    #[must_use]
    pub fn get(&self, id: ScheduleId) -> Option<WorkflowSchedule> {
        self.lock().get(&id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ScheduleId, WorkflowSchedule>> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(id: ScheduleId) -> RepositoryError {
    RepositoryError::NotFound {
        entity: "schedule",
        id: id.to_string(),
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn get_due_schedules_locked(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_timeout: Duration,
    ) -> Result<Vec<WorkflowSchedule>, RepositoryError> {
        let mut schedules = self.lock();
        let mut due: Vec<WorkflowSchedule> = schedules
            .values()
            .filter(|s| s.is_due(now, claim_timeout))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_run_at, s.id));
        due.truncate(limit);

        for schedule in &due {
            if let Some(stored) = schedules.get_mut(&schedule.id) {
                stored.state = ScheduleState::Running;
                stored.claimed_at = Some(now);
            }
        }
        Ok(due)
    }

    async fn update_next_run(
        &self,
        id: ScheduleId,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
        state: ScheduleState,
    ) -> Result<(), RepositoryError> {
        let mut schedules = self.lock();
        let schedule = schedules.get_mut(&id).ok_or_else(|| not_found(id))?;
        schedule.next_run_at = next_run_at;
        schedule.last_run_at = last_run_at;
        schedule.state = state;
        schedule.claimed_at = None;
        schedule.retrying = false;
        Ok(())
    }

    async fn release_claim(&self, id: ScheduleId) -> Result<(), RepositoryError> {
        let mut schedules = self.lock();
        let schedule = schedules.get_mut(&id).ok_or_else(|| not_found(id))?;
        schedule.state = ScheduleState::Queued;
        schedule.claimed_at = None;
        schedule.retrying = true;
        Ok(())
    }

    async fn replace_for_workflow(
        &self,
        workflow_id: WorkflowId,
        replacement: &[WorkflowSchedule],
    ) -> Result<(), RepositoryError> {
        let mut schedules = self.lock();
        schedules.retain(|_, s| s.workflow_id != workflow_id);
        for schedule in replacement {
            schedules.insert(schedule.id, schedule.clone());
        }
        Ok(())
    }
}

//! Locked workflow launches.
//!
//! The scheduler and the event pollers never call the orchestrator directly.
//! They go through a `WorkflowLauncher`, which guards each invocation with the
//! `(workflow, user)` run lock so one workflow is not orchestrated twice at
//! the same time for the same user.

use crate::cache::run_lock_key;
use crate::error::LaunchError;
use crate::lock::DistributedLock;
use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use runwright_core::{UserId, WorkflowId, WorkflowRunId};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Default expiry of the run lock.
pub const DEFAULT_RUN_LOCK_TTL: Duration = Duration::from_secs(60);

/// Outcome of a launch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A run was started.
    Started(WorkflowRunId),
    /// Another invocation holds the run lock.
    Busy,
}

/// Starts workflow runs on behalf of a user.
#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    /// Attempts to start a run of `workflow_id`.
    async fn launch(
        &self,
        user_id: UserId,
        workflow_id: WorkflowId,
    ) -> Result<LaunchOutcome, LaunchError>;
}

/// Launcher that wraps the orchestrator in the run lock.
pub struct LockedLauncher {
    orchestrator: Arc<Orchestrator>,
    lock: DistributedLock,
    lock_ttl: Duration,
}

impl LockedLauncher {
    /// Creates a launcher.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, lock: DistributedLock, lock_ttl: Duration) -> Self {
        Self {
            orchestrator,
            lock,
            lock_ttl,
        }
    }
}

#[async_trait]
impl WorkflowLauncher for LockedLauncher {
    #[instrument(skip_all, fields(%workflow_id, %user_id))]
    async fn launch(
        &self,
        user_id: UserId,
        workflow_id: WorkflowId,
    ) -> Result<LaunchOutcome, LaunchError> {
        let lease = self
            .lock
            .acquire(&run_lock_key(workflow_id, user_id), self.lock_ttl)
            .await?;
        if !lease.acquired() {
            tracing::info!("workflow already being launched, skipping");
            return Ok(LaunchOutcome::Busy);
        }

        let result = self.orchestrator.orchestrate(user_id, workflow_id).await;

        if let Err(e) = self.lock.release(&lease).await {
            tracing::warn!(error = %e, "failed to release run lock");
        }

        Ok(LaunchOutcome::Started(result?))
    }
}

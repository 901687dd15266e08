//! Run and node-run records.
//!
//! A `WorkflowRun` is created once per orchestration. One `WorkflowNodeRun`
//! exists per non-root node of the run, pre-created as `pending`; from then on
//! only the executor moves it through `running` to `succeeded` or `failed`.

use chrono::{DateTime, Utc};
use runwright_core::{NodeId, NodeRunId, UserId, WorkflowId, WorkflowRunId};
use serde::{Deserialize, Serialize};

/// The overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nodes may still execute.
    Running,
    /// Every node run succeeded.
    Succeeded,
    /// At least one node run failed.
    Failed,
}

impl RunStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns the string stored for this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    /// Waiting to be picked up.
    Pending,
    /// Claimed by an executor.
    Running,
    /// Handler completed.
    Succeeded,
    /// Handler failed. Descendants stay blocked.
    Failed,
}

impl NodeRunStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns the string stored for this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A record of a single workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    /// The user the run executes on behalf of.
    pub user_id: UserId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Creates a new run in `running` status.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, user_id: UserId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: WorkflowRunId::new(),
            workflow_id,
            user_id,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
        }
    }

    /// Marks the run finished.
    ///
    /// Returns false, leaving the run untouched, if it already finished.
    pub fn complete(&mut self, status: RunStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(now);
        true
    }

    /// Returns the duration of the run, if it has finished.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at)
    }
}

/// Execution record for one node within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowNodeRun {
    pub id: NodeRunId,
    pub workflow_run_id: WorkflowRunId,
    pub node_id: NodeId,
    pub status: NodeRunStatus,
    /// Number of times an executor has started this node.
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowNodeRun {
    /// Creates a new node run in `pending` status.
    #[must_use]
    pub fn new(workflow_run_id: WorkflowRunId, node_id: NodeId) -> Self {
        Self {
            id: NodeRunId::new(),
            workflow_run_id,
            node_id,
            status: NodeRunStatus::Pending,
            retry_count: 0,
            error_message: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves a pending node run to `running`.
    ///
    /// Returns false, leaving the record untouched, if it was not pending.
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != NodeRunStatus::Pending {
            return false;
        }
        self.status = NodeRunStatus::Running;
        self.started_at = Some(now);
        self.retry_count += 1;
        true
    }

    /// Returns a running node run to `pending` so a redelivered task can start
    /// it again. The retry count is kept.
    ///
    /// Returns false, leaving the record untouched, if it was not running.
    pub fn reset(&mut self) -> bool {
        if self.status != NodeRunStatus::Running {
            return false;
        }
        self.status = NodeRunStatus::Pending;
        self.started_at = None;
        true
    }

    /// Records the terminal outcome of the node.
    pub fn finish(&mut self, status: NodeRunStatus, error_message: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error_message = error_message;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_completes_once() {
        let now = Utc::now();
        let mut run = WorkflowRun::new(WorkflowId::new(), UserId::new(), now);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.duration().is_none());

        assert!(run.complete(RunStatus::Failed, now));
        assert!(!run.complete(RunStatus::Succeeded, now));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.duration(), Some(chrono::Duration::zero()));
    }

    #[test]
    fn node_run_starts_only_from_pending() {
        let now = Utc::now();
        let mut node_run = WorkflowNodeRun::new(WorkflowRunId::new(), NodeId::new());

        assert!(node_run.start(now));
        assert_eq!(node_run.status, NodeRunStatus::Running);
        assert_eq!(node_run.retry_count, 1);
        assert_eq!(node_run.started_at, Some(now));

        assert!(!node_run.start(now));
        assert_eq!(node_run.retry_count, 1);
    }

    #[test]
    fn node_run_finish_records_error() {
        let now = Utc::now();
        let mut node_run = WorkflowNodeRun::new(WorkflowRunId::new(), NodeId::new());
        node_run.start(now);
        node_run.finish(NodeRunStatus::Failed, Some("boom".to_string()), now);

        assert_eq!(node_run.status, NodeRunStatus::Failed);
        assert_eq!(node_run.error_message.as_deref(), Some("boom"));
        assert_eq!(node_run.finished_at, Some(now));
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            NodeRunStatus::Pending,
            NodeRunStatus::Running,
            NodeRunStatus::Succeeded,
            NodeRunStatus::Failed,
        ] {
            assert_eq!(NodeRunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("succeeded"), Some(RunStatus::Succeeded));
        assert_eq!(RunStatus::parse("cancelled"), None);
    }
}

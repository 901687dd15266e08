//! Persistence contracts for graphs and runs.
//!
//! The orchestrator and executor only see these traits. Production
//! implementations live with the database access layer; `InMemoryWorkflowStore`
//! backs tests and local runs.

use crate::error::RepositoryError;
use crate::execution::{NodeRunStatus, RunStatus, WorkflowNodeRun, WorkflowRun};
use crate::graph::WorkflowGraph;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runwright_core::{NodeId, NodeRunId, WorkflowId, WorkflowRunId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Loads stored workflow graphs.
#[async_trait]
pub trait GraphRepository: Send + Sync {
    /// Loads the graph of a workflow.
    async fn load_graph(&self, workflow_id: WorkflowId) -> Result<WorkflowGraph, RepositoryError>;
}

/// Stores runs and node runs.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Creates a run together with its pre-created node runs, atomically.
    async fn create_run(
        &self,
        run: &WorkflowRun,
        node_runs: &[WorkflowNodeRun],
    ) -> Result<(), RepositoryError>;

    /// Fetches a run.
    async fn get_run(&self, run_id: WorkflowRunId) -> Result<WorkflowRun, RepositoryError>;

    /// Fetches the node run of `node_id` within `run_id`.
    async fn get_node_run(
        &self,
        run_id: WorkflowRunId,
        node_id: NodeId,
    ) -> Result<WorkflowNodeRun, RepositoryError>;

    /// Fetches the node runs of the given child nodes within `run_id`.
    ///
    /// Nodes without a node run (roots) are left out.
    async fn get_child_node_runs(
        &self,
        run_id: WorkflowRunId,
        node_ids: &[NodeId],
    ) -> Result<Vec<WorkflowNodeRun>, RepositoryError>;

    /// Lists every node run of a run.
    async fn list_node_runs(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Vec<WorkflowNodeRun>, RepositoryError>;

    /// Atomically moves a node run from `pending` to `running`, recording the
    /// start time and incrementing its retry count.
    ///
    /// Returns false if the node run was not pending.
    async fn start_node_run(
        &self,
        node_run_id: NodeRunId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Atomically moves a node run from `running` back to `pending`.
    ///
    /// Returns false if the node run was not running.
    async fn reset_node_run(&self, node_run_id: NodeRunId) -> Result<bool, RepositoryError>;

    /// Records a node run's new status and error message.
    async fn update_node_run_status(
        &self,
        node_run_id: NodeRunId,
        status: NodeRunStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Marks a run finished.
    ///
    /// Returns false if the run had already finished; its status is then
    /// left unchanged.
    async fn complete_run(
        &self,
        run_id: WorkflowRunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[derive(Debug, Default)]
struct StoreState {
    graphs: HashMap<WorkflowId, WorkflowGraph>,
    runs: HashMap<WorkflowRunId, WorkflowRun>,
    node_runs: HashMap<NodeRunId, WorkflowNodeRun>,
    fail_writes: bool,
}

/// In-memory graph and run store.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    state: Mutex<StoreState>,
}

impl InMemoryWorkflowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a graph under its workflow ID.
    pub fn insert_graph(&self, graph: WorkflowGraph) {
        self.lock().graphs.insert(graph.id(), graph);
    }

    /// Makes every following write fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Returns every run of a workflow.
    #[must_use]
    pub fn runs_of(&self, workflow_id: WorkflowId) -> Vec<WorkflowRun> {
        let mut runs: Vec<_> = self
            .lock()
            .runs
            .values()
            .filter(|run| run.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.id);
        runs
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(state: &StoreState) -> Result<(), RepositoryError> {
        if state.fail_writes {
            return Err(RepositoryError::Storage {
                message: "writes disabled".to_string(),
            });
        }
        Ok(())
    }
}

fn node_run_not_found(run_id: WorkflowRunId, node_id: NodeId) -> RepositoryError {
    RepositoryError::NotFound {
        entity: "node run",
        id: format!("{run_id}/{node_id}"),
    }
}

#[async_trait]
impl GraphRepository for InMemoryWorkflowStore {
    async fn load_graph(&self, workflow_id: WorkflowId) -> Result<WorkflowGraph, RepositoryError> {
        self.lock()
            .graphs
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "workflow",
                id: workflow_id.to_string(),
            })
    }
}

#[async_trait]
impl RunRepository for InMemoryWorkflowStore {
    async fn create_run(
        &self,
        run: &WorkflowRun,
        node_runs: &[WorkflowNodeRun],
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        state.runs.insert(run.id, run.clone());
        for node_run in node_runs {
            state.node_runs.insert(node_run.id, node_run.clone());
        }
        Ok(())
    }

    async fn get_run(&self, run_id: WorkflowRunId) -> Result<WorkflowRun, RepositoryError> {
        self.lock()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "run",
                id: run_id.to_string(),
            })
    }

    async fn get_node_run(
        &self,
        run_id: WorkflowRunId,
        node_id: NodeId,
    ) -> Result<WorkflowNodeRun, RepositoryError> {
        self.lock()
            .node_runs
            .values()
            .find(|nr| nr.workflow_run_id == run_id && nr.node_id == node_id)
            .cloned()
            .ok_or_else(|| node_run_not_found(run_id, node_id))
    }

    async fn get_child_node_runs(
        &self,
        run_id: WorkflowRunId,
        node_ids: &[NodeId],
    ) -> Result<Vec<WorkflowNodeRun>, RepositoryError> {
        let state = self.lock();
        Ok(node_ids
            .iter()
            .filter_map(|node_id| {
                state
                    .node_runs
                    .values()
                    .find(|nr| nr.workflow_run_id == run_id && nr.node_id == *node_id)
                    .cloned()
            })
            .collect())
    }

    async fn list_node_runs(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Vec<WorkflowNodeRun>, RepositoryError> {
        let mut node_runs: Vec<_> = self
            .lock()
            .node_runs
            .values()
            .filter(|nr| nr.workflow_run_id == run_id)
            .cloned()
            .collect();
        node_runs.sort_by_key(|nr| nr.id);
        Ok(node_runs)
    }

    async fn start_node_run(
        &self,
        node_run_id: NodeRunId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        let node_run = state
            .node_runs
            .get_mut(&node_run_id)
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "node run",
                id: node_run_id.to_string(),
            })?;
        Ok(node_run.start(now))
    }

    async fn reset_node_run(&self, node_run_id: NodeRunId) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        let node_run = state
            .node_runs
            .get_mut(&node_run_id)
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "node run",
                id: node_run_id.to_string(),
            })?;
        Ok(node_run.reset())
    }

    async fn update_node_run_status(
        &self,
        node_run_id: NodeRunId,
        status: NodeRunStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        let node_run = state
            .node_runs
            .get_mut(&node_run_id)
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "node run",
                id: node_run_id.to_string(),
            })?;
        node_run.finish(status, error_message, now);
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: WorkflowRunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        Self::check_writable(&state)?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "run",
                id: run_id.to_string(),
            })?;
        Ok(run.complete(status, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runwright_core::UserId;

    fn seeded() -> (InMemoryWorkflowStore, WorkflowRun, WorkflowNodeRun) {
        let store = InMemoryWorkflowStore::new();
        let run = WorkflowRun::new(WorkflowId::new(), UserId::new(), Utc::now());
        let node_run = WorkflowNodeRun::new(run.id, NodeId::new());
        (store, run, node_run)
    }

    #[tokio::test]
    async fn create_and_fetch_node_run() {
        let (store, run, node_run) = seeded();
        store
            .create_run(&run, std::slice::from_ref(&node_run))
            .await
            .unwrap();

        let fetched = store.get_node_run(run.id, node_run.node_id).await.unwrap();
        assert_eq!(fetched, node_run);
        assert_eq!(store.runs_of(run.workflow_id), vec![run]);
    }

    #[tokio::test]
    async fn start_is_a_pending_compare_and_set() {
        let (store, run, node_run) = seeded();
        store
            .create_run(&run, std::slice::from_ref(&node_run))
            .await
            .unwrap();

        assert!(store.start_node_run(node_run.id, Utc::now()).await.unwrap());
        assert!(!store.start_node_run(node_run.id, Utc::now()).await.unwrap());

        let fetched = store.get_node_run(run.id, node_run.node_id).await.unwrap();
        assert_eq!(fetched.status, NodeRunStatus::Running);
        assert_eq!(fetched.retry_count, 1);
    }

    #[tokio::test]
    async fn reset_returns_running_node_to_pending() {
        let (store, run, node_run) = seeded();
        store
            .create_run(&run, std::slice::from_ref(&node_run))
            .await
            .unwrap();

        assert!(!store.reset_node_run(node_run.id).await.unwrap());
        store.start_node_run(node_run.id, Utc::now()).await.unwrap();
        assert!(store.reset_node_run(node_run.id).await.unwrap());

        let fetched = store.get_node_run(run.id, node_run.node_id).await.unwrap();
        assert_eq!(fetched.status, NodeRunStatus::Pending);
        assert_eq!(fetched.retry_count, 1);
        assert!(store.start_node_run(node_run.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn child_lookup_skips_unknown_nodes() {
        let (store, run, node_run) = seeded();
        store
            .create_run(&run, std::slice::from_ref(&node_run))
            .await
            .unwrap();

        let children = store
            .get_child_node_runs(run.id, &[node_run.node_id, NodeId::new()])
            .await
            .unwrap();
        assert_eq!(children, vec![node_run]);
    }

    #[tokio::test]
    async fn complete_run_only_once() {
        let (store, run, _) = seeded();
        store.create_run(&run, &[]).await.unwrap();

        assert!(store.complete_run(run.id, RunStatus::Failed, Utc::now()).await.unwrap());
        assert!(!store.complete_run(run.id, RunStatus::Succeeded, Utc::now()).await.unwrap());
        assert_eq!(store.get_run(run.id).await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn missing_graph_is_not_found() {
        let store = InMemoryWorkflowStore::new();
        let result = store.load_graph(WorkflowId::new()).await;
        assert!(matches!(result, Err(RepositoryError::NotFound { entity: "workflow", .. })));
    }

    #[tokio::test]
    async fn failed_writes_leave_no_run() {
        let (store, run, node_run) = seeded();
        store.fail_writes(true);

        assert!(store.create_run(&run, &[node_run]).await.is_err());
        assert!(store.get_run(run.id).await.is_err());
    }
}

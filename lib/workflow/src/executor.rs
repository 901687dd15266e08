//! Task executor.
//!
//! The executor consumes node-execution tasks. For each task it:
//! 1. drops the delivery if the run has already finished
//! 2. drops the delivery if the node run is `running` elsewhere (duplicate)
//! 3. claims the node run (`pending` to `running`)
//! 4. dispatches the node's configuration through the handler registry
//! 5. on success marks the node `succeeded` and enqueues every child whose
//!    node run is still pending and whose parents have all succeeded
//! 6. on failure marks the node `failed` and enqueues nothing below it
//!
//! After each terminal transition the node (and on failure its blocked
//! descendants) leaves the run's running-node set. Once the set is empty the
//! executor confirms from the repository that nothing is left to run and
//! completes the run.
//!
//! Infrastructure failures are returned as errors so the broker redelivers
//! the task; handler failures are recorded and acknowledged. A redelivered
//! task whose node already finished repeats only the follow-up (child
//! enqueue, running-set release, completion), which is safe to repeat because
//! child tasks are deduplicated by node-run ID. If the outcome itself cannot
//! be recorded, the node is returned to `pending` so the redelivery runs it
//! again.

use crate::cache::{SharedCache, running_nodes_key};
use crate::error::{ExecutorError, NodeExecutionError, RepositoryError};
use crate::execution::{NodeRunStatus, RunStatus};
use crate::graph::WorkflowGraph;
use crate::queue::{HandlerError, TaskHandler, TaskQueue};
use crate::registry::{HandlerRegistry, NodeContext};
use crate::repository::{GraphRepository, RunRepository};
use crate::task::TaskMessage;
use async_trait::async_trait;
use chrono::Utc;
use runwright_core::{NodeId, NodeRunId, WorkflowRunId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;

/// What happened to a delivered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The node ran and succeeded.
    Succeeded,
    /// The node ran and failed.
    Failed,
    /// The node had already been started; at most its follow-up was
    /// repeated.
    Duplicate,
    /// The run had already finished; nothing was done.
    RunFinished,
}

/// Executes node tasks.
pub struct Executor {
    graphs: Arc<dyn GraphRepository>,
    runs: Arc<dyn RunRepository>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn SharedCache>,
    registry: Arc<HandlerRegistry>,
}

impl Executor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        graphs: Arc<dyn GraphRepository>,
        runs: Arc<dyn RunRepository>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<dyn SharedCache>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            graphs,
            runs,
            queue,
            cache,
            registry,
        }
    }

    /// Executes one task.
    ///
    /// # Errors
    ///
    /// Returns an error for repository or queue failures; the task should then
    /// be redelivered.
    #[instrument(skip_all, fields(run_id = %task.run_id, node_id = %task.node_id))]
    pub async fn execute(&self, task: &TaskMessage) -> Result<TaskOutcome, ExecutorError> {
        let node_run = self.runs.get_node_run(task.run_id, task.node_id).await?;
        let run = self.runs.get_run(task.run_id).await?;
        if run.status != RunStatus::Running {
            tracing::debug!(status = run.status.as_str(), "run already finished, skipping");
            return Ok(TaskOutcome::RunFinished);
        }

        match node_run.status {
            NodeRunStatus::Pending => {}
            NodeRunStatus::Running => {
                tracing::debug!("node already running, skipping");
                return Ok(TaskOutcome::Duplicate);
            }
            status @ (NodeRunStatus::Succeeded | NodeRunStatus::Failed) => {
                tracing::debug!(
                    status = status.as_str(),
                    "node already finished, repeating follow-up"
                );
                let graph = self.graphs.load_graph(task.workflow_id).await?;
                self.follow_up(&graph, task, status).await?;
                return Ok(TaskOutcome::Duplicate);
            }
        }

        let graph = self.graphs.load_graph(task.workflow_id).await?;
        if !self.runs.start_node_run(node_run.id, Utc::now()).await? {
            tracing::debug!("node run claimed by another delivery, skipping");
            return Ok(TaskOutcome::Duplicate);
        }

        let context = NodeContext {
            user_id: task.user_id,
            workflow_id: task.workflow_id,
            run_id: task.run_id,
            node_id: task.node_id,
            node_run_id: node_run.id,
        };
        let result = match graph.get_node(task.node_id) {
            Some(node) => self.registry.dispatch(&context, &node.config).await,
            None => Err(NodeExecutionError::failed("node is no longer part of the workflow")),
        };

        let (status, error_message) = match result {
            Ok(()) => (NodeRunStatus::Succeeded, None),
            Err(e) => {
                tracing::warn!(error = %e, "node failed");
                (NodeRunStatus::Failed, Some(e.to_string()))
            }
        };
        if let Err(e) = self
            .runs
            .update_node_run_status(node_run.id, status, error_message, Utc::now())
            .await
        {
            self.give_back(node_run.id).await;
            return Err(e.into());
        }

        self.follow_up(&graph, task, status).await?;
        if status == NodeRunStatus::Succeeded {
            tracing::info!("node succeeded");
            Ok(TaskOutcome::Succeeded)
        } else {
            Ok(TaskOutcome::Failed)
        }
    }

    /// Everything that follows a node's terminal transition.
    async fn follow_up(
        &self,
        graph: &WorkflowGraph,
        task: &TaskMessage,
        status: NodeRunStatus,
    ) -> Result<(), ExecutorError> {
        if status == NodeRunStatus::Succeeded {
            self.enqueue_ready_children(graph, task).await?;
            return self.release_nodes(graph, task.run_id, &[task.node_id]).await;
        }
        let mut finished = vec![task.node_id];
        finished.extend(graph.descendants(task.node_id));
        self.release_nodes(graph, task.run_id, &finished).await
    }

    /// Returns a node whose outcome could not be recorded to `pending`.
    async fn give_back(&self, node_run_id: NodeRunId) {
        match self.runs.reset_node_run(node_run_id).await {
            Ok(_) => tracing::warn!("outcome not recorded, node returned to pending"),
            Err(e) => {
                tracing::error!(error = %e, "outcome not recorded and node could not be reset");
            }
        }
    }

    /// Enqueues the children of a succeeded node that are now ready.
    async fn enqueue_ready_children(
        &self,
        graph: &WorkflowGraph,
        task: &TaskMessage,
    ) -> Result<(), ExecutorError> {
        let children = graph.children(task.node_id);
        if children.is_empty() {
            tracing::debug!("leaf node, branch finished");
            return Ok(());
        }

        let child_runs = self.runs.get_child_node_runs(task.run_id, &children).await?;
        for child_run in child_runs {
            if child_run.status != NodeRunStatus::Pending {
                continue;
            }
            if !self.parents_succeeded(graph, task.run_id, child_run.node_id).await? {
                tracing::debug!(child = %child_run.node_id, "child still waiting on other parents");
                continue;
            }
            let child_task = TaskMessage {
                node_id: child_run.node_id,
                node_run_id: child_run.id,
                ..*task
            };
            self.queue.publish_task(&child_task).await?;
            tracing::debug!(child = %child_run.node_id, "enqueued child task");
        }
        Ok(())
    }

    async fn parents_succeeded(
        &self,
        graph: &WorkflowGraph,
        run_id: WorkflowRunId,
        node_id: NodeId,
    ) -> Result<bool, ExecutorError> {
        let parents: Vec<NodeId> = graph
            .parents(node_id)
            .into_iter()
            .filter(|parent| !graph.is_root(*parent))
            .collect();
        if parents.is_empty() {
            return Ok(true);
        }
        let parent_runs = self.runs.get_child_node_runs(run_id, &parents).await?;
        Ok(parent_runs.len() == parents.len()
            && parent_runs
                .iter()
                .all(|nr| nr.status == NodeRunStatus::Succeeded))
    }

    /// Removes finished nodes from the running set and completes the run when
    /// nothing is left.
    async fn release_nodes(
        &self,
        graph: &WorkflowGraph,
        run_id: WorkflowRunId,
        node_ids: &[NodeId],
    ) -> Result<(), ExecutorError> {
        let members: Vec<String> = node_ids.iter().map(ToString::to_string).collect();
        let remaining = match self.cache.set_remove(&running_nodes_key(run_id), &members).await {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::warn!(error = %e, "running-node set unavailable, checking repository");
                None
            }
        };

        match remaining {
            Some(0) | None => self.complete_if_finished(graph, run_id).await,
            Some(left) => {
                tracing::debug!(left, "nodes still running");
                Ok(())
            }
        }
    }

    /// Completes the run if no node is running or able to run.
    async fn complete_if_finished(
        &self,
        graph: &WorkflowGraph,
        run_id: WorkflowRunId,
    ) -> Result<(), ExecutorError> {
        let node_runs = self.runs.list_node_runs(run_id).await?;
        let statuses: HashMap<NodeId, NodeRunStatus> =
            node_runs.iter().map(|nr| (nr.node_id, nr.status)).collect();

        let blocked: HashSet<NodeId> = node_runs
            .iter()
            .filter(|nr| nr.status == NodeRunStatus::Failed)
            .flat_map(|nr| graph.descendants(nr.node_id))
            .collect();

        let outstanding = statuses.iter().any(|(node_id, status)| match status {
            NodeRunStatus::Running => true,
            NodeRunStatus::Pending => !blocked.contains(node_id),
            NodeRunStatus::Succeeded | NodeRunStatus::Failed => false,
        });
        if outstanding {
            return Ok(());
        }

        let failed = statuses.values().any(|s| *s == NodeRunStatus::Failed);
        let status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        if self.runs.complete_run(run_id, status, Utc::now()).await? {
            tracing::info!(status = status.as_str(), "run completed");
            if let Err(e) = self.cache.delete(&running_nodes_key(run_id)).await {
                tracing::warn!(error = %e, "failed to clear running-node set");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for Executor {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let task = match TaskMessage::from_json_bytes(payload) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable task");
                return Ok(());
            }
        };

        match self.execute(&task).await {
            Ok(_) => Ok(()),
            Err(ExecutorError::Repository(RepositoryError::NotFound { entity, id })) => {
                tracing::warn!(run_id = %task.run_id, entity, %id, "dropping task for unknown record");
                Ok(())
            }
            Err(e) => Err(HandlerError::new(e)),
        }
    }
}

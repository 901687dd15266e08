//! Workflow orchestrator.
//!
//! Orchestration turns a stored graph into a started run:
//! 1. load and validate the graph (acyclic, legal node types)
//! 2. create the run with a `pending` node run for every non-root node
//! 3. seed the run's running-node set in the shared cache (best effort)
//! 4. enqueue every child of a root whose parents are all roots
//!
//! From then on the executor drives the run from completion events; there is
//! no precomputed execution order.

use crate::cache::{SharedCache, running_nodes_key};
use crate::error::{GraphError, OrchestratorError};
use crate::execution::{RunStatus, WorkflowNodeRun, WorkflowRun};
use crate::graph::WorkflowGraph;
use crate::registry::HandlerRegistry;
use crate::queue::TaskQueue;
use crate::repository::{GraphRepository, RunRepository};
use crate::task::TaskMessage;
use chrono::Utc;
use runwright_core::{NodeId, UserId, WorkflowId, WorkflowRunId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Default expiry of a run's running-node set.
pub const DEFAULT_RUNNING_SET_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Validates structure and node-type legality of a graph.
///
/// # Errors
///
/// Returns the first structural or legality violation.
pub fn validate_graph(graph: &WorkflowGraph, registry: &HandlerRegistry) -> Result<(), GraphError> {
    graph.validate()?;
    graph.validate_node_types(|action_type| registry.contains(action_type))
}

/// Starts workflow runs.
pub struct Orchestrator {
    graphs: Arc<dyn GraphRepository>,
    runs: Arc<dyn RunRepository>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn SharedCache>,
    registry: Arc<HandlerRegistry>,
    running_set_ttl: Duration,
}

impl Orchestrator {
    /// Creates a new orchestrator.
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
            running_set_ttl: DEFAULT_RUNNING_SET_TTL,
        }
    }

    /// Overrides the expiry of running-node sets.
    #[must_use]
    pub fn with_running_set_ttl(mut self, ttl: Duration) -> Self {
        self.running_set_ttl = ttl;
        self
    }

    /// Starts a new run of `workflow_id` on behalf of `user_id`.
    ///
    /// The run counts as started only when this returns `Ok`: every initial
    /// task has then been accepted by the broker.
    ///
    /// # Errors
    ///
    /// Returns `Validation` (no run created) for an invalid graph, or the
    /// repository or queue failure that aborted the attempt.
    #[instrument(skip_all, fields(%workflow_id, %user_id))]
    pub async fn orchestrate(
        &self,
        user_id: UserId,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowRunId, OrchestratorError> {
        let graph = self.graphs.load_graph(workflow_id).await?;
        validate_graph(&graph, &self.registry).map_err(|source| {
            tracing::warn!(error = %source, "rejecting invalid workflow");
            OrchestratorError::Validation {
                workflow_id,
                source,
            }
        })?;

        let now = Utc::now();
        let run = WorkflowRun::new(workflow_id, user_id, now);
        let node_runs: Vec<WorkflowNodeRun> = graph
            .non_root_nodes()
            .into_iter()
            .map(|node_id| WorkflowNodeRun::new(run.id, node_id))
            .collect();

        self.runs.create_run(&run, &node_runs).await?;

        if node_runs.is_empty() {
            self.runs
                .complete_run(run.id, RunStatus::Succeeded, now)
                .await?;
            tracing::info!(run_id = %run.id, "workflow has no actions, run completed");
            return Ok(run.id);
        }

        self.seed_running_set(run.id, &node_runs).await;

        if let Err(e) = self.enqueue_initial(&graph, &run, &node_runs).await {
            self.abandon(run.id).await;
            return Err(e);
        }

        tracing::info!(run_id = %run.id, nodes = node_runs.len(), "run started");
        Ok(run.id)
    }

    async fn seed_running_set(&self, run_id: WorkflowRunId, node_runs: &[WorkflowNodeRun]) {
        let members: Vec<String> = node_runs.iter().map(|nr| nr.node_id.to_string()).collect();
        if let Err(e) = self
            .cache
            .set_add(&running_nodes_key(run_id), &members, self.running_set_ttl)
            .await
        {
            tracing::warn!(%run_id, error = %e, "failed to seed running-node set");
        }
    }

    async fn enqueue_initial(
        &self,
        graph: &WorkflowGraph,
        run: &WorkflowRun,
        node_runs: &[WorkflowNodeRun],
    ) -> Result<(), OrchestratorError> {
        let by_node: HashMap<NodeId, &WorkflowNodeRun> =
            node_runs.iter().map(|nr| (nr.node_id, nr)).collect();
        let mut enqueued = HashSet::new();

        for root in graph.root_nodes() {
            for child in graph.children(root) {
                if !enqueued.insert(child) {
                    continue;
                }
                if !graph.parents(child).iter().all(|parent| graph.is_root(*parent)) {
                    continue;
                }
                let Some(node_run) = by_node.get(&child) else {
                    continue;
                };
                let task = TaskMessage {
                    user_id: run.user_id,
                    workflow_id: run.workflow_id,
                    run_id: run.id,
                    node_id: child,
                    node_run_id: node_run.id,
                };
                self.queue.publish_task(&task).await?;
                tracing::debug!(run_id = %run.id, node_id = %child, "enqueued initial task");
            }
        }
        Ok(())
    }

    /// Marks a run whose initial tasks could not all be queued as failed.
    async fn abandon(&self, run_id: WorkflowRunId) {
        if let Err(e) = self
            .runs
            .complete_run(run_id, RunStatus::Failed, Utc::now())
            .await
        {
            tracing::error!(%run_id, error = %e, "failed to mark abandoned run as failed");
        }
        if let Err(e) = self.cache.delete(&running_nodes_key(run_id)).await {
            tracing::warn!(%run_id, error = %e, "failed to clear running-node set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::edge::WorkflowEdge;
    use crate::execution::NodeRunStatus;
    use crate::node::{LOG, NodeConfig, WorkflowNode};
    use crate::queue::InMemoryTaskQueue;
    use crate::repository::InMemoryWorkflowStore;

    struct Fixture {
        store: Arc<InMemoryWorkflowStore>,
        queue: Arc<InMemoryTaskQueue>,
        cache: Arc<InMemoryCache>,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let cache = Arc::new(InMemoryCache::new());
        let mut registry = HandlerRegistry::new();
        registry.register(LOG, Arc::new(crate::registry::LogHandler));
        let orchestrator = Orchestrator::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            cache.clone(),
            Arc::new(registry),
        );
        Fixture {
            store,
            queue,
            cache,
            orchestrator,
        }
    }

    fn trigger() -> WorkflowNode {
        WorkflowNode::new("start", NodeConfig::ManualTrigger)
    }

    fn log(name: &str) -> WorkflowNode {
        WorkflowNode::new(
            name,
            NodeConfig::Log {
                message: name.to_string(),
                level: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn fan_out_creates_pending_runs_and_enqueues_children() {
        let f = fixture();
        let (a, b, c) = (trigger(), log("B"), log("C"));
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        let workflow_id = WorkflowId::new();
        f.store.insert_graph(
            WorkflowGraph::from_parts(
                workflow_id,
                vec![a, b, c],
                vec![WorkflowEdge::new(a_id, b_id), WorkflowEdge::new(a_id, c_id)],
            )
            .unwrap(),
        );

        let user_id = UserId::new();
        let run_id = f.orchestrator.orchestrate(user_id, workflow_id).await.unwrap();

        let node_runs = f.store.list_node_runs(run_id).await.unwrap();
        assert_eq!(node_runs.len(), 2);
        assert!(node_runs.iter().all(|nr| nr.status == NodeRunStatus::Pending));

        let tasks = f.queue.published_tasks();
        let enqueued: HashSet<NodeId> = tasks.iter().map(|t| t.node_id).collect();
        assert_eq!(enqueued, HashSet::from([b_id, c_id]));
        assert!(tasks.iter().all(|t| t.run_id == run_id && t.user_id == user_id));

        let mut members = f.cache.members(&running_nodes_key(run_id));
        members.sort();
        let mut expected = vec![b_id.to_string(), c_id.to_string()];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn cycle_creates_no_run() {
        let f = fixture();
        let (a, b, c) = (trigger(), log("B"), log("C"));
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        let workflow_id = WorkflowId::new();
        f.store.insert_graph(
            WorkflowGraph::from_parts(
                workflow_id,
                vec![a, b, c],
                vec![
                    WorkflowEdge::new(a_id, b_id),
                    WorkflowEdge::new(b_id, c_id),
                    WorkflowEdge::new(c_id, b_id),
                ],
            )
            .unwrap(),
        );

        let err = f
            .orchestrator
            .orchestrate(UserId::new(), workflow_id)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Validation {
                source: GraphError::Cycle { .. },
                ..
            }
        ));
        assert!(f.store.runs_of(workflow_id).is_empty());
        assert!(f.queue.published_tasks().is_empty());
    }

    #[tokio::test]
    async fn unregistered_action_is_rejected() {
        let f = fixture();
        let a = trigger();
        let email = WorkflowNode::new(
            "mail",
            NodeConfig::SendEmail {
                to: vec![],
                subject: String::new(),
                body: String::new(),
            },
        );
        let (a_id, email_id) = (a.id, email.id);
        let workflow_id = WorkflowId::new();
        f.store.insert_graph(
            WorkflowGraph::from_parts(
                workflow_id,
                vec![a, email],
                vec![WorkflowEdge::new(a_id, email_id)],
            )
            .unwrap(),
        );

        let err = f
            .orchestrator
            .orchestrate(UserId::new(), workflow_id)
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(f.store.runs_of(workflow_id).is_empty());
    }

    #[tokio::test]
    async fn trigger_only_workflow_completes_immediately() {
        let f = fixture();
        let workflow_id = WorkflowId::new();
        f.store
            .insert_graph(WorkflowGraph::from_parts(workflow_id, vec![trigger()], vec![]).unwrap());

        let run_id = f
            .orchestrator
            .orchestrate(UserId::new(), workflow_id)
            .await
            .unwrap();

        let run = f.store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(f.queue.published_tasks().is_empty());
    }

    #[tokio::test]
    async fn join_child_waits_for_non_root_parent() {
        let f = fixture();
        let (a, b, d) = (trigger(), log("B"), log("D"));
        let (a_id, b_id, d_id) = (a.id, b.id, d.id);
        let workflow_id = WorkflowId::new();
        f.store.insert_graph(
            WorkflowGraph::from_parts(
                workflow_id,
                vec![a, b, d],
                vec![
                    WorkflowEdge::new(a_id, b_id),
                    WorkflowEdge::new(a_id, d_id),
                    WorkflowEdge::new(b_id, d_id),
                ],
            )
            .unwrap(),
        );

        f.orchestrator
            .orchestrate(UserId::new(), workflow_id)
            .await
            .unwrap();

        let enqueued: Vec<NodeId> = f.queue.published_tasks().iter().map(|t| t.node_id).collect();
        assert_eq!(enqueued, vec![b_id]);
    }

    #[tokio::test]
    async fn publish_failure_fails_orchestration() {
        let f = fixture();
        let (a, b) = (trigger(), log("B"));
        let (a_id, b_id) = (a.id, b.id);
        let workflow_id = WorkflowId::new();
        f.store.insert_graph(
            WorkflowGraph::from_parts(workflow_id, vec![a, b], vec![WorkflowEdge::new(a_id, b_id)])
                .unwrap(),
        );
        f.queue.fail_publishes(true);

        let err = f
            .orchestrator
            .orchestrate(UserId::new(), workflow_id)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Queue(_)));
        let runs = f.store.runs_of(workflow_id);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(!f.cache.contains(&running_nodes_key(runs[0].id)));
    }

    #[tokio::test]
    async fn partial_enqueue_abandons_run_and_its_queued_tasks() {
        let f = fixture();
        let (a, b, c) = (trigger(), log("B"), log("C"));
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        let workflow_id = WorkflowId::new();
        f.store.insert_graph(
            WorkflowGraph::from_parts(
                workflow_id,
                vec![a, b, c],
                vec![WorkflowEdge::new(a_id, b_id), WorkflowEdge::new(a_id, c_id)],
            )
            .unwrap(),
        );
        f.queue.fail_publishes_after(1);

        let err = f
            .orchestrator
            .orchestrate(UserId::new(), workflow_id)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Queue(_)));
        let run = f.store.runs_of(workflow_id).remove(0);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(f.queue.pending(), 1);

        let mut registry = HandlerRegistry::new();
        registry.register(LOG, Arc::new(crate::registry::LogHandler));
        let executor = crate::executor::Executor::new(
            f.store.clone(),
            f.store.clone(),
            f.queue.clone(),
            f.cache.clone(),
            Arc::new(registry),
        );
        f.queue.fail_publishes(false);
        assert_eq!(f.queue.drain(&executor, 10).await, 1);

        assert_eq!(f.queue.ack_counts(), (1, 0));
        for node_id in [b_id, c_id] {
            let node_run = f.store.get_node_run(run.id, node_id).await.unwrap();
            assert_eq!(node_run.status, NodeRunStatus::Pending);
        }
        assert_eq!(f.store.get_run(run.id).await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn missing_workflow_is_a_repository_error() {
        let f = fixture();
        let err = f
            .orchestrator
            .orchestrate(UserId::new(), WorkflowId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Repository(_)));
    }
}

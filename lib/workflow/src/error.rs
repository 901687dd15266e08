//! Error types for the workflow crate.
//!
//! Errors are layered:
//! - `GraphError`: graph structure and node legality
//! - `CacheError`, `QueueError`, `RepositoryError`: infrastructure seams
//! - `NodeExecutionError`: business failure of a single node
//! - `OrchestratorError`, `ExecutorError`: the run-level operations, wrapping
//!   lower errors through `From` so `?` propagates them

use runwright_core::{NodeId, WorkflowId};
use std::fmt;

/// Errors from graph construction and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share the same ID.
    DuplicateNode { node_id: NodeId },
    /// An edge references a node that is not part of the graph.
    NodeNotFound { node_id: NodeId },
    /// The graph has no complete topological order. `node_id` sits on a cycle.
    Cycle { node_id: NodeId },
    /// A trigger node has an incoming edge.
    TriggerNotRoot { node_id: NodeId },
    /// A node without incoming edges is not a trigger.
    RootNotTrigger { node_id: NodeId },
    /// No handler is registered for a node's action type.
    UnknownType {
        node_id: NodeId,
        action_type: String,
    },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::Cycle { node_id } => write!(f, "graph contains a cycle through {node_id}"),
            Self::TriggerNotRoot { node_id } => {
                write!(f, "trigger node {node_id} has an incoming edge")
            }
            Self::RootNotTrigger { node_id } => {
                write!(f, "root node {node_id} is not a trigger")
            }
            Self::UnknownType {
                node_id,
                action_type,
            } => write!(f, "node {node_id} has unknown action type '{action_type}'"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from the shared cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache backend could not be reached or rejected the command.
    Unavailable { message: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message } => write!(f, "cache unavailable: {message}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Errors from the task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Connecting to the broker or declaring the topology failed.
    Setup { message: String },
    /// The message could not be encoded.
    Encode { message: String },
    /// The broker did not acknowledge the publish.
    Publish {
        routing_key: String,
        message: String,
    },
    /// Creating the consumer failed.
    Subscribe { queue: String, message: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup { message } => write!(f, "queue setup failed: {message}"),
            Self::Encode { message } => write!(f, "failed to encode task: {message}"),
            Self::Publish {
                routing_key,
                message,
            } => write!(f, "publish to {routing_key} failed: {message}"),
            Self::Subscribe { queue, message } => {
                write!(f, "subscribe to {queue} failed: {message}")
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors from the graph and run repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The requested record does not exist.
    NotFound { entity: &'static str, id: String },
    /// The storage backend failed.
    Storage { message: String },
    /// A stored value could not be decoded.
    Corrupt { message: String },
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Storage { message } => write!(f, "storage error: {message}"),
            Self::Corrupt { message } => write!(f, "corrupt record: {message}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// A node handler's failure. Recorded on the node run; never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeExecutionError {
    /// No handler is registered for the action type.
    UnknownType { action_type: String },
    /// The handler ran and failed.
    Failed { message: String },
}

impl NodeExecutionError {
    /// Creates a `Failed` error from any displayable value.
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType { action_type } => {
                write!(f, "no handler registered for '{action_type}'")
            }
            Self::Failed { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for NodeExecutionError {}

/// Errors from orchestrating a new run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The graph failed validation. No run was created.
    Validation {
        workflow_id: WorkflowId,
        source: GraphError,
    },
    /// Reading or writing run state failed.
    Repository(RepositoryError),
    /// An initial task could not be queued.
    Queue(QueueError),
}

impl OrchestratorError {
    /// Returns true if retrying the same graph cannot succeed.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation {
                workflow_id,
                source,
            } => write!(f, "workflow {workflow_id} is invalid: {source}"),
            Self::Repository(e) => write!(f, "orchestration failed: {e}"),
            Self::Queue(e) => write!(f, "orchestration failed: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Validation { source, .. } => Some(source),
            Self::Repository(e) => Some(e),
            Self::Queue(e) => Some(e),
        }
    }
}

impl From<RepositoryError> for OrchestratorError {
    fn from(e: RepositoryError) -> Self {
        Self::Repository(e)
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

/// Errors from acquiring the run lock and orchestrating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The run lock could not be acquired because the cache failed.
    Lock(CacheError),
    /// The lock was held but orchestration failed.
    Orchestration(OrchestratorError),
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock(e) => write!(f, "failed to acquire run lock: {e}"),
            Self::Orchestration(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Lock(e) => Some(e),
            Self::Orchestration(e) => Some(e),
        }
    }
}

impl From<CacheError> for LaunchError {
    fn from(e: CacheError) -> Self {
        Self::Lock(e)
    }
}

impl From<OrchestratorError> for LaunchError {
    fn from(e: OrchestratorError) -> Self {
        Self::Orchestration(e)
    }
}

/// Infrastructure errors while executing a task. These cause a redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Reading or writing run state failed.
    Repository(RepositoryError),
    /// A child task could not be queued.
    Queue(QueueError),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repository(e) => write!(f, "task execution failed: {e}"),
            Self::Queue(e) => write!(f, "task execution failed: {e}"),
        }
    }
}

impl std::error::Error for ExecutorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Repository(e) => Some(e),
            Self::Queue(e) => Some(e),
        }
    }
}

impl From<RepositoryError> for ExecutorError {
    fn from(e: RepositoryError) -> Self {
        Self::Repository(e)
    }
}

impl From<QueueError> for ExecutorError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let node_id = NodeId::new();
        let err = GraphError::Cycle { node_id };
        assert!(err.to_string().contains("cycle"));
        assert!(err.to_string().contains(&node_id.to_string()));
    }

    #[test]
    fn unknown_type_names_the_action() {
        let err = GraphError::UnknownType {
            node_id: NodeId::new(),
            action_type: "fax".to_string(),
        };
        assert!(err.to_string().contains("'fax'"));
    }

    #[test]
    fn orchestrator_error_wraps_lower_layers() {
        let err: OrchestratorError = QueueError::Publish {
            routing_key: "workflow.tasks.node_execution".to_string(),
            message: "no responders".to_string(),
        }
        .into();
        assert!(!err.is_validation());
        assert!(err.to_string().contains("no responders"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn node_execution_error_shows_message_only() {
        let err = NodeExecutionError::failed("HTTP 500");
        assert_eq!(err.to_string(), "HTTP 500");
    }
}

//! Workflow orchestration and execution engine for runwright.
//!
//! This crate turns a stored workflow graph into a distributed execution:
//!
//! - **Graph Model**: directed acyclic graphs of trigger and action nodes,
//!   backed by petgraph
//! - **Node configuration**: tagged configuration variants per trigger and
//!   action type
//! - **Shared cache and locking**: run locks, event claims and running-node
//!   sets over Redis or an in-memory cache
//! - **Task queue**: at-least-once node-execution tasks over NATS JetStream or
//!   an in-memory queue
//! - **Orchestrator**: validates a graph, creates a run and enqueues the first
//!   tasks
//! - **Executor**: runs one node per task and enqueues its ready children
//! - **Launcher**: the run-locked entry point used by the scheduler and the
//!   event pollers

pub mod cache;
pub mod edge;
pub mod error;
pub mod execution;
pub mod executor;
pub mod graph;
pub mod launcher;
pub mod lock;
pub mod nats;
pub mod node;
pub mod orchestrator;
pub mod queue;
pub mod redis_cache;
pub mod registry;
pub mod repository;
pub mod task;
pub mod trigger;

pub use cache::{InMemoryCache, SharedCache};
pub use edge::WorkflowEdge;
pub use error::{
    CacheError, ExecutorError, GraphError, LaunchError, NodeExecutionError, OrchestratorError,
    QueueError, RepositoryError,
};
pub use execution::{NodeRunStatus, RunStatus, WorkflowNodeRun, WorkflowRun};
pub use executor::{Executor, TaskOutcome};
pub use graph::WorkflowGraph;
pub use launcher::{LaunchOutcome, LockedLauncher, WorkflowLauncher};
pub use lock::{DistributedLock, Lease};
pub use nats::{NatsConfig, NatsTaskQueue};
pub use node::{NodeConfig, WorkflowNode};
pub use orchestrator::Orchestrator;
pub use queue::{HandlerError, InMemoryTaskQueue, TaskHandler, TaskQueue};
pub use redis_cache::RedisCache;
pub use registry::{HandlerRegistry, NodeContext, NodeHandler};
pub use repository::{GraphRepository, InMemoryWorkflowStore, RunRepository};
pub use task::TaskMessage;
pub use trigger::{
    CalendarCondition, CalendarTriggerConfig, EmailTriggerConfig, ScheduleTriggerConfig,
    ScheduleType,
};

//! Edge types for workflow graphs.
//!
//! An edge is a plain dependency: the target node may only run after the
//! source node has succeeded.

use runwright_core::NodeId;
use serde::{Deserialize, Serialize};

/// A dependency edge between two nodes of a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// The upstream node.
    pub source_node_id: NodeId,
    /// The downstream node.
    pub target_node_id: NodeId,
}

impl WorkflowEdge {
    /// Creates a new edge from `source` to `target`.
    #[must_use]
    pub fn new(source_node_id: NodeId, target_node_id: NodeId) -> Self {
        Self {
            source_node_id,
            target_node_id,
        }
    }

    /// Returns true if the edge starts and ends on the same node.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.source_node_id == self.target_node_id
    }
}

//! Workflow graph implementation using petgraph.
//!
//! A workflow is a directed acyclic graph of trigger and action nodes. Edges
//! are plain dependencies: a node may run once every parent has succeeded.
//! Nodes without incoming edges are roots; they are the triggers that start
//! a run and are never executed as tasks themselves.
//!
//! The graph is stored as a JSON document of `{id, nodes, edges}` and rebuilt
//! into a petgraph `DiGraph` on load, rejecting duplicate node IDs and edges
//! that name unknown nodes.

use crate::edge::WorkflowEdge;
use crate::error::GraphError;
use crate::node::WorkflowNode;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use runwright_core::{NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// A workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "GraphDocument", into = "GraphDocument")]
pub struct WorkflowGraph {
    id: WorkflowId,
    graph: DiGraph<WorkflowNode, ()>,
    node_index_map: HashMap<NodeId, NodeIndex>,
}

/// Serialized form of a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub id: WorkflowId,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowGraph {
    /// Creates a new empty graph for the given workflow.
    #[must_use]
    pub fn new(id: WorkflowId) -> Self {
        Self {
            id,
            graph: DiGraph::new(),
            node_index_map: HashMap::new(),
        }
    }

    /// Builds a graph from its nodes and edges.
    ///
    /// # Errors
    ///
    /// Returns an error if two nodes share an ID or an edge names a node
    /// that is not in `nodes`.
    pub fn from_parts(
        id: WorkflowId,
        nodes: Vec<WorkflowNode>,
        edges: Vec<WorkflowEdge>,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new(id);
        for node in nodes {
            graph.add_node(node)?;
        }
        for edge in edges {
            graph.add_edge(edge.source_node_id, edge.target_node_id)?;
        }
        Ok(graph)
    }

    /// Returns the workflow this graph belongs to.
    #[must_use]
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    /// Adds a node to the graph.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode` if a node with the same ID already exists.
    pub fn add_node(&mut self, node: WorkflowNode) -> Result<NodeId, GraphError> {
        let node_id = node.id;
        if self.node_index_map.contains_key(&node_id) {
            return Err(GraphError::DuplicateNode { node_id });
        }
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        Ok(node_id)
    }

    /// Adds a dependency edge. Adding the same edge twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if either endpoint is not in the graph.
    pub fn add_edge(&mut self, source_id: NodeId, target_id: NodeId) -> Result<(), GraphError> {
        let source = self.index_of(source_id)?;
        let target = self.index_of(target_id)?;
        self.graph.update_edge(source, target, ());
        Ok(())
    }

    /// Returns a node by its ID.
    #[must_use]
    pub fn get_node(&self, node_id: NodeId) -> Option<&WorkflowNode> {
        let index = self.node_index_map.get(&node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns all nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.graph.node_weights()
    }

    /// Returns all edges in insertion order.
    #[must_use]
    pub fn edges(&self) -> Vec<WorkflowEdge> {
        self.graph
            .edge_references()
            .map(|edge| WorkflowEdge::new(self.graph[edge.source()].id, self.graph[edge.target()].id))
            .collect()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the IDs of nodes with no incoming edge, in insertion order.
    #[must_use]
    pub fn root_nodes(&self) -> Vec<NodeId> {
        let targets: HashSet<NodeIndex> = self
            .graph
            .edge_references()
            .map(|edge| edge.target())
            .collect();

        self.graph
            .node_indices()
            .filter(|index| !targets.contains(index))
            .map(|index| self.graph[index].id)
            .collect()
    }

    /// Returns the IDs of every node that has at least one incoming edge.
    #[must_use]
    pub fn non_root_nodes(&self) -> Vec<NodeId> {
        let roots: HashSet<NodeId> = self.root_nodes().into_iter().collect();
        self.nodes()
            .map(|node| node.id)
            .filter(|id| !roots.contains(id))
            .collect()
    }

    /// Returns the direct children of a node, in insertion order.
    ///
    /// Unknown nodes have no children.
    #[must_use]
    pub fn children(&self, node_id: NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    /// Returns the direct parents of a node, in insertion order.
    #[must_use]
    pub fn parents(&self, node_id: NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Returns every node reachable from `node_id`, excluding itself.
    #[must_use]
    pub fn descendants(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<NodeId> = self.children(node_id).into();

        while let Some(next) = queue.pop_front() {
            if next == node_id || !seen.insert(next) {
                continue;
            }
            order.push(next);
            queue.extend(self.children(next));
        }
        order
    }

    /// Returns true if `node_id` is a root.
    #[must_use]
    pub fn is_root(&self, node_id: NodeId) -> bool {
        self.node_index_map
            .get(&node_id)
            .is_some_and(|index| {
                self.graph
                    .edges_directed(*index, Direction::Incoming)
                    .next()
                    .is_none()
            })
    }

    /// Checks that the graph has a complete topological order.
    ///
    /// # Errors
    ///
    /// Returns `Cycle` naming a node on the cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        if let Some(edge) = self.edges().into_iter().find(WorkflowEdge::is_self_loop) {
            return Err(GraphError::Cycle {
                node_id: edge.source_node_id,
            });
        }

        petgraph::algo::toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|cycle| GraphError::Cycle {
                node_id: self.graph[cycle.node_id()].id,
            })
    }

    /// Checks node-type legality.
    ///
    /// Triggers must be roots and every root must be a trigger. Every action
    /// node must have a handler according to `is_registered`.
    ///
    /// # Errors
    ///
    /// Returns the first violation found, in node insertion order.
    pub fn validate_node_types(
        &self,
        is_registered: impl Fn(&str) -> bool,
    ) -> Result<(), GraphError> {
        for node in self.nodes() {
            let root = self.is_root(node.id);
            match (node.is_trigger(), root) {
                (true, false) => return Err(GraphError::TriggerNotRoot { node_id: node.id }),
                (false, true) => return Err(GraphError::RootNotTrigger { node_id: node.id }),
                (true, true) => {}
                (false, false) => {
                    if !is_registered(node.action_type()) {
                        return Err(GraphError::UnknownType {
                            node_id: node.id,
                            action_type: node.action_type().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn index_of(&self, node_id: NodeId) -> Result<NodeIndex, GraphError> {
        self.node_index_map
            .get(&node_id)
            .copied()
            .ok_or(GraphError::NodeNotFound { node_id })
    }

    fn neighbors(&self, node_id: NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(&index) = self.node_index_map.get(&node_id) else {
            return Vec::new();
        };

        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        neighbors.sort_unstable();
        neighbors.dedup();
        neighbors.into_iter().map(|n| self.graph[n].id).collect()
    }
}

impl TryFrom<GraphDocument> for WorkflowGraph {
    type Error = GraphError;

    fn try_from(document: GraphDocument) -> Result<Self, Self::Error> {
        Self::from_parts(document.id, document.nodes, document.edges)
    }
}

impl From<WorkflowGraph> for GraphDocument {
    fn from(graph: WorkflowGraph) -> Self {
        let edges = graph.edges();
        let (nodes, _) = graph.graph.into_nodes_edges();
        Self {
            id: graph.id,
            nodes: nodes.into_iter().map(|node| node.weight).collect(),
            edges,
        }
    }
}

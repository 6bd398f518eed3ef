//! The scheduling graph: an immutable directed acyclic graph of opaque nodes.
//!
//! An edge `a -> b` means `b` depends on `a`.  So a node's incoming edges
//! lead to its dependencies and its outgoing edges lead to its dependents.
//! Nodes carry no payload; callers keep their own `DenseMap` keyed by
//! `NodeId` for that.

use crate::densemap::{dense_id, DenseMap, Index};
use std::collections::VecDeque;

dense_id!(
    /// Handle to a node in a `DirectedGraph`.
    NodeId
);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("dependency cycle through {0} nodes, e.g. {1:?}")]
    Cycle(usize, NodeId),
}

/// Read-only view of a graph, as consumed by traversal and analysis.
pub trait DirectedGraph: Sync {
    fn node_count(&self) -> usize;

    /// Edges pointing at `node`, i.e. its direct dependencies.
    fn incoming_edges(&self, node: NodeId) -> &[NodeId];

    /// Edges leaving `node`, i.e. its direct dependents.
    fn outgoing_edges(&self, node: NodeId) -> &[NodeId];

    fn is_valid(&self, node: NodeId) -> bool {
        node.index() < self.node_count()
    }

    fn nodes(&self) -> Box<dyn Iterator<Item = NodeId> + '_> {
        Box::new((0..self.node_count()).map(NodeId::from))
    }
}

#[derive(Debug, Default, Clone)]
struct NodeEdges {
    incoming: Vec<NodeId>,
    outgoing: Vec<NodeId>,
}

/// Arena-backed graph.  Only constructed through `GraphBuilder::seal`, so it
/// is known to be acyclic.
#[derive(Debug, Default)]
pub struct DenseGraph {
    nodes: DenseMap<NodeId, NodeEdges>,
    edge_count: usize,
}

impl DenseGraph {
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Nodes ordered so that every node appears after all its dependencies.
    pub fn topological_order(&self) -> Vec<NodeId> {
        // seal() already proved there is no cycle, so this always completes.
        kahn_order(&self.nodes).0
    }

    /// Nodes without dependencies.
    pub fn sources(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, edges)| edges.incoming.is_empty())
            .map(|(id, _)| id)
    }

    /// Nodes without dependents.
    pub fn sinks(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, edges)| edges.outgoing.is_empty())
            .map(|(id, _)| id)
    }
}

impl DirectedGraph for DenseGraph {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn incoming_edges(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].incoming
    }

    fn outgoing_edges(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].outgoing
    }
}

/// Returns the topological order and the number of nodes left over because
/// they sit on (or behind) a cycle.
fn kahn_order(nodes: &DenseMap<NodeId, NodeEdges>) -> (Vec<NodeId>, usize) {
    let mut pending: Vec<usize> = nodes.iter().map(|(_, e)| e.incoming.len()).collect();
    let mut ready: VecDeque<NodeId> = nodes
        .iter()
        .filter(|(_, e)| e.incoming.is_empty())
        .map(|(id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for &out in &nodes[id].outgoing {
            pending[out.index()] -= 1;
            if pending[out.index()] == 0 {
                ready.push_back(out);
            }
        }
    }
    let stuck = nodes.len() - order.len();
    (order, stuck)
}

/// Accumulates nodes and edges, then freezes them into a `DenseGraph`.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: DenseMap<NodeId, NodeEdges>,
    edge_count: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder::default()
    }

    pub fn add_node(&mut self) -> NodeId {
        self.nodes.push(NodeEdges::default())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Adds `dependency -> dependent`.  Returns false if the edge already
    /// existed.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) -> Result<bool, GraphError> {
        for id in [dependency, dependent] {
            if self.nodes.lookup(id).is_none() {
                return Err(GraphError::UnknownNode(id));
            }
        }
        if self.nodes[dependency].outgoing.contains(&dependent) {
            return Ok(false);
        }
        self.nodes[dependency].outgoing.push(dependent);
        self.nodes[dependent].incoming.push(dependency);
        self.edge_count += 1;
        Ok(true)
    }

    pub fn seal(self) -> Result<DenseGraph, GraphError> {
        let (order, stuck) = kahn_order(&self.nodes);
        if stuck > 0 {
            let mut on_cycle = vec![false; self.nodes.len()];
            for id in &order {
                on_cycle[id.index()] = true;
            }
            let witness = on_cycle.iter().position(|&done| !done).unwrap_or(0);
            return Err(GraphError::Cycle(stuck, NodeId::from(witness)));
        }
        Ok(DenseGraph {
            nodes: self.nodes,
            edge_count: self.edge_count,
        })
    }
}

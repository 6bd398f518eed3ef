//! Breadth-first transitive closure over a `DirectedGraph`.
//!
//! The scheduler uses these to compute what to invalidate or skip: e.g. all
//! dependents of a pip whose output changed, stopping at dependents that are
//! already known to be dirty.

use crate::densemap::Index;
use crate::graph::{DirectedGraph, NodeId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Records which nodes one traversal has seen.  Marking is atomic, but a
/// tracker is meant to be owned by a single traversal at a time.
pub struct VisitationTracker {
    bits: Vec<AtomicU64>,
    node_count: usize,
}

impl VisitationTracker {
    pub fn new(graph: &(impl DirectedGraph + ?Sized)) -> Self {
        Self::with_node_count(graph.node_count())
    }

    pub fn with_node_count(node_count: usize) -> Self {
        let words = (node_count + 63) / 64;
        VisitationTracker {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            node_count,
        }
    }

    fn slot(&self, node: NodeId) -> (&AtomicU64, u64) {
        let i = node.index();
        assert!(
            i < self.node_count,
            "node {:?} outside tracker of {} nodes",
            node,
            self.node_count
        );
        (&self.bits[i / 64], 1u64 << (i % 64))
    }

    /// Marks `node` visited.  Returns true if it was not visited before.
    pub fn mark_visited(&self, node: NodeId) -> bool {
        let (word, mask) = self.slot(node);
        word.fetch_or(mask, Ordering::Relaxed) & mask == 0
    }

    pub fn was_visited(&self, node: NodeId) -> bool {
        let (word, mask) = self.slot(node);
        word.load(Ordering::Relaxed) & mask != 0
    }

    pub fn visited_count(&self) -> usize {
        self.bits
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn visited_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.node_count)
            .map(NodeId::from)
            .filter(move |&id| self.was_visited(id))
    }

    pub fn clear(&self) {
        for w in &self.bits {
            w.store(0, Ordering::Relaxed);
        }
    }
}

/// Queues handed out to traversals, kept around to avoid reallocating them
/// for every call.
static QUEUE_POOL: Mutex<Vec<VecDeque<NodeId>>> = Mutex::new(Vec::new());

/// Upper bound on idle queues kept in the pool.
const MAX_POOLED_QUEUES: usize = 32;

struct PooledQueue(VecDeque<NodeId>);

impl PooledQueue {
    fn get() -> Self {
        let queue = QUEUE_POOL
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_default();
        PooledQueue(queue)
    }
}

impl Drop for PooledQueue {
    fn drop(&mut self) {
        let mut queue = std::mem::take(&mut self.0);
        queue.clear();
        if let Ok(mut pool) = QUEUE_POOL.lock() {
            if pool.len() < MAX_POOLED_QUEUES {
                pool.push(queue);
            }
        }
    }
}

/// A direction predicate: return false to stop expanding past a node.
pub type Predicate<'a> = &'a dyn Fn(NodeId) -> bool;

fn always(_: NodeId) -> bool {
    true
}

/// Visits nodes reachable from a start set.  Holds only a shared borrow of
/// the graph, so any number of visitors may run concurrently as long as
/// each uses its own `VisitationTracker`.
pub struct NodeVisitor<'g, G: DirectedGraph + ?Sized> {
    graph: &'g G,
}

impl<'g, G: DirectedGraph + ?Sized> NodeVisitor<'g, G> {
    pub fn new(graph: &'g G) -> Self {
        NodeVisitor { graph }
    }

    /// Expands along incoming edges when `visit_dependencies` allows it and
    /// along outgoing edges when `visit_dependents` allows it.  A missing
    /// predicate means the direction is always expanded.
    pub fn visit_transitive_reachable_nodes(
        &self,
        starts: impl IntoIterator<Item = NodeId>,
        tracker: &VisitationTracker,
        visit_dependencies: Option<Predicate>,
        visit_dependents: Option<Predicate>,
    ) {
        self.visit(
            starts,
            tracker,
            Some(visit_dependencies.unwrap_or(&always)),
            Some(visit_dependents.unwrap_or(&always)),
        )
    }

    pub fn visit_transitive_dependencies(
        &self,
        starts: impl IntoIterator<Item = NodeId>,
        tracker: &VisitationTracker,
        visit: impl Fn(NodeId) -> bool,
    ) {
        self.visit(starts, tracker, Some(&visit as Predicate), None)
    }

    pub fn visit_transitive_dependents(
        &self,
        starts: impl IntoIterator<Item = NodeId>,
        tracker: &VisitationTracker,
        visit: impl Fn(NodeId) -> bool,
    ) {
        self.visit(starts, tracker, None, Some(&visit as Predicate))
    }

    /// Returns true if `candidate` is reachable from `node` by following
    /// incoming edges.  A node is not its own dependency.
    pub fn is_transitive_dependency(&self, node: NodeId, candidate: NodeId) -> bool {
        if node == candidate {
            return false;
        }
        let tracker = VisitationTracker::new(self.graph);
        let found = std::cell::Cell::new(false);
        self.visit_transitive_dependencies(std::iter::once(node), &tracker, |id| {
            if id == candidate {
                found.set(true);
            }
            !found.get()
        });
        found.get() || tracker.was_visited(candidate)
    }

    /// Core loop.  `None` for a direction means that direction is never
    /// expanded.
    fn visit(
        &self,
        starts: impl IntoIterator<Item = NodeId>,
        tracker: &VisitationTracker,
        dependencies: Option<Predicate>,
        dependents: Option<Predicate>,
    ) {
        let mut queue = PooledQueue::get();
        for start in starts {
            if tracker.mark_visited(start) {
                queue.0.push_back(start);
            }
        }

        while let Some(node) = queue.0.pop_front() {
            if let Some(pred) = dependencies {
                if pred(node) {
                    for &dep in self.graph.incoming_edges(node) {
                        if tracker.mark_visited(dep) {
                            queue.0.push_back(dep);
                        }
                    }
                }
            }
            if let Some(pred) = dependents {
                if pred(node) {
                    for &dep in self.graph.outgoing_edges(node) {
                        if tracker.mark_visited(dep) {
                            queue.0.push_back(dep);
                        }
                    }
                }
            }
        }
    }
}

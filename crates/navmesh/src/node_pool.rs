//! Node pool and open list for pathfinding
//!
//! The pool hands out search nodes keyed by polygon reference from a fixed
//! budget. Nodes live in one vector and are chained per hash bucket, so a
//! search never allocates once the pool is built.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use glam::Vec3;

use super::PolyRef;

bitflags::bitflags! {
    /// Search state of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const OPEN = 0x01;
        const CLOSED = 0x02;
    }
}

/// Node in the pathfinding graph
#[derive(Debug, Clone)]
pub struct Node {
    /// Position the search reached the polygon at
    pub pos: Vec3,
    /// Cost from the start to this node
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    /// Pool index of the parent node
    pub parent: Option<usize>,
    pub flags: NodeFlags,
    /// Polygon the node corresponds to
    pub id: PolyRef,
}

impl Node {
    fn new(id: PolyRef) -> Self {
        Self {
            pos: Vec3::ZERO,
            cost: 0.0,
            total: 0.0,
            parent: None,
            flags: NodeFlags::empty(),
            id,
        }
    }
}

/// Fixed-capacity node storage with hash lookup by polygon reference
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    /// First node index for each hash bucket
    first: Vec<Option<usize>>,
    /// Next node index in the hash chain
    next: Vec<Option<usize>>,
    max_nodes: usize,
}

impl NodePool {
    /// Creates a pool holding at most `max_nodes` nodes
    pub fn new(max_nodes: usize) -> Self {
        let hash_size = nav_common::next_pow2((max_nodes / 4).max(1) as u32) as usize;
        Self {
            nodes: Vec::with_capacity(max_nodes),
            first: vec![None; hash_size],
            next: Vec::with_capacity(max_nodes),
            max_nodes,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.next.clear();
        self.first.fill(None);
    }

    /// Index of the node for `id`, allocating it if needed.
    ///
    /// Returns `None` once the budget is spent.
    pub fn get_node(&mut self, id: PolyRef) -> Option<usize> {
        if let Some(idx) = self.find_node(id) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }

        let idx = self.nodes.len();
        let bucket = self.bucket(id);
        self.nodes.push(Node::new(id));
        self.next.push(self.first[bucket]);
        self.first[bucket] = Some(idx);
        Some(idx)
    }

    /// Index of the node for `id` if one was allocated
    pub fn find_node(&self, id: PolyRef) -> Option<usize> {
        let mut cur = self.first[self.bucket(id)];
        while let Some(idx) = cur {
            if self.nodes[idx].id == id {
                return Some(idx);
            }
            cur = self.next[idx];
        }
        None
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Number of nodes handed out since the last clear
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn bucket(&self, id: PolyRef) -> usize {
        let a = id.id();
        ((a ^ (a >> 16) ^ (a >> 32)) as usize) & (self.first.len() - 1)
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    total: f32,
    node: usize,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed so the max-heap pops the cheapest entry first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .total
            .total_cmp(&self.total)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Open list ordered by node total cost.
///
/// Updating a node pushes a fresh entry; entries whose cost no longer
/// matches the node are dropped when popped.
#[derive(Debug, Default)]
pub struct NodeQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl NodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Queues a node with its current total cost
    pub fn push(&mut self, pool: &NodePool, node: usize) {
        self.heap.push(QueueEntry {
            total: pool.node(node).total,
            node,
        });
    }

    /// Pops the cheapest node that is still open
    pub fn pop(&mut self, pool: &NodePool) -> Option<usize> {
        while let Some(entry) = self.heap.pop() {
            let node = pool.node(entry.node);
            if node.flags.contains(NodeFlags::OPEN) && node.total == entry.total {
                return Some(entry.node);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_pool() {
        let mut pool = NodePool::new(16);

        let poly1 = PolyRef::new(1);
        let idx = pool.get_node(poly1).unwrap();
        assert_eq!(pool.node(idx).id, poly1);
        assert_eq!(pool.find_node(poly1), Some(idx));
        assert_eq!(pool.get_node(poly1), Some(idx));
        assert_eq!(pool.find_node(PolyRef::new(2)), None);
        assert_eq!(pool.node_count(), 1);

        pool.clear();
        assert_eq!(pool.find_node(poly1), None);
    }

    #[test]
    fn test_node_pool_budget() {
        let mut pool = NodePool::new(3);
        for i in 1..=3 {
            assert!(pool.get_node(PolyRef::new(i)).is_some());
        }
        assert!(pool.get_node(PolyRef::new(4)).is_none());
        // Existing nodes are still reachable
        assert!(pool.get_node(PolyRef::new(2)).is_some());
    }

    #[test]
    fn test_node_queue() {
        let mut pool = NodePool::new(16);
        let mut queue = NodeQueue::new();

        for (id, total) in [(1, 5.0), (2, 3.0), (3, 7.0)] {
            let idx = pool.get_node(PolyRef::new(id)).unwrap();
            let node = pool.node_mut(idx);
            node.total = total;
            node.flags = NodeFlags::OPEN;
            queue.push(&pool, idx);
        }

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop(&pool))
            .map(|idx| pool.node(idx).id.id())
            .collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_node_queue_skips_stale_entries() {
        let mut pool = NodePool::new(16);
        let mut queue = NodeQueue::new();

        let a = pool.get_node(PolyRef::new(1)).unwrap();
        pool.node_mut(a).total = 10.0;
        pool.node_mut(a).flags = NodeFlags::OPEN;
        queue.push(&pool, a);

        // Cheaper route found later
        pool.node_mut(a).total = 4.0;
        queue.push(&pool, a);

        assert_eq!(queue.pop(&pool), Some(a));
        pool.node_mut(a).flags = NodeFlags::CLOSED;
        assert_eq!(queue.pop(&pool), None);
    }
}

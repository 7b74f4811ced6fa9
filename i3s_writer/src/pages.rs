//! The page builder (§4.7): reorders the node tree into fixed-size pages,
//! rewriting `index`, `parent_index`, and `children` so they refer to
//! positions in the concatenated page stream.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use crate::node::{InternalNode, NodeId};
use crate::Error;

pub const DEFAULT_PAGE_SIZE: usize = 64;

/// A node record with indices already rewritten to positions in the
/// concatenated page stream; carries the original [`InternalNode`] for
/// downstream field access (material/texture/geometry-definition IDs,
/// bounding volume, LOD threshold).
#[derive(Clone, Debug)]
pub struct PageNode {
    pub index: u32,
    pub parent_index: Option<u32>,
    pub children: Vec<u32>,
    pub node: InternalNode,
}

#[derive(Clone, Debug, Default)]
pub struct Page {
    pub nodes: Vec<PageNode>,
}

/// The two interchangeable page-ordering strategies (§4.7).
pub enum PageStrategy {
    BreadthFirst,
    /// `max_sibling_groups`: the `max_count_sibling_local_subtrees`
    /// parameter partitioning a node's remaining children into groups that
    /// stay together across pages (typically 1).
    LocalSubtree { max_sibling_groups: usize },
}

/// Builds the page sequence for `nodes` rooted at `root`. `nodes` must be a
/// well-formed tree: every child ID referenced by a node must itself be a
/// key in `nodes`.
pub fn build_pages(
    nodes: &HashMap<NodeId, InternalNode>,
    root: NodeId,
    page_size: usize,
    strategy: PageStrategy,
) -> Result<Vec<Page>, Error> {
    let _span = tracing::trace_span!("build_pages", node_count = nodes.len(), page_size).entered();
    if !nodes.contains_key(&root) {
        return Err(Error::InvalidTreeTopology(nodes.len()));
    }
    let order = match strategy {
        PageStrategy::BreadthFirst => breadth_first_order(nodes, root),
        PageStrategy::LocalSubtree { max_sibling_groups } => {
            local_subtree_order(nodes, root, page_size, max_sibling_groups)
        }
    };
    if order.len() != nodes.len() {
        return Err(Error::InvalidTreeTopology(nodes.len() - order.len()));
    }
    let pages = finalize_order(nodes, order, page_size);
    tracing::debug!(page_count = pages.len(), "paged node tree");
    Ok(pages)
}

fn finalize_order(
    nodes: &HashMap<NodeId, InternalNode>,
    order: Vec<NodeId>,
    page_size: usize,
) -> Vec<Page> {
    let index_of: HashMap<NodeId, u32> =
        order.iter().enumerate().map(|(i, id)| (*id, i as u32)).collect();

    let mut page_nodes = Vec::with_capacity(order.len());
    for (i, id) in order.iter().enumerate() {
        let node = &nodes[id];
        let mut children: Vec<u32> = node
            .children
            .iter()
            .filter_map(|c| index_of.get(c).copied())
            .collect();
        children.sort_unstable();
        page_nodes.push(PageNode {
            index: i as u32,
            parent_index: node.parent.and_then(|p| index_of.get(&p).copied()),
            children,
            node: node.clone(),
        });
    }

    page_nodes
        .chunks(page_size.max(1))
        .map(|chunk| Page { nodes: chunk.to_vec() })
        .collect()
}

fn breadth_first_order(nodes: &HashMap<NodeId, InternalNode>, root: NodeId) -> Vec<NodeId> {
    let mut order = Vec::with_capacity(nodes.len());
    let mut queue = VecDeque::new();
    let mut seen = HashSet::new();
    queue.push_back(root);
    seen.insert(root);

    while let Some(id) = queue.pop_front() {
        order.push(id);
        if let Some(node) = nodes.get(&id) {
            for &child in &node.children {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }
    order
}

fn subtree_remaining_count(
    nodes: &HashMap<NodeId, InternalNode>,
    id: NodeId,
    assigned: &HashSet<NodeId>,
) -> usize {
    let mut count = 0;
    let mut stack = vec![id];
    while let Some(cur) = stack.pop() {
        if let Some(node) = nodes.get(&cur) {
            for &child in &node.children {
                if !assigned.contains(&child) {
                    count += 1;
                    stack.push(child);
                }
            }
        }
    }
    count
}

struct HeapEntry(f64, NodeId);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Pass 1 (top-down): a priority queue of pending root-groups, prioritized
/// by the radius of the enqueuing node's OBB (clients load a page when the
/// parent splits). A subtree whose remaining descendant count drops below
/// `page_size` is left whole for pass 2 rather than expanded further.
/// Pass 2 (pre-order): sweeps every node pass 1 didn't place, parent before
/// children, so the invariant in §8 (a node's index precedes all of its
/// descendants') holds for the nodes pass 1 left behind too.
fn local_subtree_order(
    nodes: &HashMap<NodeId, InternalNode>,
    root: NodeId,
    page_size: usize,
    max_sibling_groups: usize,
) -> Vec<NodeId> {
    let mut assigned: HashSet<NodeId> = HashSet::new();
    let mut order = Vec::with_capacity(nodes.len());
    let mut heap = BinaryHeap::new();
    heap.push(HeapEntry(f64::MAX, root));

    while let Some(HeapEntry(_, id)) = heap.pop() {
        if assigned.contains(&id) {
            continue;
        }
        assigned.insert(id);
        order.push(id);

        let Some(node) = nodes.get(&id) else { continue };
        let remaining = subtree_remaining_count(nodes, id, &assigned);
        if remaining < page_size {
            continue;
        }
        let priority = node.sphere.radius as f64;
        let pending: Vec<NodeId> = node
            .children
            .iter()
            .copied()
            .filter(|c| !assigned.contains(c))
            .collect();
        for group in pending.chunks(max_sibling_groups.max(1)) {
            for &child in group {
                heap.push(HeapEntry(priority, child));
            }
        }
    }

    let mut remainder = Vec::new();
    pre_order(nodes, root, &assigned, &mut remainder);
    order.extend(remainder);
    order
}

/// Sweeps every node pass 1 didn't place, parent before children, so a
/// node's final index is always lower than any of its descendants' -- the
/// invariant every page-ordering strategy must uphold (§8).
fn pre_order(
    nodes: &HashMap<NodeId, InternalNode>,
    id: NodeId,
    assigned: &HashSet<NodeId>,
    out: &mut Vec<NodeId>,
) {
    if !assigned.contains(&id) {
        out.push(id);
    }
    if let Some(node) = nodes.get(&id) {
        for &child in &node.children {
            if !assigned.contains(&child) {
                pre_order(nodes, child, assigned, out);
            }
        }
    }
}

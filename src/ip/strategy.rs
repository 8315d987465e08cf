//! Assignment strategies.
//!
//! Each strategy decides how the links of a topology are grouped into
//! subnets, and which interfaces carry an IP address. Adding a strategy
//! means adding a variant and its partitioning function; the address
//! allocation in `assignment.rs` does not change.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use super::AssignmentError;
use crate::topology::{LinkId, Node, NodeId, TopologyGraph};

/// How subnets are carved from a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Single broadcast domain spanning every node
    L2,
    /// One subnet per link, every interface addressed
    L3,
    /// Subnets follow connectivity clusters split at routing boundaries
    #[default]
    Mixed,
}

impl fmt::Display for AssignmentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentStrategy::L2 => write!(f, "l2"),
            AssignmentStrategy::L3 => write!(f, "l3"),
            AssignmentStrategy::Mixed => write!(f, "mixed"),
        }
    }
}

/// Links and nodes that share one subnet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Links in insertion order
    pub links: Vec<LinkId>,
    /// Member nodes sorted by id
    pub members: Vec<NodeId>,
}

impl AssignmentStrategy {
    /// Split the graph into subnets.
    ///
    /// Partitions are ordered by their first link; subnets of isolated
    /// nodes follow in node order.
    pub fn partition(&self, graph: &TopologyGraph) -> Result<Vec<Partition>, AssignmentError> {
        match self {
            AssignmentStrategy::L2 => Ok(partition_l2(graph)),
            AssignmentStrategy::L3 => Ok(partition_l3(graph)),
            AssignmentStrategy::Mixed => partition_mixed(graph),
        }
    }

    /// Whether an interface on `node` receives an IP address
    pub fn addresses_interface(&self, node: &Node) -> bool {
        match self {
            AssignmentStrategy::L2 => node.is_host(),
            AssignmentStrategy::L3 => true,
            AssignmentStrategy::Mixed => node.is_host() || node.is_routing_boundary(),
        }
    }

    /// Whether an addressed interface on `node` can serve as a host gateway
    pub fn routes_for_hosts(&self, node: &Node) -> bool {
        match self {
            AssignmentStrategy::L2 => false,
            AssignmentStrategy::L3 => node.is_switch() || node.is_routing_boundary(),
            AssignmentStrategy::Mixed => node.is_routing_boundary(),
        }
    }
}

fn partition_l2(graph: &TopologyGraph) -> Vec<Partition> {
    let boundaries: Vec<&str> = graph
        .nodes()
        .iter()
        .filter(|n| n.is_routing_boundary())
        .map(|n| n.name.as_str())
        .collect();
    if !boundaries.is_empty() {
        warn!("Routing boundaries {:?} are ignored by the l2 strategy", boundaries);
    }

    if graph.nodes().is_empty() {
        return Vec::new();
    }
    vec![Partition {
        links: graph.links().iter().map(|l| l.id).collect(),
        members: graph.nodes().iter().map(|n| n.id).collect(),
    }]
}

fn partition_l3(graph: &TopologyGraph) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = graph
        .links()
        .iter()
        .map(|link| {
            let (a, b) = link.node_pair();
            Partition { links: vec![link.id], members: vec![a, b] }
        })
        .collect();
    partitions.extend(isolated_partitions(graph));
    partitions
}

fn partition_mixed(graph: &TopologyGraph) -> Result<Vec<Partition>, AssignmentError> {
    for node in graph.nodes() {
        if node.is_routing_boundary() && graph.degree(node.id) == 0 {
            return Err(AssignmentError::IsolatedBoundary { node: node.name.clone() });
        }
    }

    let mut sets = DisjointSet::new(graph.links().len());

    // Links meeting at a non-boundary node share its broadcast domain
    for node in graph.nodes().iter().filter(|n| !n.is_routing_boundary()) {
        for pair in graph.incident_links(node.id).windows(2) {
            sets.union(pair[0].0, pair[1].0);
        }
    }

    // Parallel links between two boundaries could be one subnet or several;
    // fewer subnets wins
    let mut boundary_pairs: HashMap<(NodeId, NodeId), LinkId> = HashMap::new();
    for link in graph.links() {
        let (a, b) = link.node_pair();
        if graph.node(a).is_routing_boundary() && graph.node(b).is_routing_boundary() {
            match boundary_pairs.entry((a, b)) {
                Entry::Occupied(first) => sets.union(first.get().0, link.id.0),
                Entry::Vacant(slot) => {
                    slot.insert(link.id);
                }
            }
        }
    }

    let mut partitions = group_links(graph, &mut sets);
    partitions.extend(isolated_partitions(graph));
    Ok(partitions)
}

/// Collect link sets into partitions in order of their first link
fn group_links(graph: &TopologyGraph, sets: &mut DisjointSet) -> Vec<Partition> {
    let mut by_root: HashMap<usize, usize> = HashMap::new();
    let mut partitions: Vec<Partition> = Vec::new();

    for link in graph.links() {
        let root = sets.find(link.id.0);
        let slot = *by_root.entry(root).or_insert_with(|| {
            partitions.push(Partition { links: Vec::new(), members: Vec::new() });
            partitions.len() - 1
        });
        let partition = &mut partitions[slot];
        partition.links.push(link.id);
        partition.members.push(link.left.node);
        partition.members.push(link.right.node);
    }

    for partition in &mut partitions {
        partition.members.sort();
        partition.members.dedup();
    }
    partitions
}

/// One partition per node without links
fn isolated_partitions(graph: &TopologyGraph) -> Vec<Partition> {
    graph
        .nodes()
        .iter()
        .filter(|n| graph.degree(n.id) == 0)
        .map(|n| Partition { links: Vec::new(), members: vec![n.id] })
        .collect()
}

/// Union-find over link indices
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self { parent: (0..size).collect() }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        // Keep the smaller root so set identity follows insertion order
        if ra < rb {
            self.parent[rb] = ra;
        } else if rb < ra {
            self.parent[ra] = rb;
        }
    }
}

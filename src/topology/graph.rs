//! Topology graph construction and traversal.
//!
//! A [`TopologyBuilder`] accumulates nodes and links and validates each call
//! on the spot; [`TopologyBuilder::build`] freezes it into a [`TopologyGraph`]
//! that the rest of the crate only ever reads.

use std::collections::{HashMap, VecDeque};

use log::debug;
use serde::Serialize;

use super::types::{interface_name, Endpoint, Link, LinkId, Node, NodeId, NodeOptions, NodeRole};
use crate::utils::validation::{validate_interface_name, validate_node_name};

/// Errors raised while building a topology graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate node: '{name}' is already part of the topology")]
    DuplicateNode { name: String },

    #[error("Unknown node: '{name}' has not been added to the topology")]
    UnknownNode { name: String },

    #[error("Invalid link: node '{name}' cannot be linked to itself")]
    SelfLoop { name: String },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

/// Mutable accumulator for a topology.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    nodes: Vec<Node>,
    links: Vec<Link>,
    by_name: HashMap<String, NodeId>,
    next_interface: Vec<u32>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; fails if the name is taken or not usable as an identifier.
    pub fn add_node(
        &mut self,
        name: &str,
        role: NodeRole,
        options: NodeOptions,
    ) -> Result<NodeId, GraphError> {
        if self.by_name.contains_key(name) {
            return Err(GraphError::DuplicateNode { name: name.to_string() });
        }
        validate_node_name(name).map_err(|reason| GraphError::InvalidName {
            name: name.to_string(),
            reason,
        })?;

        let id = NodeId(self.nodes.len());
        let node = Node { id, name: name.to_string(), role, options };
        self.next_interface.push(node.first_interface_index());
        self.by_name.insert(node.name.clone(), id);
        debug!("Added {} '{}' as {}", node.kind(), name, id);
        self.nodes.push(node);
        Ok(id)
    }

    /// Add a link between two existing, distinct nodes.
    ///
    /// Each endpoint receives the next free interface index of its node.
    /// On error the builder is left untouched.
    pub fn add_link(&mut self, a: &str, b: &str) -> Result<LinkId, GraphError> {
        let left = self.lookup(a)?;
        let right = self.lookup(b)?;
        if left == right {
            return Err(GraphError::SelfLoop { name: a.to_string() });
        }

        let left_index = self.next_interface[left.0];
        let right_index = self.next_interface[right.0];
        let left_name = interface_name(a, left_index);
        let right_name = interface_name(b, right_index);
        for iface in [&left_name, &right_name] {
            validate_interface_name(iface).map_err(|reason| GraphError::InvalidName {
                name: iface.clone(),
                reason,
            })?;
        }

        self.next_interface[left.0] += 1;
        self.next_interface[right.0] += 1;

        let id = LinkId(self.links.len());
        self.links.push(Link {
            id,
            left: Endpoint { node: left, index: left_index, name: left_name },
            right: Endpoint { node: right, index: right_index, name: right_name },
        });
        debug!("Added {} between '{}' and '{}'", id, a, b);
        Ok(id)
    }

    fn lookup(&self, name: &str) -> Result<NodeId, GraphError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode { name: name.to_string() })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Freeze the builder into an immutable graph
    pub fn build(self) -> TopologyGraph {
        let mut adjacency = vec![Vec::new(); self.nodes.len()];
        for link in &self.links {
            adjacency[link.left.node.0].push(link.id);
            adjacency[link.right.node.0].push(link.id);
        }
        TopologyGraph {
            nodes: self.nodes,
            links: self.links,
            by_name: self.by_name,
            adjacency,
        }
    }
}

/// Immutable topology: nodes and links in insertion order.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyGraph {
    nodes: Vec<Node>,
    links: Vec<Link>,
    #[serde(skip)]
    by_name: HashMap<String, NodeId>,
    #[serde(skip)]
    adjacency: Vec<Vec<LinkId>>,
}

impl TopologyGraph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).map(|id| &self.nodes[id.0])
    }

    /// Links touching `node`, in link-insertion order
    pub fn incident_links(&self, node: NodeId) -> &[LinkId] {
        &self.adjacency[node.0]
    }

    /// Number of link endpoints on `node`; parallel links count separately
    pub fn degree(&self, node: NodeId) -> usize {
        self.adjacency[node.0].len()
    }

    /// Distinct neighbours of `node`, in order of first link
    pub fn neighbors(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for link_id in &self.adjacency[node.0] {
            if let Some(other) = self.links[link_id.0].other(node) {
                if !seen.contains(&other) {
                    seen.push(other);
                }
            }
        }
        seen
    }

    /// Connected components, each sorted by node id, ordered by smallest member
    pub fn connected_components(&self) -> Vec<Vec<NodeId>> {
        let mut visited = vec![false; self.nodes.len()];
        let mut components = Vec::new();

        for start in 0..self.nodes.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut component = vec![NodeId(start)];
            let mut queue = VecDeque::from([NodeId(start)]);

            while let Some(current) = queue.pop_front() {
                for next in self.neighbors(current) {
                    if !visited[next.0] {
                        visited[next.0] = true;
                        component.push(next);
                        queue.push_back(next);
                    }
                }
            }

            component.sort();
            components.push(component);
        }

        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_routing_builder() -> TopologyBuilder {
        let mut builder = TopologyBuilder::new();
        for name in ["s1", "s2", "s3", "s4"] {
            builder.add_node(name, NodeRole::switch(), NodeOptions::default()).unwrap();
        }
        for name in ["h1", "h2"] {
            builder.add_node(name, NodeRole::host(), NodeOptions::default()).unwrap();
        }
        for (a, b) in [("h1", "s1"), ("s1", "s2"), ("s1", "s3"), ("s2", "s4"), ("s3", "s4"), ("s4", "h2")] {
            builder.add_link(a, b).unwrap();
        }
        builder
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut builder = TopologyBuilder::new();
        builder.add_node("s1", NodeRole::switch(), NodeOptions::default()).unwrap();

        let err = builder.add_node("s1", NodeRole::host(), NodeOptions::default()).unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode { name: "s1".to_string() });
        assert_eq!(builder.node_count(), 1);
    }

    #[test]
    fn test_unknown_node_leaves_graph_unchanged() {
        let mut builder = source_routing_builder();
        let before = builder.link_count();

        let err = builder.add_link("h1", "h3").unwrap_err();
        assert_eq!(err, GraphError::UnknownNode { name: "h3".to_string() });
        assert_eq!(builder.link_count(), before);

        // The failed call must not have consumed an interface index on h1
        let graph = builder.build();
        let h1 = graph.node_by_name("h1").unwrap().id;
        assert_eq!(graph.degree(h1), 1);
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut builder = TopologyBuilder::new();
        builder.add_node("s1", NodeRole::switch(), NodeOptions::default()).unwrap();
        assert!(matches!(builder.add_link("s1", "s1"), Err(GraphError::SelfLoop { .. })));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut builder = TopologyBuilder::new();
        assert!(matches!(
            builder.add_node("1bad", NodeRole::host(), NodeOptions::default()),
            Err(GraphError::InvalidName { .. })
        ));
        assert!(matches!(
            builder.add_node("with-dash", NodeRole::host(), NodeOptions::default()),
            Err(GraphError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_interface_indices_follow_link_order() {
        let graph = source_routing_builder().build();
        let names: Vec<(&str, &str)> = graph
            .links()
            .iter()
            .map(|l| (l.left.name.as_str(), l.right.name.as_str()))
            .collect();

        assert_eq!(
            names,
            vec![
                ("h1-eth0", "s1-eth1"),
                ("s1-eth2", "s2-eth1"),
                ("s1-eth3", "s3-eth1"),
                ("s2-eth2", "s4-eth1"),
                ("s3-eth2", "s4-eth2"),
                ("s4-eth3", "h2-eth0"),
            ]
        );
    }

    #[test]
    fn test_parallel_links_get_distinct_indices() {
        let mut builder = TopologyBuilder::new();
        builder.add_node("s1", NodeRole::switch(), NodeOptions::default()).unwrap();
        builder.add_node("s2", NodeRole::switch(), NodeOptions::default()).unwrap();
        builder.add_link("s1", "s2").unwrap();
        builder.add_link("s2", "s1").unwrap();
        let graph = builder.build();

        let s1 = graph.node_by_name("s1").unwrap().id;
        assert_eq!(graph.degree(s1), 2);
        assert_eq!(graph.neighbors(s1).len(), 1);
        assert_eq!(graph.links()[0].left.index, 1);
        assert_eq!(graph.links()[1].right.index, 2);
    }

    #[test]
    fn test_neighbors_and_components() {
        let mut builder = source_routing_builder();
        builder.add_node("h3", NodeRole::host(), NodeOptions::default()).unwrap();
        let graph = builder.build();

        let s1 = graph.node_by_name("s1").unwrap().id;
        let names: Vec<&str> = graph.neighbors(s1).iter().map(|id| graph.node(*id).name.as_str()).collect();
        assert_eq!(names, vec!["h1", "s2", "s3"]);
        assert_eq!(graph.degree(s1), 3);

        let components = graph.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].len(), 6);
        assert_eq!(components[1], vec![graph.node_by_name("h3").unwrap().id]);
    }
}

//! Runtime topology: the emulated nodes and wired links of one deployment.
//!
//! Each node sits behind its own mutex so stage workers can lock the two
//! endpoints of a link without blocking unrelated nodes. The collections
//! themselves only grow between stages, through `&mut self`.

use std::sync::Mutex;

use crate::provisioner::EmulatedNode;
use crate::topology::NodeId;
use crate::utils::lock;
use crate::wiring::WiredLink;

#[derive(Debug, Default)]
pub struct RuntimeTopology {
    /// Indexed by node id; `None` until the node is provisioned
    nodes: Vec<Option<Mutex<EmulatedNode>>>,
    /// In wiring order
    links: Vec<WiredLink>,
}

impl RuntimeTopology {
    pub fn new(node_count: usize) -> Self {
        Self {
            nodes: (0..node_count).map(|_| None).collect(),
            links: Vec::new(),
        }
    }

    pub fn insert_node(&mut self, node: EmulatedNode) {
        let index = node.id().0;
        if index >= self.nodes.len() {
            self.nodes.resize_with(index + 1, || None);
        }
        self.nodes[index] = Some(Mutex::new(node));
    }

    pub fn node(&self, id: NodeId) -> Option<&Mutex<EmulatedNode>> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Provisioned nodes in node-id order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Mutex<EmulatedNode>)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|node| (NodeId(i), node)))
    }

    pub fn push_link(&mut self, link: WiredLink) {
        self.links.push(link);
    }

    /// Wired links in wiring order
    pub fn links(&self) -> &[WiredLink] {
        &self.links
    }

    /// Remove every wired link, most recently wired first
    pub fn take_links_reversed(&mut self) -> Vec<WiredLink> {
        let mut links = std::mem::take(&mut self.links);
        links.reverse();
        links
    }

    /// Interfaces attached to nodes that still hold a context
    pub fn allocated_interfaces(&self) -> usize {
        self.nodes()
            .map(|(_, node)| {
                let node = lock(node);
                if node.is_released() { 0 } else { node.interfaces().len() }
            })
            .sum()
    }

    /// Nodes whose context has not been released
    pub fn live_contexts(&self) -> usize {
        self.nodes().filter(|(_, node)| !lock(*node).is_released()).count()
    }
}

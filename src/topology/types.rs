//! Topology type definitions.
//!
//! This file contains the plain data types of a topology graph: nodes with
//! their role-specific fields, links, and the per-endpoint interface metadata
//! that every later stage keys on.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Index of a node in its graph, assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

/// Index of a link in its graph, assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LinkId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Coarse classification of a node, used for ordering and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Host,
    Switch,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Host => write!(f, "host"),
            NodeKind::Switch => write!(f, "switch"),
        }
    }
}

/// Role of a node together with the fields only that role accepts.
///
/// Switches carry a data-plane program and the CLI command file fed to the
/// switch once the program is loaded; hosts carry an optional startup script.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeRole {
    Switch {
        program: Option<PathBuf>,
        cli_input: Option<PathBuf>,
    },
    Host {
        startup_script: Option<PathBuf>,
    },
}

impl NodeRole {
    /// A switch with no program or CLI input attached yet
    pub fn switch() -> Self {
        NodeRole::Switch { program: None, cli_input: None }
    }

    /// A host with no startup script
    pub fn host() -> Self {
        NodeRole::Host { startup_script: None }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeRole::Switch { .. } => NodeKind::Switch,
            NodeRole::Host { .. } => NodeKind::Host,
        }
    }
}

/// Per-node flags that do not depend on the role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeOptions {
    /// The node separates subnets under the mixed strategy
    pub routing_boundary: bool,
    /// Capture packets on every interface of this node
    pub pcap: bool,
    /// Keep the node's own log output
    pub log: bool,
}

/// A host or switch in the topology
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub role: NodeRole,
    pub options: NodeOptions,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.role.kind()
    }

    pub fn is_switch(&self) -> bool {
        self.kind() == NodeKind::Switch
    }

    pub fn is_host(&self) -> bool {
        self.kind() == NodeKind::Host
    }

    pub fn is_routing_boundary(&self) -> bool {
        self.options.routing_boundary
    }

    /// The program reference installed during the program-load stage.
    ///
    /// For a switch this is its data-plane program, for a host its startup
    /// script.
    pub fn program(&self) -> Option<&Path> {
        match &self.role {
            NodeRole::Switch { program, .. } => program.as_deref(),
            NodeRole::Host { startup_script } => startup_script.as_deref(),
        }
    }

    /// CLI command file for a switch
    pub fn cli_input(&self) -> Option<&Path> {
        match &self.role {
            NodeRole::Switch { cli_input, .. } => cli_input.as_deref(),
            NodeRole::Host { .. } => None,
        }
    }

    /// First interface index handed out on this node.
    ///
    /// Switch port 0 is reserved for the CPU port, so switch data ports
    /// start at 1 while host interfaces start at 0.
    pub fn first_interface_index(&self) -> u32 {
        match self.kind() {
            NodeKind::Switch => 1,
            NodeKind::Host => 0,
        }
    }
}

/// Which end of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];
}

/// One end of a link: the node and the interface created on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub node: NodeId,
    /// Interface index, unique per node
    pub index: u32,
    /// Interface name, e.g. `s1-eth2`
    pub name: String,
}

/// An undirected point-to-point link between two distinct nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub id: LinkId,
    pub left: Endpoint,
    pub right: Endpoint,
}

impl Link {
    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// The node at the opposite end from `node`, if `node` is an endpoint
    pub fn other(&self, node: NodeId) -> Option<NodeId> {
        if self.left.node == node {
            Some(self.right.node)
        } else if self.right.node == node {
            Some(self.left.node)
        } else {
            None
        }
    }

    /// The side `node` sits on, if it is an endpoint
    pub fn side_of(&self, node: NodeId) -> Option<Side> {
        if self.left.node == node {
            Some(Side::Left)
        } else if self.right.node == node {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Unordered endpoint pair, smaller id first
    pub fn node_pair(&self) -> (NodeId, NodeId) {
        let (a, b) = (self.left.node, self.right.node);
        if a <= b { (a, b) } else { (b, a) }
    }
}

/// Interface name for the `index`-th interface of `node_name`
pub fn interface_name(node_name: &str, index: u32) -> String {
    format!("{}-eth{}", node_name, index)
}

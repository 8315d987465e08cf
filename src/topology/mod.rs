//! Network topology module.
//!
//! This module contains the in-memory topology model: hosts and switches,
//! the links between them, and the read-only traversals the address
//! assignment engine and the orchestrator rely on.

pub mod types;
pub mod graph;

// Re-export key types for easier access
pub use types::{Endpoint, Link, LinkId, Node, NodeId, NodeKind, NodeOptions, NodeRole, Side};
pub use graph::{GraphError, TopologyBuilder, TopologyGraph};

//! # Emulation Backends
//!
//! The orchestrator never touches namespaces, veth pairs or switch processes
//! directly. Every side effect goes through the [`EmulationBackend`] trait,
//! which is the seam to the external collaborators:
//!
//! - **Execution contexts**: one isolated network stack per node
//! - **Data paths**: point-to-point links between two node interfaces
//! - **Program loader**: the P4 compiler/switch runtime for switches, startup
//!   scripts for hosts
//! - **Instrumentation**: packet capture and logging, requested per node when
//!   its context is created
//!
//! ## Implementations
//!
//! - [`netns::NetnsBackend`]: Linux network namespaces, veth pairs, bmv2
//!   `simple_switch` and `simple_switch_CLI`, `p4c`
//! - [`recording::RecordingBackend`]: performs nothing, records every call;
//!   used for dry runs and supports fault injection for tests
//!
//! Backends must be `Send + Sync`: provisioning, wiring and teardown call
//! them from parallel workers.

pub mod netns;
pub mod recording;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::ip::{InterfaceAssignment, MacAddr};
use crate::topology::{Node, NodeId};

pub use netns::{NetnsBackend, NetnsOptions};
pub use recording::{BackendEvent, RecordingBackend};

/// Packet capture and logging requested for a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Instrumentation {
    pub pcap: bool,
    pub log: bool,
}

/// Handle to a node's isolated execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeContext {
    pub node: NodeId,
    pub node_name: String,
    /// Name of the network namespace (or equivalent) owned by the node
    pub namespace: String,
    pub instrumentation: Instrumentation,
}

/// One side of a link being created or deleted
#[derive(Debug, Clone, Copy)]
pub struct LinkEnd<'a> {
    pub context: &'a NodeContext,
    pub interface: &'a str,
    pub mac: MacAddr,
}

/// A switch data port: index and the interface bound to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub index: u32,
    pub interface: String,
}

/// Backend operations, used for logging and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateContext,
    DestroyContext,
    CreateLink,
    DeleteLink,
    ConfigureInterface,
    LoadProgram,
    StartNode,
    StopNode,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CreateContext => "create_context",
            Operation::DestroyContext => "destroy_context",
            Operation::CreateLink => "create_link",
            Operation::DeleteLink => "delete_link",
            Operation::ConfigureInterface => "configure_interface",
            Operation::LoadProgram => "load_program",
            Operation::StartNode => "start_node",
            Operation::StopNode => "stop_node",
        };
        write!(f, "{}", name)
    }
}

/// Errors reported by a backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Command failed: {command}: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("File not found: {}", .path.display())]
    MissingFile { path: PathBuf },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Switch {node} has no data-plane program")]
    NoProgram { node: String },

    #[error("{node} did not become ready within {timeout:?}")]
    NotReady { node: String, timeout: Duration },

    #[error("Process for {node} exited unexpectedly")]
    ProcessExited { node: String },

    #[error("Injected failure: {operation} on {target}")]
    Injected { operation: Operation, target: String },
}

/// Side effects needed to realize a topology
pub trait EmulationBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Create the isolated context of `node`, with no interfaces yet
    fn create_context(&self, node: &Node, instrumentation: Instrumentation) -> Result<NodeContext, BackendError>;

    /// Release a context and everything still inside it
    fn destroy_context(&self, context: &NodeContext) -> Result<(), BackendError>;

    /// Create the data path between two interfaces.
    ///
    /// Must either create both ends or leave nothing behind.
    fn create_link(&self, left: &LinkEnd<'_>, right: &LinkEnd<'_>) -> Result<(), BackendError>;

    fn delete_link(&self, left: &LinkEnd<'_>, right: &LinkEnd<'_>) -> Result<(), BackendError>;

    /// Apply MAC, IP and default route to an interface inside `context`
    fn configure_interface(
        &self,
        context: &NodeContext,
        interface: &InterfaceAssignment,
    ) -> Result<(), BackendError>;

    /// Load the node's program: data-plane program and CLI input for a
    /// switch, startup script for a host
    fn load_program(&self, context: &NodeContext, node: &Node, ports: &[PortBinding]) -> Result<(), BackendError>;

    /// Start the node; returns once it reports started
    fn start_node(&self, context: &NodeContext, node: &Node) -> Result<(), BackendError>;

    fn stop_node(&self, context: &NodeContext) -> Result<(), BackendError>;
}

//! Node provisioner.
//!
//! Turns an abstract [`Node`] into an [`EmulatedNode`]: a backend execution
//! context plus the interfaces attached to it. Provisioning creates the
//! context only; interfaces are attached by the wiring stage and programs
//! are installed after every link is up.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::emulation::{BackendError, EmulationBackend, Instrumentation, NodeContext, PortBinding};
use crate::ip::InterfaceAssignment;
use crate::topology::{Node, NodeId};

/// Lifecycle of a single emulated node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Provisioned,
    ProgramLoaded,
    /// Program load failed; the node keeps its context and links but is not started
    Degraded,
    Started,
    Released,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Provisioned => "provisioned",
            NodeStatus::ProgramLoaded => "program_loaded",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Started => "started",
            NodeStatus::Released => "released",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Failed to create context for {node}: {source}")]
    Context {
        node: String,
        #[source]
        source: BackendError,
    },

    #[error("Interface {interface} is already attached to {node}")]
    InterfaceConflict { node: String, interface: String },

    #[error("Failed to configure {interface} on {node}: {source}")]
    Interface {
        node: String,
        interface: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to start {node}: {source}")]
    Start {
        node: String,
        #[source]
        source: BackendError,
    },
}

/// Program installation failed; recoverable, the node becomes degraded
#[derive(Debug, thiserror::Error)]
#[error("Failed to load {program} on {node}: {source}")]
pub struct ProgramLoadError {
    pub node: String,
    pub program: String,
    #[source]
    pub source: BackendError,
}

/// A node realized by the backend
#[derive(Debug)]
pub struct EmulatedNode {
    context: NodeContext,
    interfaces: Vec<InterfaceAssignment>,
    status: NodeStatus,
}

impl EmulatedNode {
    pub fn id(&self) -> NodeId {
        self.context.node
    }

    pub fn name(&self) -> &str {
        &self.context.node_name
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Attached interfaces in attachment order
    pub fn interfaces(&self) -> &[InterfaceAssignment] {
        &self.interfaces
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceAssignment> {
        self.interfaces.iter().find(|iface| iface.name == name)
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.interface(name).is_some()
    }

    /// Data ports by interface index, for the switch runtime
    pub fn ports(&self) -> Vec<PortBinding> {
        let mut ports: Vec<PortBinding> = self
            .interfaces
            .iter()
            .map(|iface| PortBinding { index: iface.index, interface: iface.name.clone() })
            .collect();
        ports.sort_by_key(|p| p.index);
        ports
    }

    pub fn is_degraded(&self) -> bool {
        self.status == NodeStatus::Degraded
    }

    pub fn is_released(&self) -> bool {
        self.status == NodeStatus::Released
    }
}

/// Creates, configures and releases emulated nodes through a backend
#[derive(Clone)]
pub struct NodeProvisioner {
    backend: Arc<dyn EmulationBackend>,
}

impl NodeProvisioner {
    pub fn new(backend: Arc<dyn EmulationBackend>) -> Self {
        Self { backend }
    }

    /// Create the isolated context of `node`, with no interfaces
    pub fn provision(&self, node: &Node) -> Result<EmulatedNode, ProvisionError> {
        let instrumentation = Instrumentation { pcap: node.options.pcap, log: node.options.log };
        let context = self
            .backend
            .create_context(node, instrumentation)
            .map_err(|source| ProvisionError::Context { node: node.name.clone(), source })?;

        debug!("Provisioned {} {} in {}", node.kind(), node.name, context.namespace);
        Ok(EmulatedNode { context, interfaces: Vec::new(), status: NodeStatus::Provisioned })
    }

    /// Record `assignment` as attached to `node` under `name`.
    ///
    /// Fails without changing `node` when the name is already attached.
    pub fn attach_interface(
        &self,
        node: &mut EmulatedNode,
        name: &str,
        assignment: &InterfaceAssignment,
    ) -> Result<(), ProvisionError> {
        if node.is_attached(name) {
            return Err(ProvisionError::InterfaceConflict {
                node: node.name().to_string(),
                interface: name.to_string(),
            });
        }
        let mut attached = assignment.clone();
        attached.name = name.to_string();
        node.interfaces.push(attached);
        Ok(())
    }

    /// Apply MAC, IP and default route to every attached interface
    pub fn apply_addresses(&self, node: &EmulatedNode) -> Result<(), ProvisionError> {
        for iface in &node.interfaces {
            self.backend
                .configure_interface(&node.context, iface)
                .map_err(|source| ProvisionError::Interface {
                    node: node.name().to_string(),
                    interface: iface.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Install the node's program; a failure leaves the node degraded
    pub fn install_program(&self, emulated: &mut EmulatedNode, node: &Node) -> Result<(), ProgramLoadError> {
        let ports = emulated.ports();
        match self.backend.load_program(&emulated.context, node, &ports) {
            Ok(()) => {
                emulated.status = NodeStatus::ProgramLoaded;
                Ok(())
            }
            Err(source) => {
                emulated.status = NodeStatus::Degraded;
                let program = node
                    .program()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "program".to_string());
                Err(ProgramLoadError { node: node.name.clone(), program, source })
            }
        }
    }

    /// Start a node whose program is loaded
    pub fn start(&self, emulated: &mut EmulatedNode, node: &Node) -> Result<(), ProvisionError> {
        self.backend
            .start_node(&emulated.context, node)
            .map_err(|source| ProvisionError::Start { node: node.name.clone(), source })?;
        emulated.status = NodeStatus::Started;
        info!("{} {} started", node.kind(), node.name);
        Ok(())
    }

    /// Stop a started node; any other node is left as is
    pub fn stop(&self, node: &mut EmulatedNode) -> Result<(), BackendError> {
        if node.status != NodeStatus::Started {
            return Ok(());
        }
        self.backend.stop_node(&node.context)?;
        node.status = NodeStatus::ProgramLoaded;
        debug!("Stopped {}", node.name());
        Ok(())
    }

    /// Stop the node if running and destroy its context.
    ///
    /// Releasing a released node is a no-op. On error the node stays
    /// unreleased so a later call can retry.
    pub fn release(&self, node: &mut EmulatedNode) -> Result<(), BackendError> {
        if node.is_released() {
            return Ok(());
        }
        if let Err(e) = self.stop(node) {
            warn!("Failed to stop {}: {}", node.name(), e);
        }
        self.backend.destroy_context(&node.context)?;
        node.status = NodeStatus::Released;
        debug!("Released {}", node.name());
        Ok(())
    }
}

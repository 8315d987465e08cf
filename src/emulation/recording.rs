//! Recording backend.
//!
//! Performs no side effects. Every call is logged and appended to an event
//! list, and the backend keeps counts of what would be alive so callers can
//! check that teardown released everything. Failures and cancellations can
//! be injected per operation and target.

use std::collections::HashSet;
use std::sync::Mutex;

use log::info;
use serde::Serialize;

use super::{BackendError, EmulationBackend, Instrumentation, LinkEnd, NodeContext, Operation, PortBinding};
use crate::ip::InterfaceAssignment;
use crate::orchestrator::CancelToken;
use crate::topology::Node;
use crate::utils::lock;

/// A single recorded backend call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendEvent {
    pub operation: Operation,
    pub target: String,
}

/// Dry-run backend with fault injection
#[derive(Default)]
pub struct RecordingBackend {
    events: Mutex<Vec<BackendEvent>>,
    contexts: Mutex<HashSet<String>>,
    links: Mutex<HashSet<String>>,
    running: Mutex<HashSet<String>>,
    failures: Vec<(Operation, String)>,
    cancellations: Vec<(Operation, String, CancelToken)>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `operation` whenever it targets `target`.
    ///
    /// Node operations target the node name, interface and link operations
    /// the interface name of either end.
    pub fn fail_on(mut self, operation: Operation, target: &str) -> Self {
        self.failures.push((operation, target.to_string()));
        self
    }

    /// Trigger `token` when `operation` runs against `target`
    pub fn cancel_on(mut self, operation: Operation, target: &str, token: CancelToken) -> Self {
        self.cancellations.push((operation, target.to_string(), token));
        self
    }

    /// Every call made so far, in call order
    pub fn events(&self) -> Vec<BackendEvent> {
        lock(&self.events).clone()
    }

    /// Targets of every call to `operation`, in call order
    pub fn targets_of(&self, operation: Operation) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter(|e| e.operation == operation)
            .map(|e| e.target.clone())
            .collect()
    }

    pub fn live_contexts(&self) -> usize {
        lock(&self.contexts).len()
    }

    pub fn live_links(&self) -> usize {
        lock(&self.links).len()
    }

    pub fn running_nodes(&self) -> usize {
        lock(&self.running).len()
    }

    /// Record a call and apply injected behaviour for it
    fn record(&self, operation: Operation, target: &str, aliases: &[&str]) -> Result<(), BackendError> {
        info!("[{}] {} {}", self.name(), operation, target);
        lock(&self.events).push(BackendEvent { operation, target: target.to_string() });

        let hits = |wanted: &str| wanted == target || aliases.contains(&wanted);
        for (op, wanted, token) in &self.cancellations {
            if *op == operation && hits(wanted.as_str()) {
                token.cancel();
            }
        }
        if self.failures.iter().any(|(op, wanted)| *op == operation && hits(wanted.as_str())) {
            return Err(BackendError::Injected { operation, target: target.to_string() });
        }
        Ok(())
    }
}

fn link_key(left: &LinkEnd<'_>, right: &LinkEnd<'_>) -> String {
    format!("{}<->{}", left.interface, right.interface)
}

impl EmulationBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn create_context(&self, node: &Node, instrumentation: Instrumentation) -> Result<NodeContext, BackendError> {
        self.record(Operation::CreateContext, &node.name, &[])?;
        lock(&self.contexts).insert(node.name.clone());
        Ok(NodeContext {
            node: node.id,
            node_name: node.name.clone(),
            namespace: format!("dry-{}", node.name),
            instrumentation,
        })
    }

    fn destroy_context(&self, context: &NodeContext) -> Result<(), BackendError> {
        self.record(Operation::DestroyContext, &context.node_name, &[])?;
        lock(&self.contexts).remove(&context.node_name);
        Ok(())
    }

    fn create_link(&self, left: &LinkEnd<'_>, right: &LinkEnd<'_>) -> Result<(), BackendError> {
        let key = link_key(left, right);
        self.record(Operation::CreateLink, &key, &[left.interface, right.interface])?;
        lock(&self.links).insert(key);
        Ok(())
    }

    fn delete_link(&self, left: &LinkEnd<'_>, right: &LinkEnd<'_>) -> Result<(), BackendError> {
        let key = link_key(left, right);
        self.record(Operation::DeleteLink, &key, &[left.interface, right.interface])?;
        lock(&self.links).remove(&key);
        Ok(())
    }

    fn configure_interface(
        &self,
        context: &NodeContext,
        interface: &InterfaceAssignment,
    ) -> Result<(), BackendError> {
        self.record(Operation::ConfigureInterface, &interface.name, &[context.node_name.as_str()])
    }

    fn load_program(&self, context: &NodeContext, node: &Node, _ports: &[PortBinding]) -> Result<(), BackendError> {
        let program = node
            .program()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        self.record(Operation::LoadProgram, &context.node_name, &[program.as_str()])
    }

    fn start_node(&self, context: &NodeContext, _node: &Node) -> Result<(), BackendError> {
        self.record(Operation::StartNode, &context.node_name, &[])?;
        lock(&self.running).insert(context.node_name.clone());
        Ok(())
    }

    fn stop_node(&self, context: &NodeContext) -> Result<(), BackendError> {
        self.record(Operation::StopNode, &context.node_name, &[])?;
        lock(&self.running).remove(&context.node_name);
        Ok(())
    }
}

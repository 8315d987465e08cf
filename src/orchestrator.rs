//! Lifecycle orchestrator.
//!
//! This module sequences the construction of an emulated topology through
//! a fixed series of stages:
//!
//! `Unbuilt → Provisioned → Wired → AddressesApplied → ProgramsLoaded → Running`
//!
//! Every stage fans out over nodes or links with rayon and completes fully
//! before the next begins. A fatal failure tears down everything built so
//! far, in reverse construction order, and leaves the deployment `Failed`.
//! A program that fails to load only degrades its node unless a host is
//! left without any working switch.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::emulation::EmulationBackend;
use crate::ip::{assign_addresses, AddressAssignment, AddressPool, AssignmentError, AssignmentStrategy};
use crate::provisioner::{EmulatedNode, NodeProvisioner, NodeStatus, ProgramLoadError, ProvisionError};
use crate::runtime::RuntimeTopology;
use crate::topology::{Link, NodeId, NodeKind, Side, TopologyGraph};
use crate::utils::lock;
use crate::wiring::{LinkWiringEngine, WiredLink, WiringError};

/// Cooperative cancellation shared between the caller and stage workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unbuilt,
    Provisioned,
    Wired,
    AddressesApplied,
    ProgramsLoaded,
    Running,
    TornDown,
    Failed,
}

impl LifecycleState {
    /// The stage that follows this one during construction
    pub fn next(self) -> Option<LifecycleState> {
        match self {
            LifecycleState::Unbuilt => Some(LifecycleState::Provisioned),
            LifecycleState::Provisioned => Some(LifecycleState::Wired),
            LifecycleState::Wired => Some(LifecycleState::AddressesApplied),
            LifecycleState::AddressesApplied => Some(LifecycleState::ProgramsLoaded),
            LifecycleState::ProgramsLoaded => Some(LifecycleState::Running),
            LifecycleState::Running | LifecycleState::TornDown | LifecycleState::Failed => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unbuilt => "unbuilt",
            LifecycleState::Provisioned => "provisioned",
            LifecycleState::Wired => "wired",
            LifecycleState::AddressesApplied => "addresses_applied",
            LifecycleState::ProgramsLoaded => "programs_loaded",
            LifecycleState::Running => "running",
            LifecycleState::TornDown => "torn_down",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a stage failed
#[derive(Debug, thiserror::Error)]
pub enum FailureCause {
    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Wiring(#[from] WiringError),

    #[error("{host} has no working switch left: {}", .switches.join(", "))]
    DependencyLost {
        host: String,
        switches: Vec<String>,
        #[source]
        source: ProgramLoadError,
    },

    #[error("Inconsistent runtime state: {0}")]
    Inconsistent(String),

    #[error("Cancelled")]
    Cancelled,
}

/// A resource that could not be released during teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownFailure {
    pub target: String,
    pub message: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub nodes_stopped: usize,
    pub links_removed: usize,
    pub contexts_released: usize,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A fatal deployment failure, after teardown has run
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed on {target}: {cause}")]
pub struct OrchestrationError {
    /// The stage being entered when the failure occurred
    pub stage: LifecycleState,
    pub target: String,
    #[source]
    pub cause: FailureCause,
    pub teardown_errors: Vec<TeardownFailure>,
}

/// A node left degraded by a failed program load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedNode {
    pub node: String,
    pub kind: NodeKind,
    pub cause: String,
    /// Neighbours told about the degradation
    pub notified: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Healthy,
    Degraded,
    Failed,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Healthy => 0,
            RunOutcome::Degraded => 2,
            RunOutcome::Failed => 1,
        }
    }
}

/// Summary of one deployment
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub backend: String,
    pub strategy: AssignmentStrategy,
    pub state: LifecycleState,
    /// Highest stage reached before shutdown
    pub reached: LifecycleState,
    pub nodes: usize,
    pub links: usize,
    pub subnets: usize,
    pub interfaces: usize,
    pub degraded: Vec<DegradedNode>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.state == LifecycleState::Failed || self.reached < LifecycleState::Running {
            RunOutcome::Failed
        } else if !self.degraded.is_empty() {
            RunOutcome::Degraded
        } else {
            RunOutcome::Healthy
        }
    }
}

/// Stage failure before it is turned into an [`OrchestrationError`]
struct StageFailure {
    target: String,
    cause: FailureCause,
}

impl StageFailure {
    fn new(target: impl Into<String>, cause: impl Into<FailureCause>) -> Self {
        Self { target: target.into(), cause: cause.into() }
    }

    fn cancelled() -> Self {
        Self::new("deployment", FailureCause::Cancelled)
    }
}

/// Per-item result of a parallel stage; `None` when skipped after cancellation
type ItemResult<T> = Option<Result<T, StageFailure>>;

/// Builds deployments against one backend
pub struct Orchestrator {
    backend: Arc<dyn EmulationBackend>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn EmulationBackend>) -> Self {
        Self { backend, cancel: CancelToken::new() }
    }

    /// Use `token` to cancel deployments created from here on
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Compute the address plan and return an `Unbuilt` deployment.
    ///
    /// Nothing is created in the backend until [`Deployment::advance`].
    pub fn prepare(
        &self,
        graph: Arc<TopologyGraph>,
        strategy: AssignmentStrategy,
        pool: AddressPool,
    ) -> Result<Deployment, OrchestrationError> {
        let assignment = assign_addresses(&graph, strategy, pool).map_err(|e| OrchestrationError {
            stage: LifecycleState::Unbuilt,
            target: "address plan".to_string(),
            cause: e.into(),
            teardown_errors: Vec::new(),
        })?;

        Ok(Deployment {
            runtime: RuntimeTopology::new(graph.nodes().len()),
            provisioner: NodeProvisioner::new(self.backend.clone()),
            wiring: LinkWiringEngine::new(self.backend.clone()),
            backend_name: self.backend.name(),
            cancel: self.cancel.clone(),
            graph,
            assignment,
            state: LifecycleState::Unbuilt,
            reached: LifecycleState::Unbuilt,
            degraded: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        })
    }

    /// Drive a topology all the way to `Running`
    pub fn deploy(
        &self,
        graph: Arc<TopologyGraph>,
        strategy: AssignmentStrategy,
        pool: AddressPool,
    ) -> Result<Deployment, OrchestrationError> {
        let mut deployment = self.prepare(graph, strategy, pool)?;
        info!(
            "Deploying {} nodes and {} links on the {} backend",
            deployment.graph.nodes().len(),
            deployment.graph.links().len(),
            deployment.backend_name
        );
        while deployment.state != LifecycleState::Running {
            deployment.advance()?;
        }
        Ok(deployment)
    }
}

/// One emulated topology and its lifecycle
pub struct Deployment {
    graph: Arc<TopologyGraph>,
    assignment: AddressAssignment,
    provisioner: NodeProvisioner,
    wiring: LinkWiringEngine,
    runtime: RuntimeTopology,
    backend_name: &'static str,
    cancel: CancelToken,
    state: LifecycleState,
    reached: LifecycleState,
    degraded: Vec<DegradedNode>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }

    pub fn assignment(&self) -> &AddressAssignment {
        &self.assignment
    }

    pub fn runtime(&self) -> &RuntimeTopology {
        &self.runtime
    }

    pub fn degraded(&self) -> &[DegradedNode] {
        &self.degraded
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Status of a node by name, if it has been provisioned
    pub fn node_status(&self, name: &str) -> Option<NodeStatus> {
        let node = self.graph.node_by_name(name)?;
        self.runtime.node(node.id).map(|n| lock(n).status())
    }

    /// Run the next construction stage.
    ///
    /// Returns the new state. Terminal states and `Running` are left as
    /// they are. On a fatal failure everything is torn down and the state
    /// becomes `Failed`.
    pub fn advance(&mut self) -> Result<LifecycleState, OrchestrationError> {
        let Some(next) = self.state.next() else {
            return Ok(self.state);
        };

        let result = if self.cancel.is_cancelled() {
            Err(StageFailure::cancelled())
        } else {
            match next {
                LifecycleState::Provisioned => self.provision_nodes(),
                LifecycleState::Wired => self.wire_links(),
                LifecycleState::AddressesApplied => self.apply_addresses(),
                LifecycleState::ProgramsLoaded => self.load_programs(),
                LifecycleState::Running => self.start_nodes(),
                LifecycleState::Unbuilt | LifecycleState::TornDown | LifecycleState::Failed => Ok(()),
            }
        };

        match result {
            Ok(()) => {
                self.state = next;
                self.reached = next;
                info!("Stage {} complete", next);
                if next == LifecycleState::Running {
                    self.finished_at = Some(Utc::now());
                    if self.degraded.is_empty() {
                        info!("Topology is running");
                    } else {
                        warn!("Topology is running with {} degraded node(s)", self.degraded.len());
                    }
                }
                Ok(next)
            }
            Err(failure) => Err(self.fail(next, failure)),
        }
    }

    /// Tear everything down and reach `TornDown`.
    ///
    /// Safe to call in any state and more than once; a second call finds
    /// nothing left to release.
    pub fn shutdown(&mut self) -> TeardownReport {
        if self.state == LifecycleState::TornDown {
            return TeardownReport::default();
        }
        info!("Shutting down from {}", self.state);
        let report = self.teardown();
        self.state = LifecycleState::TornDown;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        report
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            backend: self.backend_name.to_string(),
            strategy: self.assignment.strategy,
            state: self.state,
            reached: self.reached,
            nodes: self.graph.nodes().len(),
            links: self.graph.links().len(),
            subnets: self.assignment.subnets().len(),
            interfaces: self.assignment.interfaces().len(),
            degraded: self.degraded.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    fn fail(&mut self, stage: LifecycleState, failure: StageFailure) -> OrchestrationError {
        error!("{} stage failed on {}: {}", stage, failure.target, failure.cause);
        let report = self.teardown();
        self.state = LifecycleState::Failed;
        self.finished_at = Some(Utc::now());
        OrchestrationError {
            stage,
            target: failure.target,
            cause: failure.cause,
            teardown_errors: report.failures,
        }
    }

    fn provision_nodes(&mut self) -> Result<(), StageFailure> {
        let provisioner = &self.provisioner;
        let cancel = &self.cancel;
        let results: Vec<ItemResult<EmulatedNode>> = self
            .graph
            .nodes()
            .par_iter()
            .map(|node| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(provisioner.provision(node).map_err(|e| StageFailure::new(node.name.as_str(), e)))
            })
            .collect();

        let mut first_failure = None;
        let mut skipped = false;
        for result in results {
            match result {
                Some(Ok(node)) => self.runtime.insert_node(node),
                Some(Err(e)) => {
                    first_failure.get_or_insert(e);
                }
                None => skipped = true,
            }
        }
        settle(first_failure, skipped)
    }

    fn wire_links(&mut self) -> Result<(), StageFailure> {
        let runtime = &self.runtime;
        let assignment = &self.assignment;
        let provisioner = &self.provisioner;
        let wiring = &self.wiring;
        let cancel = &self.cancel;

        let results: Vec<ItemResult<WiredLink>> = self
            .graph
            .links()
            .par_iter()
            .map(|link| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(wire_link(link, runtime, assignment, provisioner, wiring))
            })
            .collect();

        let mut first_failure = None;
        let mut skipped = false;
        for result in results {
            match result {
                Some(Ok(wired)) => self.runtime.push_link(wired),
                Some(Err(e)) => {
                    first_failure.get_or_insert(e);
                }
                None => skipped = true,
            }
        }
        settle(first_failure, skipped)
    }

    fn apply_addresses(&mut self) -> Result<(), StageFailure> {
        let provisioner = &self.provisioner;
        let cancel = &self.cancel;
        let nodes: Vec<_> = self.runtime.nodes().collect();

        let results: Vec<ItemResult<()>> = nodes
            .par_iter()
            .map(|(_, node)| {
                if cancel.is_cancelled() {
                    return None;
                }
                let node = lock(*node);
                Some(provisioner.apply_addresses(&node).map_err(|e| StageFailure::new(node.name(), e)))
            })
            .collect();

        collect_unit(results)
    }

    fn load_programs(&mut self) -> Result<(), StageFailure> {
        for kind in [NodeKind::Switch, NodeKind::Host] {
            if self.cancel.is_cancelled() {
                return Err(StageFailure::cancelled());
            }

            let graph = &self.graph;
            let runtime = &self.runtime;
            let provisioner = &self.provisioner;
            let cancel = &self.cancel;

            let results: Vec<Option<(NodeId, Result<(), ProgramLoadError>)>> = graph
                .nodes()
                .par_iter()
                .filter(|node| node.kind() == kind)
                .map(|node| {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    let slot = runtime.node(node.id).ok_or_else(|| {
                        StageFailure::new(
                            node.name.as_str(),
                            FailureCause::Inconsistent(format!("{} not provisioned", node.name)),
                        )
                    })?;
                    let mut emulated = lock(slot);
                    Ok(Some((node.id, provisioner.install_program(&mut emulated, node))))
                })
                .collect::<Result<_, StageFailure>>()?;

            let mut skipped = false;
            let mut failures = Vec::new();
            for result in results {
                match result {
                    Some((id, Err(e))) => failures.push((id, e)),
                    Some((_, Ok(()))) => {}
                    None => skipped = true,
                }
            }

            for (id, err) in failures {
                self.record_degraded(id, &err);
                if kind == NodeKind::Switch {
                    self.check_dependents(id, err)?;
                }
            }
            if skipped {
                return Err(StageFailure::cancelled());
            }
            debug!("Loaded {} programs", kind);
        }
        Ok(())
    }

    /// Log and record a degraded node, notifying its neighbours
    fn record_degraded(&mut self, id: NodeId, err: &ProgramLoadError) {
        let node = self.graph.node(id);
        let notified: Vec<String> = self
            .graph
            .neighbors(id)
            .into_iter()
            .map(|n| self.graph.node(n).name.clone())
            .collect();

        warn!("{} {} degraded: {}", node.kind(), node.name, err);
        for neighbour in &notified {
            info!("Notifying {} that {} is degraded", neighbour, node.name);
        }
        self.degraded.push(DegradedNode {
            node: node.name.clone(),
            kind: node.kind(),
            cause: err.to_string(),
            notified,
        });
    }

    /// Fail when a degraded switch leaves some host with no working switch
    fn check_dependents(&self, switch: NodeId, err: ProgramLoadError) -> Result<(), StageFailure> {
        for host in self.graph.neighbors(switch) {
            let host = self.graph.node(host);
            if !host.is_host() {
                continue;
            }
            let switches: Vec<NodeId> = self
                .graph
                .neighbors(host.id)
                .into_iter()
                .filter(|n| self.graph.node(*n).is_switch())
                .collect();
            let all_degraded = switches
                .iter()
                .all(|s| self.degraded.iter().any(|d| d.node == self.graph.node(*s).name));
            if all_degraded {
                let names = switches.iter().map(|s| self.graph.node(*s).name.clone()).collect();
                return Err(StageFailure::new(
                    host.name.as_str(),
                    FailureCause::DependencyLost { host: host.name.clone(), switches: names, source: err },
                ));
            }
        }
        Ok(())
    }

    fn start_nodes(&mut self) -> Result<(), StageFailure> {
        let graph = &self.graph;
        let provisioner = &self.provisioner;
        let cancel = &self.cancel;
        let nodes: Vec<_> = self.runtime.nodes().collect();

        let results: Vec<ItemResult<()>> = nodes
            .par_iter()
            .map(|(id, node)| {
                if cancel.is_cancelled() {
                    return None;
                }
                let mut node = lock(*node);
                if node.is_degraded() {
                    return Some(Ok(()));
                }
                let spec = graph.node(*id);
                Some(provisioner.start(&mut node, spec).map_err(|e| StageFailure::new(spec.name.as_str(), e)))
            })
            .collect();

        collect_unit(results)
    }

    /// Release everything in reverse construction order.
    ///
    /// Nodes are stopped first, then links removed newest first, then
    /// contexts released in parallel. Errors are collected, never fatal.
    fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let provisioner = &self.provisioner;

        let stopped: Vec<Result<bool, TeardownFailure>> = self
            .runtime
            .nodes()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(_, node)| {
                let mut node = lock(*node);
                let was_started = node.status() == NodeStatus::Started;
                provisioner
                    .stop(&mut node)
                    .map(|()| was_started)
                    .map_err(|e| TeardownFailure { target: node.name().to_string(), message: e.to_string() })
            })
            .collect();
        for result in stopped {
            match result {
                Ok(true) => report.nodes_stopped += 1,
                Ok(false) => {}
                Err(failure) => report.failures.push(failure),
            }
        }

        for link in self.runtime.take_links_reversed() {
            match self.wiring.unwire(&link) {
                Ok(()) => report.links_removed += 1,
                Err(e) => report.failures.push(TeardownFailure {
                    target: format!("{} <-> {}", link.left.interface, link.right.interface),
                    message: e.to_string(),
                }),
            }
        }

        let released: Vec<Result<bool, TeardownFailure>> = self
            .runtime
            .nodes()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(_, node)| {
                let mut node = lock(*node);
                if node.is_released() {
                    return Ok(false);
                }
                provisioner
                    .release(&mut node)
                    .map(|()| true)
                    .map_err(|e| TeardownFailure { target: node.name().to_string(), message: e.to_string() })
            })
            .collect();
        for result in released {
            match result {
                Ok(true) => report.contexts_released += 1,
                Ok(false) => {}
                Err(failure) => report.failures.push(failure),
            }
        }

        for failure in &report.failures {
            error!("Teardown failed for {}", failure);
        }
        info!(
            "Teardown: {} node(s) stopped, {} link(s) removed, {} context(s) released",
            report.nodes_stopped, report.links_removed, report.contexts_released
        );
        report
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        if matches!(self.state, LifecycleState::TornDown | LifecycleState::Failed) {
            return;
        }
        let report = self.shutdown();
        if !report.is_clean() {
            warn!("Teardown on drop left {} failure(s)", report.failures.len());
        }
    }
}

/// Attach both endpoint interfaces of `link`, then wire it.
///
/// Endpoint nodes are locked in node-id order.
fn wire_link(
    link: &Link,
    runtime: &RuntimeTopology,
    assignment: &AddressAssignment,
    provisioner: &NodeProvisioner,
    wiring: &LinkWiringEngine,
) -> Result<WiredLink, StageFailure> {
    let target = format!("{} <-> {}", link.left.name, link.right.name);
    let missing = |what: String| StageFailure::new(target.as_str(), FailureCause::Inconsistent(what));

    let (first, second) = link.node_pair();
    let first_slot = runtime.node(first).ok_or_else(|| missing(format!("{} not provisioned", first)))?;
    let second_slot = runtime.node(second).ok_or_else(|| missing(format!("{} not provisioned", second)))?;
    let mut first_guard = lock(first_slot);
    let mut second_guard = lock(second_slot);
    let (left, right) = if link.left.node == first {
        (&mut *first_guard, &mut *second_guard)
    } else {
        (&mut *second_guard, &mut *first_guard)
    };

    for (side, node) in [(Side::Left, &mut *left), (Side::Right, &mut *right)] {
        let iface = assignment
            .interface(link.id, side)
            .ok_or_else(|| missing(format!("no address plan for {}", link.endpoint(side).name)))?;
        provisioner
            .attach_interface(node, &iface.name, iface)
            .map_err(|e| StageFailure::new(target.as_str(), e))?;
    }

    wiring.wire(link, left, right).map_err(|e| StageFailure::new(target.as_str(), e))
}

fn settle(first_failure: Option<StageFailure>, skipped: bool) -> Result<(), StageFailure> {
    match first_failure {
        Some(failure) => Err(failure),
        None if skipped => Err(StageFailure::cancelled()),
        None => Ok(()),
    }
}

fn collect_unit(results: Vec<ItemResult<()>>) -> Result<(), StageFailure> {
    let mut first_failure = None;
    let mut skipped = false;
    for result in results {
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                first_failure.get_or_insert(e);
            }
            None => skipped = true,
        }
    }
    settle(first_failure, skipped)
}

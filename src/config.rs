//! Topology description format.
//!
//! A topology file has three sections: network-wide settings, the node
//! list and the link list.
//!
//! ```yaml
//! network:
//!   strategy: mixed
//!   pcap_dump_all: true
//!   p4_source_all: p4src/source_routing.p4
//! nodes:
//!   - { name: s1, kind: switch, cli_input: s1-commands.txt }
//!   - { name: h1, kind: host }
//! links:
//!   - [h1, s1]
//! ```
//!
//! Relative paths are used as written, relative to the working directory.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::emulation::NetnsOptions;
use crate::ip::{AddressPool, AssignmentStrategy};
use crate::topology::{GraphError, NodeOptions, NodeRole, TopologyBuilder, TopologyGraph};

/// Which emulation backend realizes the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Linux network namespaces and bmv2 switches
    #[default]
    Netns,
    /// Record actions without performing them
    DryRun,
}

/// Complete topology description, mirroring the YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    #[serde(default)]
    pub network: NetworkSettings,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<[String; 2]>,
}

/// Settings that apply to the whole network
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSettings {
    /// Default log filter, overridden by `RUST_LOG`
    pub log_level: String,
    /// Open the inspection console once the network is running
    pub cli: bool,
    pub strategy: AssignmentStrategy,
    /// Capture packets on every node that does not say otherwise
    pub pcap_dump_all: bool,
    /// Keep logs of every node that does not say otherwise
    pub log_all: bool,
    /// Data-plane program for every switch without its own
    pub p4_source_all: Option<PathBuf>,
    pub backend: BackendKind,
    pub output_dir: PathBuf,
    pub address_pool: AddressPool,
    #[serde(with = "humantime_serde")]
    pub switch_ready_timeout: Duration,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            cli: false,
            strategy: AssignmentStrategy::default(),
            pcap_dump_all: false,
            log_all: false,
            p4_source_all: None,
            backend: BackendKind::default(),
            output_dir: PathBuf::from("./emulation"),
            address_pool: AddressPool::default(),
            switch_ready_timeout: Duration::from_secs(5),
        }
    }
}

/// One node entry; the `kind` field selects which extra fields are accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum NodeSpec {
    Switch {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cli_input: Option<PathBuf>,
        #[serde(default)]
        routing_boundary: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pcap: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log: Option<bool>,
    },
    Host {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        startup_script: Option<PathBuf>,
        #[serde(default)]
        routing_boundary: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pcap: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log: Option<bool>,
    },
}

impl NodeSpec {
    pub fn name(&self) -> &str {
        match self {
            NodeSpec::Switch { name, .. } | NodeSpec::Host { name, .. } => name,
        }
    }

    /// Role with network-wide defaults folded in
    fn role(&self, network: &NetworkSettings) -> NodeRole {
        match self {
            NodeSpec::Switch { program, cli_input, .. } => NodeRole::Switch {
                program: program.clone().or_else(|| network.p4_source_all.clone()),
                cli_input: cli_input.clone(),
            },
            NodeSpec::Host { startup_script, .. } => NodeRole::Host { startup_script: startup_script.clone() },
        }
    }

    fn options(&self, network: &NetworkSettings) -> NodeOptions {
        let (routing_boundary, pcap, log) = match self {
            NodeSpec::Switch { routing_boundary, pcap, log, .. }
            | NodeSpec::Host { routing_boundary, pcap, log, .. } => (*routing_boundary, *pcap, *log),
        };
        NodeOptions {
            routing_boundary,
            pcap: pcap.unwrap_or(network.pcap_dump_all),
            log: log.unwrap_or(network.log_all),
        }
    }
}

impl TopologyConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.nodes.is_empty() {
            return Err(ValidationError::InvalidTopology("at least one node is required".to_string()));
        }

        if log::LevelFilter::from_str(&self.network.log_level).is_err() {
            return Err(ValidationError::InvalidNetwork(format!(
                "unknown log_level '{}' (expected off, error, warn, info, debug or trace)",
                self.network.log_level
            )));
        }

        self.network
            .address_pool
            .validate()
            .map_err(|e| ValidationError::InvalidNetwork(format!("address_pool: {}", e)))?;
        if !self.network.address_pool.is_private() {
            log::warn!(
                "address_pool {} is outside private address space and may shadow real routes",
                self.network.address_pool
            );
        }

        if self.network.switch_ready_timeout.is_zero() {
            return Err(ValidationError::InvalidNetwork("switch_ready_timeout must be positive".to_string()));
        }

        for node in &self.nodes {
            if let NodeSpec::Switch { name, program: None, .. } = node {
                if self.network.p4_source_all.is_none() && self.network.backend == BackendKind::Netns {
                    return Err(ValidationError::InvalidNode(format!(
                        "switch '{}' has no program and network.p4_source_all is not set",
                        name
                    )));
                }
            }
        }

        for [a, b] in &self.links {
            if a == b {
                return Err(ValidationError::InvalidTopology(format!("link [{}, {}] connects a node to itself", a, b)));
            }
        }

        Ok(())
    }

    /// Build the topology graph described by this configuration
    pub fn to_graph(&self) -> Result<TopologyGraph, GraphError> {
        let mut builder = TopologyBuilder::new();
        for node in &self.nodes {
            builder.add_node(node.name(), node.role(&self.network), node.options(&self.network))?;
        }
        for [a, b] in &self.links {
            builder.add_link(a, b)?;
        }
        Ok(builder.build())
    }

    /// Options for the namespace backend derived from the network settings
    pub fn netns_options(&self) -> NetnsOptions {
        NetnsOptions {
            output_dir: self.network.output_dir.clone(),
            ready_timeout: self.network.switch_ready_timeout,
            ..NetnsOptions::default()
        }
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid network configuration: {0}")]
    InvalidNetwork(String),
    #[error("Invalid node configuration: {0}")]
    InvalidNode(String),
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
}

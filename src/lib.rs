//! # p4net - Topology-driven orchestration of emulated P4 networks
//!
//! This library turns a declarative description of switches, hosts and
//! links into a running emulated network: it derives consistent addressing,
//! realizes every node and link through an emulation backend, and sequences
//! startup and teardown in dependency order with partial-failure recovery.
//!
//! ## Overview
//!
//! A topology is built once and never mutated. From it the address
//! assignment engine computes a deterministic plan (MAC, subnet and
//! optional IPv4 per interface), and the lifecycle orchestrator drives the
//! backend through a fixed series of stages until every node reports
//! started. The P4 compiler, the switch runtime, packet capture and the
//! control-plane command files are external collaborators: they are
//! invoked, never reimplemented.
//!
//! ## Key Features
//!
//! - **Three addressing strategies**: one L2 domain, one subnet per link, or
//!   subnets split at routing boundaries
//! - **Deterministic plans**: the same topology always gets the same addresses
//! - **Parallel stages**: provisioning, wiring and teardown fan out with rayon
//! - **Partial failure**: a switch whose program fails to load is degraded,
//!   not fatal, unless a host loses every switch it is attached to
//! - **Guaranteed teardown**: failures, cancellation and drop all release
//!   every resource in reverse construction order
//! - **Dry runs**: a recording backend performs nothing and logs everything
//!
//! ## Architecture
//!
//! - `topology`: nodes, links and the immutable topology graph
//! - `ip`: address assignment strategies, subnet and MAC allocation
//! - `emulation`: the backend seam, the Linux namespace backend and the
//!   recording backend
//! - `provisioner`: abstract node to emulated node
//! - `wiring`: graph edge to backend data path
//! - `runtime`: the emulated nodes and links of one deployment
//! - `orchestrator`: lifecycle state machine, rollback and run reports
//! - `config` / `config_loader`: YAML topology description
//! - `console`: inspection console for a running network
//! - `utils`: IPv4 arithmetic, name validation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use p4net::config_loader;
//! use p4net::emulation::RecordingBackend;
//! use p4net::orchestrator::Orchestrator;
//!
//! let (config, graph) = config_loader::load_topology(Path::new("topologies/source_routing.yaml"))?;
//!
//! let orchestrator = Orchestrator::new(Arc::new(RecordingBackend::new()));
//! let mut deployment = orchestrator.deploy(
//!     Arc::new(graph),
//!     config.network.strategy,
//!     config.network.address_pool,
//! )?;
//!
//! println!("{}", serde_json::to_string_pretty(&deployment.report())?);
//! deployment.shutdown();
//! # Ok::<(), color_eyre::eyre::Report>(())
//! ```
//!
//! ## Configuration Format
//!
//! ```yaml
//! network:
//!   log_level: info
//!   cli: true
//!   strategy: mixed        # l2 | l3 | mixed
//!   pcap_dump_all: true
//!   log_all: true
//!   p4_source_all: p4src/source_routing.p4
//!
//! nodes:
//!   - { name: s1, kind: switch, cli_input: s1-commands.txt }
//!   - { name: h1, kind: host }
//!
//! links:
//!   - [h1, s1]
//! ```
//!
//! ## Error Handling
//!
//! Library modules define their own `thiserror` enums so callers can match
//! on the failing stage and cause. The binary and the configuration loader
//! use `color_eyre` for reporting with context.

pub mod config;
pub mod config_loader;
pub mod console;
pub mod emulation;
pub mod ip;
pub mod orchestrator;
pub mod provisioner;
pub mod runtime;
pub mod topology;
pub mod utils;
pub mod wiring;

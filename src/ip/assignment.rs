//! Address plan computation.
//!
//! [`assign_addresses`] is a single synchronous pass over a finished graph:
//! partition it with the selected strategy, give every partition a subnet,
//! then walk the links in insertion order handing out MACs and host
//! addresses. The same graph, strategy and pool always yield the same plan.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use log::{debug, info};
use serde::Serialize;

use super::allocator::{AddressPool, HostAllocator, SubnetAllocator};
use super::mac::{interface_mac, MacAddr};
use super::strategy::AssignmentStrategy;
use super::AssignmentError;
use crate::topology::{LinkId, NodeId, Side, TopologyGraph};
use crate::utils::ip_utils::format_cidr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubnetId(pub usize);

/// One subnet of the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub network: Ipv4Addr,
    pub prefix: u8,
    pub links: Vec<LinkId>,
    pub members: Vec<NodeId>,
}

impl Subnet {
    pub fn cidr(&self) -> String {
        format_cidr(self.network, self.prefix)
    }
}

/// Addressing of a single interface (one end of one link)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceAssignment {
    pub node: NodeId,
    pub node_name: String,
    pub link: LinkId,
    pub side: Side,
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
    pub ip: Option<Ipv4Addr>,
    pub prefix: u8,
    pub subnet: SubnetId,
    /// Default gateway, only set on host interfaces
    pub gateway: Option<Ipv4Addr>,
}

impl InterfaceAssignment {
    /// `ip/prefix`, if the interface is addressed
    pub fn cidr(&self) -> Option<String> {
        self.ip.map(|ip| format_cidr(ip, self.prefix))
    }
}

/// Complete addressing of a topology
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressAssignment {
    pub strategy: AssignmentStrategy,
    pub pool: AddressPool,
    subnets: Vec<Subnet>,
    interfaces: Vec<InterfaceAssignment>,
    #[serde(skip)]
    by_endpoint: HashMap<(LinkId, Side), usize>,
    #[serde(skip)]
    node_subnets: BTreeMap<NodeId, Vec<SubnetId>>,
}

impl AddressAssignment {
    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    pub fn subnet(&self, id: SubnetId) -> &Subnet {
        &self.subnets[id.0]
    }

    /// All interfaces, ordered by link then side
    pub fn interfaces(&self) -> &[InterfaceAssignment] {
        &self.interfaces
    }

    /// Assignment of one link endpoint
    pub fn interface(&self, link: LinkId, side: Side) -> Option<&InterfaceAssignment> {
        self.by_endpoint.get(&(link, side)).map(|&i| &self.interfaces[i])
    }

    /// Interfaces of one node in link order
    pub fn interfaces_of(&self, node: NodeId) -> impl Iterator<Item = &InterfaceAssignment> {
        self.interfaces.iter().filter(move |iface| iface.node == node)
    }

    /// Subnets `node` is a member of
    pub fn subnets_of(&self, node: NodeId) -> &[SubnetId] {
        self.node_subnets.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Compute the address plan for `graph`.
///
/// # Arguments
/// * `graph` - The finished topology
/// * `strategy` - How subnets are carved
/// * `pool` - Address pool subnets are taken from
///
/// # Returns
/// * `Ok(AddressAssignment)` covering every link endpoint
/// * `Err(AssignmentError)` if the strategy's constraints cannot be met
pub fn assign_addresses(
    graph: &TopologyGraph,
    strategy: AssignmentStrategy,
    pool: AddressPool,
) -> Result<AddressAssignment, AssignmentError> {
    let mut subnet_allocator = SubnetAllocator::new(pool)?;
    let partitions = strategy.partition(graph)?;
    subnet_allocator.ensure_capacity(partitions.len())?;

    let mut subnets = Vec::with_capacity(partitions.len());
    let mut hosts = Vec::with_capacity(partitions.len());
    let mut link_subnet: HashMap<LinkId, SubnetId> = HashMap::new();
    let mut node_subnets: BTreeMap<NodeId, Vec<SubnetId>> = BTreeMap::new();

    for (i, partition) in partitions.into_iter().enumerate() {
        let id = SubnetId(i);
        let network = subnet_allocator.allocate()?;
        for link in &partition.links {
            link_subnet.insert(*link, id);
        }
        for member in &partition.members {
            node_subnets.entry(*member).or_default().push(id);
        }
        hosts.push(HostAllocator::new(network, pool.subnet_prefix));
        subnets.push(Subnet {
            id,
            network,
            prefix: pool.subnet_prefix,
            links: partition.links,
            members: partition.members,
        });
    }

    let mut interfaces = Vec::with_capacity(graph.links().len() * 2);
    let mut by_endpoint = HashMap::with_capacity(graph.links().len() * 2);

    for link in graph.links() {
        let subnet = link_subnet[&link.id];
        for side in Side::BOTH {
            let endpoint = link.endpoint(side);
            let node = graph.node(endpoint.node);
            let ip = if strategy.addresses_interface(node) {
                Some(hosts[subnet.0].allocate()?)
            } else {
                None
            };

            let assignment = InterfaceAssignment {
                node: node.id,
                node_name: node.name.clone(),
                link: link.id,
                side,
                name: endpoint.name.clone(),
                index: endpoint.index,
                mac: interface_mac(node.id, link.id)?,
                ip,
                prefix: pool.subnet_prefix,
                subnet,
                gateway: None,
            };
            debug!(
                "{} -> mac {} ip {} ({})",
                assignment.name,
                assignment.mac,
                assignment.cidr().unwrap_or_else(|| "-".to_string()),
                subnets[subnet.0].cidr()
            );
            by_endpoint.insert((link.id, side), interfaces.len());
            interfaces.push(assignment);
        }
    }

    assign_gateways(graph, strategy, &mut interfaces);

    info!(
        "Assigned {} interfaces across {} subnets using the {} strategy",
        interfaces.len(),
        subnets.len(),
        strategy
    );

    Ok(AddressAssignment {
        strategy,
        pool,
        subnets,
        interfaces,
        by_endpoint,
        node_subnets,
    })
}

/// Point every addressed host interface at the first routing address in its subnet
fn assign_gateways(
    graph: &TopologyGraph,
    strategy: AssignmentStrategy,
    interfaces: &mut [InterfaceAssignment],
) {
    let mut gateways: HashMap<SubnetId, (NodeId, Ipv4Addr)> = HashMap::new();
    for iface in interfaces.iter() {
        if let Some(ip) = iface.ip {
            if strategy.routes_for_hosts(graph.node(iface.node)) {
                gateways.entry(iface.subnet).or_insert((iface.node, ip));
            }
        }
    }

    for iface in interfaces.iter_mut() {
        if iface.ip.is_none() || !graph.node(iface.node).is_host() {
            continue;
        }
        if let Some((router, ip)) = gateways.get(&iface.subnet) {
            if *router != iface.node {
                iface.gateway = Some(*ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{NodeOptions, NodeRole, TopologyBuilder};
    use std::collections::HashSet;

    fn source_routing_graph() -> TopologyGraph {
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
        builder.build()
    }

    #[test]
    fn test_source_routing_single_subnet() {
        let graph = source_routing_graph();
        let plan = assign_addresses(&graph, AssignmentStrategy::Mixed, AddressPool::default()).unwrap();

        assert_eq!(plan.subnets().len(), 1);
        assert_eq!(plan.subnets()[0].links.len(), 6);
        assert_eq!(plan.subnets()[0].cidr(), "10.0.0.0/24");

        let macs: HashSet<MacAddr> = plan.interfaces().iter().map(|i| i.mac).collect();
        assert_eq!(plan.interfaces().len(), 12);
        assert_eq!(macs.len(), 12);

        let h1 = graph.node_by_name("h1").unwrap().id;
        let h2 = graph.node_by_name("h2").unwrap().id;
        let h1_ip = plan.interfaces_of(h1).next().unwrap().ip;
        let h2_ip = plan.interfaces_of(h2).next().unwrap().ip;
        // Host bytes follow link-insertion order: h1 is on the first link, h2 on the last
        assert_eq!(h1_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(h2_ip, Some(Ipv4Addr::new(10, 0, 0, 2)));

        // Plain switch ports are not addressed
        let s1 = graph.node_by_name("s1").unwrap().id;
        assert!(plan.interfaces_of(s1).all(|i| i.ip.is_none()));
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let graph = source_routing_graph();
        for strategy in [AssignmentStrategy::L2, AssignmentStrategy::L3, AssignmentStrategy::Mixed] {
            let first = assign_addresses(&graph, strategy, AddressPool::default()).unwrap();
            let second = assign_addresses(&graph, strategy, AddressPool::default()).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_zero_links_each_node_own_subnet() {
        let mut builder = TopologyBuilder::new();
        builder.add_node("s1", NodeRole::switch(), NodeOptions::default()).unwrap();
        builder.add_node("h1", NodeRole::host(), NodeOptions::default()).unwrap();
        builder.add_node("h2", NodeRole::host(), NodeOptions::default()).unwrap();
        let graph = builder.build();

        let plan = assign_addresses(&graph, AssignmentStrategy::Mixed, AddressPool::default()).unwrap();
        assert_eq!(plan.subnets().len(), 3);
        for node in graph.nodes() {
            let subnets = plan.subnets_of(node.id);
            assert_eq!(subnets.len(), 1);
            assert_eq!(plan.subnet(subnets[0]).members, vec![node.id]);
        }
        assert!(plan.interfaces().is_empty());
    }

    #[test]
    fn test_l3_addresses_every_interface() {
        let graph = source_routing_graph();
        let plan = assign_addresses(&graph, AssignmentStrategy::L3, AddressPool::default()).unwrap();

        assert_eq!(plan.subnets().len(), 6);
        assert!(plan.interfaces().iter().all(|i| i.ip.is_some()));

        let first = plan.interface(LinkId(0), Side::Left).unwrap();
        assert_eq!(first.name, "h1-eth0");
        assert_eq!(first.ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
        // The switch on the other side of the link routes for h1
        assert_eq!(first.gateway, Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_mixed_gateway_is_boundary_address() {
        let mut builder = TopologyBuilder::new();
        let router = NodeOptions { routing_boundary: true, ..NodeOptions::default() };
        builder.add_node("h1", NodeRole::host(), NodeOptions::default()).unwrap();
        builder.add_node("s1", NodeRole::switch(), NodeOptions::default()).unwrap();
        builder.add_node("r1", NodeRole::switch(), router).unwrap();
        builder.add_node("h2", NodeRole::host(), NodeOptions::default()).unwrap();
        builder.add_link("h1", "s1").unwrap();
        builder.add_link("s1", "r1").unwrap();
        builder.add_link("r1", "h2").unwrap();
        let graph = builder.build();

        let plan = assign_addresses(&graph, AssignmentStrategy::Mixed, AddressPool::default()).unwrap();
        assert_eq!(plan.subnets().len(), 2);

        let h1 = plan.interface(LinkId(0), Side::Left).unwrap();
        let r1_west = plan.interface(LinkId(1), Side::Right).unwrap();
        assert_eq!(h1.ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(r1_west.ip, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(h1.gateway, r1_west.ip);

        let h2 = plan.interface(LinkId(2), Side::Right).unwrap();
        assert_eq!(h2.ip, Some(Ipv4Addr::new(10, 0, 1, 2)));
        assert_eq!(h2.gateway, Some(Ipv4Addr::new(10, 0, 1, 1)));

        let r1 = graph.node_by_name("r1").unwrap().id;
        assert_eq!(plan.subnets_of(r1).len(), 2);
    }

    #[test]
    fn test_pool_exhaustion_is_unsatisfiable() {
        let graph = source_routing_graph();
        let tiny = AddressPool { base: Ipv4Addr::new(10, 0, 0, 0), pool_prefix: 22, subnet_prefix: 24 };

        let err = assign_addresses(&graph, AssignmentStrategy::L3, tiny).unwrap_err();
        assert!(matches!(err, AssignmentError::PoolExhausted { needed: 6, capacity: 4, .. }));
    }

    #[test]
    fn test_subnet_exhaustion_is_unsatisfiable() {
        let graph = source_routing_graph();
        let narrow = AddressPool { base: Ipv4Addr::new(10, 0, 0, 0), pool_prefix: 16, subnet_prefix: 30 };

        // A /30 still holds both ends of a point-to-point link
        assert!(assign_addresses(&graph, AssignmentStrategy::L3, narrow).is_ok());

        let mut builder = TopologyBuilder::new();
        builder.add_node("s1", NodeRole::switch(), NodeOptions::default()).unwrap();
        for name in ["h1", "h2", "h3"] {
            builder.add_node(name, NodeRole::host(), NodeOptions::default()).unwrap();
            builder.add_link(name, "s1").unwrap();
        }
        let star = builder.build();
        let err = assign_addresses(&star, AssignmentStrategy::Mixed, narrow).unwrap_err();
        assert!(matches!(err, AssignmentError::SubnetExhausted { .. }));
    }

    #[test]
    fn test_plan_serializes_to_json() {
        let graph = source_routing_graph();
        let plan = assign_addresses(&graph, AssignmentStrategy::Mixed, AddressPool::default()).unwrap();

        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["strategy"], "mixed");
        assert_eq!(json["interfaces"][0]["name"], "h1-eth0");
        assert_eq!(json["interfaces"][0]["ip"], "10.0.0.1");
        assert_eq!(json["subnets"][0]["network"], "10.0.0.0");
    }
}

#[cfg(test)]
mod source_routing_tests {
    use std::collections::HashSet;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    use p4net::config::BackendKind;
    use p4net::config_loader::{load_config, load_topology};
    use p4net::emulation::{Operation, RecordingBackend};
    use p4net::ip::{assign_addresses, AddressPool, AssignmentStrategy, MacAddr};
    use p4net::orchestrator::{FailureCause, LifecycleState, Orchestrator, RunOutcome};
    use p4net::provisioner::NodeStatus;
    use p4net::topology::{GraphError, NodeOptions, NodeRole, TopologyBuilder, TopologyGraph};

    const TOPOLOGY: &str = "topologies/source_routing.yaml";

    fn source_routing() -> TopologyGraph {
        let (_, graph) = load_topology(Path::new(TOPOLOGY)).unwrap();
        graph
    }

    #[test]
    fn test_shipped_topology_loads() {
        let config = load_config(Path::new(TOPOLOGY)).unwrap();
        assert_eq!(config.network.strategy, AssignmentStrategy::Mixed);
        assert_eq!(config.network.backend, BackendKind::Netns);
        assert!(config.network.cli);

        let graph = config.to_graph().unwrap();
        assert_eq!(graph.nodes().len(), 6);
        assert_eq!(graph.links().len(), 6);
        for node in graph.nodes().iter().filter(|n| n.is_switch()) {
            assert!(node.options.pcap && node.options.log);
            assert_eq!(node.program(), Some(Path::new("p4src/source_routing.p4")));
            assert_eq!(
                node.cli_input().unwrap().to_str().unwrap(),
                format!("{}-commands.txt", node.name)
            );
        }
    }

    #[test]
    fn test_interface_indices_follow_link_order() {
        let graph = source_routing();
        let names: Vec<(String, String)> = graph
            .links()
            .iter()
            .map(|l| (l.left.name.clone(), l.right.name.clone()))
            .collect();

        assert_eq!(names[0], ("h1-eth0".to_string(), "s1-eth1".to_string()));
        assert_eq!(names[2], ("s1-eth3".to_string(), "s3-eth1".to_string()));
        assert_eq!(names[5], ("s4-eth3".to_string(), "h2-eth0".to_string()));
        assert_eq!(graph.degree(graph.node_by_name("s1").unwrap().id), 3);
        assert_eq!(graph.connected_components().len(), 1);
    }

    #[test]
    fn test_unknown_endpoint_leaves_graph_unchanged() {
        let mut builder = TopologyBuilder::new();
        builder.add_node("s1", NodeRole::switch(), NodeOptions::default()).unwrap();
        let err = builder.add_link("s1", "s9").unwrap_err();

        assert_eq!(err, GraphError::UnknownNode { name: "s9".to_string() });
        assert_eq!(builder.link_count(), 0);
        assert_eq!(builder.build().degree(p4net::topology::NodeId(0)), 0);
    }

    #[test]
    fn test_mixed_plan_is_one_subnet_with_distinct_macs() {
        let graph = source_routing();
        let plan = assign_addresses(&graph, AssignmentStrategy::Mixed, AddressPool::default()).unwrap();

        assert_eq!(plan.subnets().len(), 1);
        let macs: HashSet<MacAddr> = plan.interfaces().iter().map(|i| i.mac).collect();
        assert_eq!(macs.len(), 12);

        let again = assign_addresses(&graph, AssignmentStrategy::Mixed, AddressPool::default()).unwrap();
        assert_eq!(
            serde_json::to_string(&plan).unwrap(),
            serde_json::to_string(&again).unwrap()
        );
    }

    #[test]
    fn test_dry_run_reaches_running_and_tears_down() {
        let backend = Arc::new(RecordingBackend::new());
        let orchestrator = Orchestrator::new(backend.clone());
        let mut deployment = orchestrator
            .deploy(Arc::new(source_routing()), AssignmentStrategy::Mixed, AddressPool::default())
            .unwrap();

        assert_eq!(deployment.state(), LifecycleState::Running);
        assert_eq!(deployment.runtime().allocated_interfaces(), 12);
        assert_eq!(backend.targets_of(Operation::ConfigureInterface).len(), 12);
        assert!(deployment.degraded().is_empty());

        let teardown = deployment.shutdown();
        assert!(teardown.is_clean());
        assert_eq!(teardown.nodes_stopped, 6);
        assert_eq!(backend.live_contexts(), 0);
        assert_eq!(backend.live_links(), 0);
        assert_eq!(deployment.runtime().live_contexts(), 0);
        assert_eq!(deployment.runtime().allocated_interfaces(), 0);

        let report = deployment.report();
        assert_eq!(report.outcome(), RunOutcome::Healthy);
        assert_eq!(report.state, LifecycleState::TornDown);
        assert!(report.finished_at.unwrap() >= report.started_at);
    }

    #[test]
    fn test_s3_failure_degrades_only_s3() {
        let backend = Arc::new(RecordingBackend::new().fail_on(Operation::LoadProgram, "s3"));
        let deployment = Orchestrator::new(backend.clone())
            .deploy(Arc::new(source_routing()), AssignmentStrategy::Mixed, AddressPool::default())
            .unwrap();

        assert_eq!(deployment.state(), LifecycleState::Running);
        assert_eq!(deployment.node_status("s3"), Some(NodeStatus::Degraded));
        assert_eq!(deployment.node_status("s2"), Some(NodeStatus::Started));
        assert!(!backend.targets_of(Operation::StartNode).contains(&"s3".to_string()));

        let report = deployment.report();
        assert_eq!(report.outcome().exit_code(), 2);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["degraded"][0]["node"], "s3");
        assert_eq!(json["state"], "running");
    }

    #[test]
    fn test_s1_failure_is_fatal_for_h1() {
        let backend = Arc::new(RecordingBackend::new().fail_on(Operation::LoadProgram, "s1"));
        let err = Orchestrator::new(backend.clone())
            .deploy(Arc::new(source_routing()), AssignmentStrategy::Mixed, AddressPool::default())
            .err()
            .unwrap();

        assert_eq!(err.stage, LifecycleState::ProgramsLoaded);
        match &err.cause {
            FailureCause::DependencyLost { host, switches, .. } => {
                assert_eq!(host, "h1");
                assert_eq!(switches, &vec!["s1".to_string()]);
            }
            other => panic!("unexpected cause: {}", other),
        }
        assert_eq!(backend.live_contexts(), 0);
        assert!(backend.targets_of(Operation::StartNode).is_empty());
    }

    #[test]
    fn test_teardown_order_is_reversed() {
        let backend = Arc::new(RecordingBackend::new());
        let mut deployment = Orchestrator::new(backend.clone())
            .deploy(Arc::new(source_routing()), AssignmentStrategy::Mixed, AddressPool::default())
            .unwrap();
        let wired: Vec<String> = deployment
            .runtime()
            .links()
            .iter()
            .map(|l| format!("{}<->{}", l.left.interface, l.right.interface))
            .collect();
        assert_eq!(wired.len(), 6);
        deployment.shutdown();

        let events = backend.events();
        let position = |op: Operation| events.iter().position(|e| e.operation == op).unwrap();
        let last = |op: Operation| events.iter().rposition(|e| e.operation == op).unwrap();

        assert!(last(Operation::StopNode) < position(Operation::DeleteLink));
        assert!(last(Operation::DeleteLink) < position(Operation::DestroyContext));

        let mut deleted = backend.targets_of(Operation::DeleteLink);
        deleted.reverse();
        assert_eq!(deleted, wired);
    }

    #[test]
    fn test_dry_run_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
network:
  backend: dry_run
  strategy: l3
  address_pool: {{ base: 192.168.0.0, pool_prefix: 20, subnet_prefix: 30 }}
nodes:
  - {{ name: s1, kind: switch }}
  - {{ name: h1, kind: host, startup_script: h1.sh }}
  - {{ name: h2, kind: host }}
links:
  - [h1, s1]
  - [s1, h2]
"#
        )
        .unwrap();

        let (config, graph) = load_topology(file.path()).unwrap();
        let deployment = Orchestrator::new(Arc::new(RecordingBackend::new()))
            .deploy(Arc::new(graph), config.network.strategy, config.network.address_pool)
            .unwrap();

        let plan = deployment.assignment();
        assert_eq!(plan.subnets().len(), 2);
        assert_eq!(plan.subnets()[1].cidr(), "192.168.0.4/30");
        let h2 = plan.interfaces().iter().find(|i| i.name == "h2-eth0").unwrap();
        assert_eq!(h2.cidr().as_deref(), Some("192.168.0.6/30"));
        assert_eq!(h2.gateway.map(|g| g.to_string()).as_deref(), Some("192.168.0.5"));
    }
}

//! Inspection console.
//!
//! A line-oriented prompt available while the network is running. It only
//! reads deployment state; `exit`, end of input or cancellation of the
//! deployment returns control to the caller, which then shuts the network
//! down.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::orchestrator::Deployment;

const PROMPT: &str = "p4net> ";

/// How often a waiting console checks for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(100);

const HELP: &str = "Commands:\n  nodes          list nodes and their status\n  links          list links, their interfaces and state\n  addr [node]    show interface addresses\n  degraded       list degraded nodes\n  help           show this text\n  exit           leave the console and stop the network";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Nodes,
    Links,
    Addr(Option<String>),
    Degraded,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parse one input line; `Ok(None)` for a blank line
    pub fn parse(input: &str) -> Result<Option<Self>, String> {
        let mut words = input.split_whitespace();
        let Some(first) = words.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = words.collect();

        let command = match (first, rest.as_slice()) {
            ("nodes", []) => ConsoleCommand::Nodes,
            ("links", []) => ConsoleCommand::Links,
            ("addr", []) => ConsoleCommand::Addr(None),
            ("addr", [node]) => ConsoleCommand::Addr(Some(node.to_string())),
            ("degraded", []) => ConsoleCommand::Degraded,
            ("help", []) | ("?", []) => ConsoleCommand::Help,
            ("exit", []) | ("quit", []) => ConsoleCommand::Exit,
            _ => return Err(format!("Unknown command '{}', type 'help'", input.trim())),
        };
        Ok(Some(command))
    }
}

/// Write the response to `command`
pub fn execute<W: Write>(deployment: &Deployment, command: &ConsoleCommand, out: &mut W) -> io::Result<()> {
    let graph = deployment.graph();
    match command {
        ConsoleCommand::Nodes => {
            for node in graph.nodes() {
                let status = deployment
                    .node_status(&node.name)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let program = node
                    .program()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                writeln!(out, "{:<10} {:<6} {:<14} {}", node.name, node.kind().to_string(), status, program)?;
            }
        }
        ConsoleCommand::Links => {
            let wired = deployment.runtime().links();
            for link in graph.links() {
                let state = if wired.iter().any(|w| w.id == link.id) { "up" } else { "down" };
                writeln!(out, "{:<12} <-> {:<12} {}", link.left.name, link.right.name, state)?;
            }
        }
        ConsoleCommand::Addr(filter) => {
            let node = match filter {
                Some(name) => match graph.node_by_name(name) {
                    Some(node) => Some(node.id),
                    None => return writeln!(out, "Unknown node '{}'", name),
                },
                None => None,
            };
            for iface in deployment.assignment().interfaces() {
                if node.is_some_and(|id| id != iface.node) {
                    continue;
                }
                let cidr = iface.cidr().unwrap_or_else(|| "-".to_string());
                match iface.gateway {
                    Some(gateway) => writeln!(out, "{:<12} {} {:<18} via {}", iface.name, iface.mac, cidr, gateway)?,
                    None => writeln!(out, "{:<12} {} {}", iface.name, iface.mac, cidr)?,
                }
            }
        }
        ConsoleCommand::Degraded => {
            if deployment.degraded().is_empty() {
                writeln!(out, "No degraded nodes")?;
            }
            for degraded in deployment.degraded() {
                writeln!(out, "{}: {}", degraded.node, degraded.cause)?;
                if !degraded.notified.is_empty() {
                    writeln!(out, "  notified: {}", degraded.notified.join(", "))?;
                }
            }
        }
        ConsoleCommand::Help => writeln!(out, "{}", HELP)?,
        ConsoleCommand::Exit => {}
    }
    Ok(())
}

/// Read commands from `input` until `exit`, end of input or cancellation.
///
/// Input is read on a detached thread so a pending read never keeps the
/// console from noticing that the deployment was cancelled.
pub fn run<R, W>(deployment: &Deployment, input: R, mut output: W) -> io::Result<()>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let cancel = deployment.cancel_token();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in input.lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        write!(output, "{}", PROMPT)?;
        output.flush()?;

        let line = loop {
            if cancel.is_cancelled() {
                writeln!(output)?;
                writeln!(output, "Cancelled, stopping the network")?;
                return Ok(());
            }
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(line) => break line,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    writeln!(output)?;
                    return Ok(());
                }
            }
        };
        match ConsoleCommand::parse(&line?) {
            Ok(Some(ConsoleCommand::Exit)) => return Ok(()),
            Ok(Some(command)) => execute(deployment, &command, &mut output)?,
            Ok(None) => {}
            Err(message) => writeln!(output, "{}", message)?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::{Operation, RecordingBackend};
    use crate::ip::{AddressPool, AssignmentStrategy};
    use crate::orchestrator::Orchestrator;
    use crate::topology::{NodeOptions, NodeRole, TopologyBuilder};
    use std::io::{BufReader, Cursor, Read};
    use std::sync::Arc;
    use std::time::Instant;

    /// Input that never delivers a line, like a terminal nobody types into
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_secs(30));
            Ok(0)
        }
    }

    fn deployment(backend: RecordingBackend) -> Deployment {
        let mut builder = TopologyBuilder::new();
        builder.add_node("s1", NodeRole::switch(), NodeOptions::default()).unwrap();
        builder.add_node("s2", NodeRole::switch(), NodeOptions::default()).unwrap();
        builder.add_node("h1", NodeRole::host(), NodeOptions::default()).unwrap();
        builder.add_link("h1", "s1").unwrap();
        builder.add_link("s1", "s2").unwrap();
        Orchestrator::new(Arc::new(backend))
            .deploy(Arc::new(builder.build()), AssignmentStrategy::Mixed, AddressPool::default())
            .unwrap()
    }

    fn session(deployment: &Deployment, input: &str) -> String {
        let mut output = Vec::new();
        run(deployment, Cursor::new(input.to_string()), &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("  nodes "), Ok(Some(ConsoleCommand::Nodes)));
        assert_eq!(ConsoleCommand::parse("addr h1"), Ok(Some(ConsoleCommand::Addr(Some("h1".to_string())))));
        assert_eq!(ConsoleCommand::parse(""), Ok(None));
        assert!(ConsoleCommand::parse("nodes extra").is_err());
        assert!(ConsoleCommand::parse("reboot").is_err());
    }

    #[test]
    fn test_session_lists_topology() {
        let deployment = deployment(RecordingBackend::new());
        let output = session(&deployment, "nodes\nlinks\naddr h1\nexit\nnodes\n");

        assert!(output.contains("s1         switch started"));
        assert!(output.contains("h1-eth0      <-> s1-eth1      up"));
        assert!(output.contains("h1-eth0      02:00:00:02:00:00 10.0.0.1/24"));
        // Nothing after exit is executed
        assert_eq!(output.matches("s1         switch").count(), 1);
    }

    #[test]
    fn test_session_ends_at_eof() {
        let deployment = deployment(RecordingBackend::new());
        let output = session(&deployment, "help\n");
        assert!(output.contains("addr [node]"));
        assert!(output.ends_with("p4net> \n"));
    }

    #[test]
    fn test_degraded_and_unknown_node() {
        let deployment = deployment(RecordingBackend::new().fail_on(Operation::LoadProgram, "s2"));
        let output = session(&deployment, "degraded\naddr s9\nbogus\n");

        assert!(output.contains("s2: Failed to load program on s2"));
        assert!(output.contains("  notified: s1"));
        assert!(output.contains("Unknown node 's9'"));
        assert!(output.contains("Unknown command 'bogus'"));
    }

    #[test]
    fn test_cancellation_ends_waiting_session() {
        let deployment = deployment(RecordingBackend::new());
        let cancel = deployment.cancel_token();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let started = Instant::now();
        let mut output = Vec::new();
        run(&deployment, BufReader::new(Silent), &mut output).unwrap();
        canceller.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(String::from_utf8(output).unwrap().contains("Cancelled, stopping the network"));
    }
}

//! Linux network namespace backend.
//!
//! Every node gets its own namespace (`p4n-<node>`). Links are veth pairs
//! created directly inside both namespaces, switches run bmv2
//! `simple_switch` inside theirs and are populated through
//! `simple_switch_CLI`. Programs with a `.p4` extension are compiled once
//! with `p4c` into `<output_dir>/build`; anything else is taken to be an
//! already compiled bmv2 JSON file.
//!
//! All privileged commands go through `sudo` unless [`NetnsOptions::sudo`]
//! is cleared (e.g. when already running as root).

use std::collections::HashMap;
use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::{BackendError, EmulationBackend, Instrumentation, LinkEnd, NodeContext, PortBinding};
use crate::ip::InterfaceAssignment;
use crate::topology::Node;
use crate::utils::lock;

const NAMESPACE_PREFIX: &str = "p4n-";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Tools and locations used by [`NetnsBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetnsOptions {
    /// Root for build artifacts, packet captures and switch logs
    pub output_dir: PathBuf,
    pub switch_binary: String,
    pub cli_binary: String,
    pub compiler: String,
    /// Thrift port of the switch with node index 0; others follow sequentially
    pub thrift_base_port: u16,
    /// How long a switch may take to accept CLI connections
    pub ready_timeout: Duration,
    pub sudo: bool,
}

impl Default for NetnsOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./emulation"),
            switch_binary: "simple_switch".to_string(),
            cli_binary: "simple_switch_CLI".to_string(),
            compiler: "p4c".to_string(),
            thrift_base_port: 9090,
            ready_timeout: Duration::from_secs(5),
            sudo: true,
        }
    }
}

/// Namespace name owned by a node
pub fn namespace_name(node_name: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, node_name)
}

/// Emulation on the local Linux kernel
pub struct NetnsBackend {
    options: NetnsOptions,
    /// Running switch processes by node name
    switches: Mutex<HashMap<String, Child>>,
    /// Compiled JSON per P4 source
    compiled: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl NetnsBackend {
    pub fn new(options: NetnsOptions) -> Self {
        Self {
            options,
            switches: Mutex::new(HashMap::new()),
            compiled: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &NetnsOptions {
        &self.options
    }

    /// Command for `program`, wrapped in sudo when configured
    fn privileged(&self, program: &str, args: &[&str]) -> (Command, String) {
        let mut rendered = format!("{} {}", program, args.join(" "));
        let mut command = if self.options.sudo {
            rendered.insert_str(0, "sudo ");
            let mut c = Command::new("sudo");
            c.arg(program);
            c
        } else {
            Command::new(program)
        };
        command.args(args);
        (command, rendered)
    }

    /// Command for `program` running inside `namespace`
    fn in_namespace(&self, namespace: &str, program: &str, args: &[&str]) -> (Command, String) {
        let mut full = vec!["netns", "exec", namespace, program];
        full.extend_from_slice(args);
        self.privileged("ip", &full)
    }

    /// Run a privileged command, failing on a non-zero exit
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<Output, BackendError> {
        let (mut command, rendered) = self.privileged(program, args);
        debug!("{}", rendered);
        checked(output_of(&mut command, &rendered)?, &rendered)
    }

    /// Run a command inside `namespace`, failing on a non-zero exit
    fn exec_checked(&self, namespace: &str, program: &str, args: &[&str]) -> Result<Output, BackendError> {
        let (mut command, rendered) = self.in_namespace(namespace, program, args);
        debug!("{}", rendered);
        checked(output_of(&mut command, &rendered)?, &rendered)
    }

    fn thrift_port(&self, node: &Node) -> u16 {
        let offset = u16::try_from(node.id.0).unwrap_or(u16::MAX);
        self.options.thrift_base_port.saturating_add(offset)
    }

    /// Arguments for `simple_switch`, excluding the binary itself
    fn switch_args(&self, node: &Node, context: &NodeContext, ports: &[PortBinding], json: &Path) -> Vec<String> {
        let mut args = vec![
            "--device-id".to_string(),
            node.id.0.to_string(),
            "--thrift-port".to_string(),
            self.thrift_port(node).to_string(),
        ];
        for port in ports {
            args.push("-i".to_string());
            args.push(format!("{}@{}", port.index, port.interface));
        }
        if context.instrumentation.pcap {
            args.push("--pcap".to_string());
            args.push(self.options.output_dir.join("pcap").display().to_string());
        }
        if context.instrumentation.log {
            args.push("--log-file".to_string());
            args.push(self.options.output_dir.join("log").join(&node.name).display().to_string());
            args.push("--log-flush".to_string());
        }
        args.push(json.display().to_string());
        args
    }

    /// Compile `source` with p4c unless it already is a JSON file
    fn compiled_program(&self, source: &Path) -> Result<PathBuf, BackendError> {
        if source.extension().and_then(|e| e.to_str()) != Some("p4") {
            return Ok(source.to_path_buf());
        }

        // Held across compilation so concurrent switches sharing a source compile it once
        let mut cache = lock(&self.compiled);
        if let Some(json) = cache.get(source) {
            return Ok(json.clone());
        }

        let build_dir = self.options.output_dir.join("build");
        create_dir(&build_dir)?;
        let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("program");
        let json = build_dir.join(format!("{}.json", stem));

        let build_arg = build_dir.display().to_string();
        let source_arg = source.display().to_string();
        let args = ["--target", "bmv2", "--arch", "v1model", "-o", build_arg.as_str(), source_arg.as_str()];
        let rendered = format!("{} {}", self.options.compiler, args.join(" "));
        info!("Compiling {}", source.display());
        let mut command = Command::new(&self.options.compiler);
        command.args(args);
        checked(output_of(&mut command, &rendered)?, &rendered)?;

        cache.insert(source.to_path_buf(), json.clone());
        Ok(json)
    }

    fn start_switch(&self, context: &NodeContext, node: &Node, ports: &[PortBinding]) -> Result<(), BackendError> {
        let program = node
            .program()
            .ok_or_else(|| BackendError::NoProgram { node: node.name.clone() })?;
        require_file(program)?;
        if let Some(cli_input) = node.cli_input() {
            require_file(cli_input)?;
        }
        if context.instrumentation.pcap {
            create_dir(&self.options.output_dir.join("pcap"))?;
        }
        if context.instrumentation.log {
            create_dir(&self.options.output_dir.join("log"))?;
        }

        let json = self.compiled_program(program)?;
        let args = self.switch_args(node, context, ports, &json);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let (mut command, rendered) = self.in_namespace(&context.namespace, &self.options.switch_binary, &arg_refs);
        debug!("{}", rendered);

        let mut child = command
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| BackendError::Spawn { command: rendered.clone(), source })?;
        info!("Started {} for {} (pid {})", self.options.switch_binary, node.name, child.id());

        let port = self.thrift_port(node);
        let populated = self
            .wait_until_ready(context, port, &mut child)
            .and_then(|()| match node.cli_input() {
                Some(cli_input) => self.populate_tables(context, port, cli_input),
                None => Ok(()),
            });

        match populated {
            Ok(()) => {
                lock(&self.switches).insert(node.name.clone(), child);
                Ok(())
            }
            Err(e) => {
                self.terminate(&mut child);
                Err(e)
            }
        }
    }

    /// Poll the switch with an empty CLI session until it accepts connections
    fn wait_until_ready(&self, context: &NodeContext, port: u16, child: &mut Child) -> Result<(), BackendError> {
        let port = port.to_string();
        let deadline = Instant::now() + self.options.ready_timeout;
        loop {
            if let Ok(Some(_)) = child.try_wait() {
                return Err(BackendError::ProcessExited { node: context.node_name.clone() });
            }

            let (mut command, _) =
                self.in_namespace(&context.namespace, &self.options.cli_binary, &["--thrift-port", port.as_str()]);
            let ready = command
                .stdin(Stdio::null())
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if ready {
                debug!("{} accepts CLI connections on port {}", context.node_name, port);
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(BackendError::NotReady {
                    node: context.node_name.clone(),
                    timeout: self.options.ready_timeout,
                });
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
    }

    /// Feed the CLI command file to the running switch
    fn populate_tables(&self, context: &NodeContext, port: u16, cli_input: &Path) -> Result<(), BackendError> {
        let port = port.to_string();
        let input = File::open(cli_input).map_err(|source| BackendError::Io { path: cli_input.to_path_buf(), source })?;
        let (mut command, rendered) =
            self.in_namespace(&context.namespace, &self.options.cli_binary, &["--thrift-port", port.as_str()]);
        let output = checked(output_of(command.stdin(input), &rendered)?, &rendered)?;

        // simple_switch_CLI exits 0 even when individual commands fail
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(line) = stdout.lines().find(|l| l.contains("Error")) {
            return Err(BackendError::CommandFailed {
                command: format!("{} < {}", rendered, cli_input.display()),
                stderr: line.trim().to_string(),
            });
        }
        info!("Loaded {} into {}", cli_input.display(), context.node_name);
        Ok(())
    }

    fn run_startup_script(&self, context: &NodeContext, script: &Path) -> Result<(), BackendError> {
        require_file(script)?;
        let script_arg = script.display().to_string();
        self.exec_checked(&context.namespace, "sh", &[script_arg.as_str()])?;
        info!("Ran {} on {}", script.display(), context.node_name);
        Ok(())
    }

    /// SIGTERM the process group, then SIGKILL after a grace period
    fn terminate(&self, child: &mut Child) {
        let group = format!("-{}", child.id());
        let _ = self.privileged("kill", &["-TERM", "--", group.as_str()]).0.output();
        thread::sleep(STOP_GRACE);
        if child.try_wait().ok().flatten().is_none() {
            let _ = self.privileged("kill", &["-KILL", "--", group.as_str()]).0.output();
        }
        let _ = child.wait();
    }
}

impl EmulationBackend for NetnsBackend {
    fn name(&self) -> &'static str {
        "netns"
    }

    fn create_context(&self, node: &Node, instrumentation: Instrumentation) -> Result<NodeContext, BackendError> {
        let namespace = namespace_name(&node.name);

        // Stale namespace from an interrupted run
        let _ = self.run_checked("ip", &["netns", "del", namespace.as_str()]);
        self.run_checked("ip", &["netns", "add", namespace.as_str()])?;

        let context = NodeContext { node: node.id, node_name: node.name.clone(), namespace, instrumentation };
        if let Err(e) = self.exec_checked(&context.namespace, "ip", &["link", "set", "lo", "up"]) {
            let _ = self.destroy_context(&context);
            return Err(e);
        }
        if node.is_host() {
            let _ = self.exec_checked(&context.namespace, "sysctl", &["-qw", "net.ipv6.conf.all.disable_ipv6=1"]);
        }
        debug!("Created namespace {}", context.namespace);
        Ok(context)
    }

    fn destroy_context(&self, context: &NodeContext) -> Result<(), BackendError> {
        self.stop_node(context)?;
        match self.run_checked("ip", &["netns", "del", context.namespace.as_str()]) {
            Ok(_) => {
                debug!("Deleted namespace {}", context.namespace);
                Ok(())
            }
            Err(BackendError::CommandFailed { stderr, .. }) if stderr.contains("No such file") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn create_link(&self, left: &LinkEnd<'_>, right: &LinkEnd<'_>) -> Result<(), BackendError> {
        let args = veth_args(left, right);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.run_checked("ip", &arg_refs) {
            Ok(_) => {
                debug!("Created veth {} <-> {}", left.interface, right.interface);
                Ok(())
            }
            Err(e) => {
                // A half-created pair is removed with either end
                let _ = self.exec_checked(&left.context.namespace, "ip", &["link", "del", left.interface]);
                Err(e)
            }
        }
    }

    fn delete_link(&self, left: &LinkEnd<'_>, _right: &LinkEnd<'_>) -> Result<(), BackendError> {
        match self.exec_checked(&left.context.namespace, "ip", &["link", "del", left.interface]) {
            Ok(_) => Ok(()),
            Err(BackendError::CommandFailed { stderr, .. }) if stderr.contains("Cannot find device") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn configure_interface(
        &self,
        context: &NodeContext,
        interface: &InterfaceAssignment,
    ) -> Result<(), BackendError> {
        let ns = context.namespace.as_str();
        let name = interface.name.as_str();
        let mac = interface.mac.to_string();
        self.exec_checked(ns, "ip", &["link", "set", "dev", name, "address", mac.as_str(), "up"])?;

        if let Some(cidr) = interface.cidr() {
            self.exec_checked(ns, "ip", &["addr", "add", cidr.as_str(), "dev", name])?;
        }
        if let Some(gateway) = interface.gateway {
            let gateway = gateway.to_string();
            self.exec_checked(ns, "ip", &["route", "replace", "default", "via", gateway.as_str(), "dev", name])?;
        }
        Ok(())
    }

    fn load_program(&self, context: &NodeContext, node: &Node, ports: &[PortBinding]) -> Result<(), BackendError> {
        if node.is_switch() {
            self.start_switch(context, node, ports)
        } else {
            match node.program() {
                Some(script) => self.run_startup_script(context, script),
                None => Ok(()),
            }
        }
    }

    fn start_node(&self, context: &NodeContext, node: &Node) -> Result<(), BackendError> {
        if !node.is_switch() {
            return Ok(());
        }
        let mut switches = lock(&self.switches);
        let child = switches
            .get_mut(&node.name)
            .ok_or_else(|| BackendError::ProcessExited { node: context.node_name.clone() })?;
        match child.try_wait() {
            Ok(None) => Ok(()),
            _ => {
                switches.remove(&node.name);
                Err(BackendError::ProcessExited { node: context.node_name.clone() })
            }
        }
    }

    fn stop_node(&self, context: &NodeContext) -> Result<(), BackendError> {
        let child = lock(&self.switches).remove(&context.node_name);
        if let Some(mut child) = child {
            info!("Stopping {}", context.node_name);
            self.terminate(&mut child);
        }
        Ok(())
    }
}

impl Drop for NetnsBackend {
    fn drop(&mut self) {
        let children: Vec<(String, Child)> = lock(&self.switches).drain().collect();
        for (name, mut child) in children {
            warn!("Switch {} still running at shutdown, killing it", name);
            self.terminate(&mut child);
        }
    }
}

/// `ip` arguments creating a veth pair with one end in each namespace
fn veth_args(left: &LinkEnd<'_>, right: &LinkEnd<'_>) -> Vec<String> {
    vec![
        "link".to_string(),
        "add".to_string(),
        left.interface.to_string(),
        "address".to_string(),
        left.mac.to_string(),
        "netns".to_string(),
        left.context.namespace.clone(),
        "type".to_string(),
        "veth".to_string(),
        "peer".to_string(),
        "name".to_string(),
        right.interface.to_string(),
        "address".to_string(),
        right.mac.to_string(),
        "netns".to_string(),
        right.context.namespace.clone(),
    ]
}

fn output_of(command: &mut Command, rendered: &str) -> Result<Output, BackendError> {
    command
        .output()
        .map_err(|source| BackendError::Spawn { command: rendered.to_string(), source })
}

fn checked(output: Output, rendered: &str) -> Result<Output, BackendError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(BackendError::CommandFailed {
            command: rendered.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn require_file(path: &Path) -> Result<(), BackendError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BackendError::MissingFile { path: path.to_path_buf() })
    }
}

fn create_dir(path: &Path) -> Result<(), BackendError> {
    fs::create_dir_all(path).map_err(|source| BackendError::Io { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::MacAddr;
    use crate::topology::{NodeId, NodeOptions, NodeRole};

    fn switch(id: usize, name: &str, program: Option<PathBuf>, cli_input: Option<PathBuf>) -> Node {
        Node {
            id: NodeId(id),
            name: name.to_string(),
            role: NodeRole::Switch { program, cli_input },
            options: NodeOptions::default(),
        }
    }

    fn context(node: &Node, instrumentation: Instrumentation) -> NodeContext {
        NodeContext {
            node: node.id,
            node_name: node.name.clone(),
            namespace: namespace_name(&node.name),
            instrumentation,
        }
    }

    #[test]
    fn test_veth_args_place_ends_in_namespaces() {
        let h1 = switch(0, "h1", None, None);
        let s1 = switch(1, "s1", None, None);
        let (a, b) = (context(&h1, Instrumentation::default()), context(&s1, Instrumentation::default()));
        let left = LinkEnd { context: &a, interface: "h1-eth0", mac: MacAddr([2, 0, 0, 0, 0, 0]) };
        let right = LinkEnd { context: &b, interface: "s1-eth1", mac: MacAddr([2, 0, 0, 1, 0, 0]) };

        let args = veth_args(&left, &right).join(" ");
        assert_eq!(
            args,
            "link add h1-eth0 address 02:00:00:00:00:00 netns p4n-h1 type veth \
             peer name s1-eth1 address 02:00:00:01:00:00 netns p4n-s1"
        );
    }

    #[test]
    fn test_switch_args_include_ports_and_instrumentation() {
        let backend = NetnsBackend::new(NetnsOptions { output_dir: PathBuf::from("/out"), ..NetnsOptions::default() });
        let node = switch(3, "s4", None, None);
        let ctx = context(&node, Instrumentation { pcap: true, log: true });
        let ports = vec![
            PortBinding { index: 1, interface: "s4-eth1".to_string() },
            PortBinding { index: 2, interface: "s4-eth2".to_string() },
        ];

        let args = backend.switch_args(&node, &ctx, &ports, Path::new("/out/build/p.json")).join(" ");
        assert_eq!(
            args,
            "--device-id 3 --thrift-port 9093 -i 1@s4-eth1 -i 2@s4-eth2 \
             --pcap /out/pcap --log-file /out/log/s4 --log-flush /out/build/p.json"
        );

        let quiet = context(&node, Instrumentation::default());
        let args = backend.switch_args(&node, &quiet, &[], Path::new("p.json"));
        assert!(!args.contains(&"--pcap".to_string()));
        assert!(!args.contains(&"--log-file".to_string()));
    }

    #[test]
    fn test_sudo_prefix_is_optional() {
        let with = NetnsBackend::new(NetnsOptions::default());
        assert_eq!(with.in_namespace("p4n-h1", "ip", &["link"]).1, "sudo ip netns exec p4n-h1 ip link");

        let without = NetnsBackend::new(NetnsOptions { sudo: false, ..NetnsOptions::default() });
        assert_eq!(without.privileged("ip", &["netns", "add", "x"]).1, "ip netns add x");
    }

    #[test]
    fn test_compiled_json_is_used_directly() {
        let backend = NetnsBackend::new(NetnsOptions::default());
        let json = backend.compiled_program(Path::new("build/source_routing.json")).unwrap();
        assert_eq!(json, PathBuf::from("build/source_routing.json"));
    }

    #[test]
    fn test_switch_without_program_fails_before_spawning() {
        let backend = NetnsBackend::new(NetnsOptions::default());
        let node = switch(0, "s1", None, None);
        let err = backend.load_program(&context(&node, Instrumentation::default()), &node, &[]).unwrap_err();
        assert!(matches!(err, BackendError::NoProgram { .. }));

        let missing = switch(0, "s1", Some(PathBuf::from("/nonexistent/p.json")), None);
        let err = backend.load_program(&context(&missing, Instrumentation::default()), &missing, &[]).unwrap_err();
        assert!(matches!(err, BackendError::MissingFile { .. }));
    }

    #[test]
    fn test_missing_cli_input_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("p.json");
        fs::write(&program, "{}").unwrap();

        let backend = NetnsBackend::new(NetnsOptions::default());
        let node = switch(0, "s1", Some(program), Some(dir.path().join("s1-commands.txt")));
        let err = backend.load_program(&context(&node, Instrumentation::default()), &node, &[]).unwrap_err();
        assert!(matches!(err, BackendError::MissingFile { path } if path.ends_with("s1-commands.txt")));
    }
}

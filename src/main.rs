use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use env_logger::Env;
use log::{info, warn, LevelFilter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use p4net::config::BackendKind;
use p4net::emulation::{EmulationBackend, NetnsBackend, RecordingBackend};
use p4net::ip::assign_addresses;
use p4net::orchestrator::{Orchestrator, RunOutcome};
use p4net::{config_loader, console};

/// Build and run an emulated P4 network from a topology description
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the topology YAML file
    #[arg(short, long)]
    config: PathBuf,

    /// Record backend actions instead of performing them
    #[arg(long)]
    dry_run: bool,

    /// Compute and print the address plan, then exit
    #[arg(long)]
    plan_only: bool,

    /// Write the address plan as JSON to this file
    #[arg(long)]
    plan_output: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Do not open the console even if the topology enables it
    #[arg(long)]
    no_cli: bool,

    /// Number of worker threads for parallel stages
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    // RUST_LOG wins over the topology's log level; until the topology is
    // loaded the global level is info
    let rust_log = std::env::var_os(env_logger::DEFAULT_FILTER_ENV).is_some();
    env_logger::Builder::from_env(Env::default().default_filter_or("trace")).init();
    if !rust_log {
        log::set_max_level(LevelFilter::Info);
    }

    let (config, graph) = config_loader::load_topology(&args.config)?;

    if let Some(level) = topology_log_level(rust_log, &config.network.log_level) {
        log::set_max_level(level);
    }

    info!("Topology file: {:?}", args.config);
    info!(
        "{} nodes, {} links, {} strategy",
        graph.nodes().len(),
        graph.links().len(),
        config.network.strategy
    );

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .wrap_err("Failed to configure worker threads")?;
    }

    let strategy = config.network.strategy;
    let pool = config.network.address_pool;

    if args.plan_only || args.plan_output.is_some() {
        let plan = assign_addresses(&graph, strategy, pool).wrap_err("Failed to compute the address plan")?;
        let json = serde_json::to_string_pretty(&plan)?;
        match &args.plan_output {
            Some(path) => {
                write_file(path, &json)?;
                info!("Address plan written to {:?}", path);
            }
            None => println!("{}", json),
        }
        if args.plan_only {
            return Ok(());
        }
    }

    let dry_run = args.dry_run || config.network.backend == BackendKind::DryRun;
    let backend: Arc<dyn EmulationBackend> = if dry_run {
        Arc::new(RecordingBackend::new())
    } else {
        Arc::new(NetnsBackend::new(config.netns_options()))
    };
    info!("Using the {} backend", backend.name());

    let orchestrator = Orchestrator::new(backend);
    let cancel = orchestrator.cancel_token();
    ctrlc::set_handler(move || {
        warn!("Interrupted, tearing the network down");
        cancel.cancel();
    })
    .wrap_err("Failed to install the signal handler")?;

    let mut deployment = match orchestrator.deploy(Arc::new(graph), strategy, pool) {
        Ok(deployment) => deployment,
        Err(e) => {
            for failure in &e.teardown_errors {
                warn!("Left behind after teardown: {}", failure);
            }
            return Err(e).wrap_err("Deployment failed");
        }
    };

    if config.network.cli && !args.no_cli {
        console::run(&deployment, io::BufReader::new(io::stdin()), io::stdout()).wrap_err("Console failed")?;
    }

    let teardown = deployment.shutdown();
    if !teardown.is_clean() {
        warn!("{} resource(s) could not be released", teardown.failures.len());
    }

    let report = deployment.report();
    if let Some(path) = &args.report {
        write_file(path, &serde_json::to_string_pretty(&report)?)?;
        info!("Run report written to {:?}", path);
    }

    let outcome = report.outcome();
    info!("Run finished: {:?}", outcome);
    if outcome != RunOutcome::Healthy {
        std::process::exit(outcome.exit_code());
    }
    Ok(())
}

/// Level to apply once the topology is loaded; `None` when RUST_LOG decides
fn topology_log_level(rust_log: bool, configured: &str) -> Option<LevelFilter> {
    if rust_log {
        return None;
    }
    Some(configured.parse().unwrap_or(LevelFilter::Info))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Failed to create directory '{}'", parent.display()))?;
    }
    fs::write(path, contents).wrap_err_with(|| format!("Failed to write '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let args = Args::parse_from(["p4net", "--config", "topology.yaml"]);

        assert_eq!(args.config, PathBuf::from("topology.yaml"));
        assert!(!args.dry_run);
        assert!(!args.plan_only);
        assert!(args.plan_output.is_none());
        assert!(args.threads.is_none());
    }

    #[test]
    fn test_plan_and_run_flags() {
        let args = Args::parse_from([
            "p4net",
            "-c",
            "topology.yaml",
            "--dry-run",
            "--plan-output",
            "plan.json",
            "--report",
            "report.json",
            "--no-cli",
            "--threads",
            "4",
        ]);

        assert!(args.dry_run);
        assert!(args.no_cli);
        assert_eq!(args.plan_output, Some(PathBuf::from("plan.json")));
        assert_eq!(args.report, Some(PathBuf::from("report.json")));
        assert_eq!(args.threads, Some(4));
    }

    #[test]
    fn test_config_is_required() {
        assert!(Args::try_parse_from(["p4net", "--dry-run"]).is_err());
    }

    #[test]
    fn test_topology_log_level() {
        assert_eq!(topology_log_level(false, "debug"), Some(LevelFilter::Debug));
        assert_eq!(topology_log_level(false, "WARN"), Some(LevelFilter::Warn));
        assert_eq!(topology_log_level(true, "debug"), None);
    }

    #[test]
    fn test_write_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("plan.json");
        write_file(&path, "{}").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "{}");
    }
}

use crate::config::TopologyConfig;
use crate::topology::TopologyGraph;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{debug, info};
use std::fs::File;
use std::path::Path;

/// Load, parse and validate a topology description from a YAML file
pub fn load_config(config_path: &Path) -> Result<TopologyConfig> {
    info!("Loading topology from: {:?}", config_path);

    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open topology file {:?}", config_path))?;

    let config: TopologyConfig = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse topology file {:?}", config_path))?;

    config
        .validate()
        .wrap_err_with(|| format!("Invalid topology file {:?}", config_path))?;

    debug!(
        "Parsed {} nodes and {} links (strategy: {})",
        config.nodes.len(),
        config.links.len(),
        config.network.strategy
    );
    Ok(config)
}

/// Load a topology file and build its graph
pub fn load_topology(config_path: &Path) -> Result<(TopologyConfig, TopologyGraph)> {
    let config = load_config(config_path)?;
    let graph = config
        .to_graph()
        .wrap_err_with(|| format!("Invalid topology in {:?}", config_path))?;
    Ok((config, graph))
}

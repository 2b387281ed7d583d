pub mod caps;
pub mod config;
pub mod dedup;
pub mod history;
pub mod stats;

use anyhow::Context;
use hunt_core::config::Config;
use hunt_core::services::HuntServices;
use std::path::Path;

/// Load the config and open the state database under `root`.
pub fn open_services(root: &Path) -> anyhow::Result<(Config, HuntServices)> {
    let config = Config::load(root).context("failed to load config")?;
    let services = HuntServices::open(root, &config).context("failed to open state database")?;
    Ok((config, services))
}

use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use hunt_core::config::{Config, InstanceConfig, WarnLevel};
use hunt_core::paths;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a default .hunt/config.yaml
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Validate the config for common mistakes
    Validate,

    /// Show configured services and instances (API keys masked)
    Show,

    /// Add an instance to a service, creating the service if needed
    AddInstance {
        /// Service slug, e.g. radarr
        service: String,
        /// Instance display name
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        key: String,
        /// Items to upgrade per cycle
        #[arg(long, default_value_t = 0)]
        upgrade: i64,
        /// Missing items to search per cycle
        #[arg(long, default_value_t = 1)]
        missing: i64,
        /// Add the instance disabled
        #[arg(long)]
        disabled: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Init { force } => init(root, force),
        ConfigSubcommand::Validate => validate(root, json),
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::AddInstance {
            service,
            name,
            url,
            key,
            upgrade,
            missing,
            disabled,
        } => {
            let mut inst = InstanceConfig::new(name, url, key);
            inst.hunt_upgrade_items = upgrade;
            inst.hunt_missing_items = missing;
            inst.enabled = !disabled;
            add_instance(root, &service, inst)
        }
    }
}

fn init(root: &Path, force: bool) -> anyhow::Result<()> {
    let path = paths::config_path(root);
    if path.exists() && !force {
        println!("Already initialized: {}", path.display());
        return Ok(());
    }
    Config::default()
        .save(root)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Initialized {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn mask(key: &str) -> String {
    let n = key.chars().count();
    if n <= 4 {
        return "****".to_string();
    }
    let tail: String = key.chars().skip(n - 4).collect();
    format!("****{tail}")
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let mut config = Config::load(root).context("failed to load config")?;
    for svc in config.services.values_mut() {
        for inst in &mut svc.instances {
            inst.api_key = mask(&inst.api_key);
        }
    }

    if json {
        return print_json(&config);
    }

    let g = &config.general;
    println!(
        "retention: {}h  sleep: {}s  api timeout: {}s",
        g.stateful_management_hours, g.sleep_duration_secs, g.api_timeout_secs
    );
    if config.services.is_empty() {
        println!("No services configured.");
        return Ok(());
    }
    let rows = config
        .instances()
        .map(|(service, svc, inst)| {
            vec![
                service.to_string(),
                inst.name.clone(),
                if inst.enabled { "yes" } else { "no" }.to_string(),
                inst.api_url.clone(),
                inst.api_key.clone(),
                inst.hunt_upgrade_items.to_string(),
                inst.hunt_missing_items.to_string(),
                svc.hourly_cap.to_string(),
            ]
        })
        .collect();
    print_table(
        &["SERVICE", "INSTANCE", "ENABLED", "URL", "KEY", "UPGRADE", "MISSING", "CAP/H"],
        rows,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// add-instance
// ---------------------------------------------------------------------------

fn add_instance(root: &Path, service: &str, inst: InstanceConfig) -> anyhow::Result<()> {
    paths::validate_service_name(service)?;
    let mut config = Config::load(root).context("failed to load config")?;
    if config.find_instance(service, &inst.name).is_some() {
        anyhow::bail!("instance '{service}/{}' already exists", inst.name);
    }
    inst.resolve(service, &config.general)
        .with_context(|| format!("invalid instance '{service}/{}'", inst.name))?;

    let name = inst.name.clone();
    config
        .services
        .entry(service.to_string())
        .or_default()
        .instances
        .push(inst);
    config.save(root).context("failed to save config")?;
    println!("Added instance {service}/{name}");
    Ok(())
}

use crate::cmd::open_services;
use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum DedupSubcommand {
    /// List live processed-item records
    List {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        instance: Option<String>,
    },

    /// Delete records whose retention window has passed
    Sweep,

    /// Forget every processed item of one instance
    Clear { service: String, instance: String },
}

pub fn run(root: &Path, subcmd: DedupSubcommand, json: bool) -> anyhow::Result<()> {
    let (_config, services) = open_services(root)?;
    let dedup = &services.dedup;

    match subcmd {
        DedupSubcommand::List { service, instance } => {
            let records = dedup
                .list_active(service.as_deref(), instance.as_deref(), Utc::now())
                .context("failed to list processed records")?;
            if json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("No processed items.");
                return Ok(());
            }
            let rows = records
                .iter()
                .map(|r| {
                    vec![
                        r.service.clone(),
                        r.instance.clone(),
                        r.external_id.clone(),
                        fmt_time(r.processed_at),
                        fmt_time(r.expires_at),
                    ]
                })
                .collect();
            print_table(&["SERVICE", "INSTANCE", "ID", "PROCESSED", "EXPIRES"], rows);
        }
        DedupSubcommand::Sweep => {
            let removed = dedup.sweep_expired().context("expiry sweep failed")?;
            if json {
                print_json(&serde_json::json!({ "removed": removed }))?;
            } else {
                println!("Removed {removed} expired record(s).");
            }
        }
        DedupSubcommand::Clear { service, instance } => {
            let removed = dedup
                .clear_instance(&service, &instance)
                .with_context(|| format!("failed to clear {service}/{instance}"))?;
            if json {
                print_json(&serde_json::json!({
                    "service": service,
                    "instance": instance,
                    "removed": removed,
                }))?;
            } else {
                println!("Cleared {removed} record(s) for {service}/{instance}.");
            }
        }
    }
    Ok(())
}

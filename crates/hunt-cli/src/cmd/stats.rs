use crate::cmd::open_services;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Args;
use std::path::Path;

#[derive(Args)]
pub struct StatsArgs {
    /// Zero the counters instead of showing them
    #[arg(long)]
    reset: bool,

    /// Limit to one service
    #[arg(long)]
    service: Option<String>,
}

pub fn run(root: &Path, args: StatsArgs, json: bool) -> anyhow::Result<()> {
    let (_config, services) = open_services(root)?;
    let admission = &services.admission;

    if args.reset {
        let removed = admission
            .reset_stats(args.service.as_deref())
            .context("failed to reset stats")?;
        if json {
            print_json(&serde_json::json!({ "removed": removed }))?;
        } else {
            println!("Reset {removed} counter(s).");
        }
        return Ok(());
    }

    let mut stats = admission.stats().context("failed to read stats")?;
    if let Some(service) = &args.service {
        stats.retain(|s, _| s == service);
    }
    if json {
        return print_json(&stats);
    }
    if stats.is_empty() {
        println!("No stats recorded.");
        return Ok(());
    }
    let rows = stats
        .iter()
        .flat_map(|(service, kinds)| {
            kinds
                .iter()
                .map(move |(kind, n)| vec![service.clone(), kind.clone(), n.to_string()])
        })
        .collect();
    print_table(&["SERVICE", "KIND", "COUNT"], rows);
    Ok(())
}

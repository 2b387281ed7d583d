use crate::cmd::open_services;
use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use clap::Args;
use hunt_core::history::HistoryLog;
use std::path::Path;

#[derive(Args)]
pub struct HistoryArgs {
    /// Maximum entries to show
    #[arg(long, short = 'n', default_value_t = 20)]
    limit: usize,

    /// Limit to one service
    #[arg(long)]
    service: Option<String>,
}

pub fn run(root: &Path, args: HistoryArgs, json: bool) -> anyhow::Result<()> {
    let (_config, services) = open_services(root)?;
    let log = HistoryLog::new(services.db.clone());
    let entries = log
        .recent(args.limit, args.service.as_deref())
        .context("failed to read history")?;

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No history.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                fmt_time(e.recorded_at),
                e.service.clone(),
                e.instance.clone(),
                e.action.clone(),
                e.external_id.clone(),
                e.media_label.clone(),
            ]
        })
        .collect();
    print_table(&["TIME", "SERVICE", "INSTANCE", "ACTION", "ID", "TITLE"], rows);
    Ok(())
}

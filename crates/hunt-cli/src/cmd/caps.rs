use crate::cmd::open_services;
use crate::output::{fmt_time, print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let (_config, services) = open_services(root)?;
    let usage = services.usage_summary().value.unwrap_or_default();

    if json {
        return print_json(&usage);
    }
    if usage.is_empty() {
        println!("No services configured.");
        return Ok(());
    }
    let rows = usage
        .iter()
        .map(|u| {
            vec![
                u.service.clone(),
                fmt_time(u.hour_bucket),
                format!("{}/{}", u.count, u.limit),
                u.remaining().to_string(),
                if u.exceeded() { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(&["SERVICE", "HOUR", "USED", "REMAINING", "EXCEEDED"], rows);
    Ok(())
}

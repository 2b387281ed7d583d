mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, dedup::DedupSubcommand, history::HistoryArgs, stats::StatsArgs,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hunt",
    about = "Inspect and maintain acquisition-cycle state: processed items, hourly caps, stats and history",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .hunt/ or .git/)
    #[arg(long, global = true, env = "HUNT_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log more (repeat for trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, validate and inspect .hunt/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Inspect and reset processed-item records
    Dedup {
        #[command(subcommand)]
        subcommand: DedupSubcommand,
    },

    /// Show current-hour budget usage per service
    Caps,

    /// Show business counters per service
    Stats(StatsArgs),

    /// Show recent actions, newest first
    History(HistoryArgs),
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Dedup { subcommand } => cmd::dedup::run(&root, subcommand, cli.json),
        Commands::Caps => cmd::caps::run(&root, cli.json),
        Commands::Stats(args) => cmd::stats::run(&root, args, cli.json),
        Commands::History(args) => cmd::history::run(&root, args, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

//! `flowfleetctl`: CLI entry point for running a fleet description end to end.

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use flowfleet::{
    config::FleetDescription,
    fleet::FleetCoordinator,
    flow::Flow,
};

#[derive(Parser)]
#[command(name = "flowfleetctl", about = "Distributed throughput-experiment orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every flow declared in a fleet description file.
    Run {
        /// Path to a TOML fleet description.
        flows: PathBuf,
        /// Run duration in seconds (the staged "run body" phase).
        #[arg(long, default_value_t = 10)]
        duration: u64,
        /// Directory to write histogram data/control/plot files into.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Skip the preclean phase.
        #[arg(long)]
        no_preclean: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_timed();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            flows,
            duration,
            out,
            no_preclean,
        } => run(flows, duration, out, no_preclean).await,
    }
}

async fn run(
    flows_path: PathBuf,
    duration_secs: u64,
    out: Option<PathBuf>,
    no_preclean: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let description = FleetDescription::load(&flows_path)?;
    let out_dir = out.unwrap_or_else(|| PathBuf::from(&description.config.plot_dir));

    let flows: Vec<Flow> = description
        .flows
        .iter()
        .map(|spec| Flow::new(spec, description.config.measurement_tool.clone()))
        .collect();
    log::info!("loaded {} flow(s) from {}", flows.len(), flows_path.display());

    let mut coordinator = FleetCoordinator::new(description.config.clone(), flows);

    if !no_preclean {
        coordinator.preclean().await?;
    }

    coordinator.run(Duration::from_secs(duration_secs)).await?;

    let comparisons = coordinator.analyze().await;
    for (name, cmp) in &comparisons {
        log::info!(
            "histogram `{name}`: {} members, min-p {:?}, max-p {:?}",
            cmp.names.len(),
            cmp.min_p,
            cmp.max_p,
        );
        for (i, row) in cmp.similarity_rows.iter().enumerate() {
            log::info!("  [{}] {}: {row}", i, cmp.names[i]);
        }
    }

    coordinator.render(&out_dir, &description.config.plot_format).await?;
    log::info!("done; histogram output directory: {}", out_dir.display());
    Ok(())
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use coalescer::Config;
use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
#[command(about = "Drives coalescers with synthetic workloads and reports how well they coalesce")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Whether to log everything, in production format, into the void.
    #[arg(long)]
    tracing: bool,

    /// Whether to report metrics to a local sink that discards them.
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    let mut guard = logging::init(
        logging::Config {
            tracing: cli.tracing,
            metrics: cli.metrics,
        },
        &config,
    )?;
    if let Some(udp_sink) = guard.udp_sink.take() {
        tokio::spawn(udp_sink);
    }

    perform_stresstest(config.coalescer, workloads, cli.duration).await
}

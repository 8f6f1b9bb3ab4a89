use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use fleetbench::bench::{ControlState, ControlWatcher, JobController};
use fleetbench::config::Config;
use fleetbench::remote::Fleet;

#[derive(Parser)]
#[command(name = "fleetbench")]
#[command(about = "Remote I/O benchmark execution and monitoring engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark job across the configured fleet
    Run {
        /// Path to the YAML configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Write the job report as JSON to this file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
    /// Validate the configuration and probe every host
    Check {
        /// Path to the YAML configuration
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, report } => cmd_run(&config, report),
        Commands::Check { config } => cmd_check(&config),
    }
}

fn cmd_run(config_path: &PathBuf, report_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let monitor = config.monitor_path();
    if !monitor.exists() {
        fs::write(&monitor, "")
            .with_context(|| format!("creating control file {}", monitor.display()))?;
    }
    info!(
        "Control file: {} (write stop/pause/restart to steer the run)",
        monitor.display()
    );
    let control = Arc::new(ControlState::default());
    let mut watcher = ControlWatcher::spawn(monitor, Arc::clone(&control));

    let fleet = Fleet::connect(config.hosts.clone())?;
    let mut controller = JobController::new(fleet, config.job.clone(), control)?;
    let result = controller.run();
    watcher.shutdown();
    let report = result?;

    if report.stopped_early {
        info!("Run stopped by operator request");
    }
    if let Some(metrics) = &report.metrics {
        info!(
            "Averages: {:.1} ops/s, {:.2} MB/s, {:.3} ms latency",
            metrics.averages.ops, metrics.averages.bandwidth_mb, metrics.averages.resp_ms
        );
        info!("Interval series: {}", metrics.series_csv);
    }
    for interval in &report.zero_intervals {
        info!(
            "Zero-rate interval: {} .. {} ({}s)",
            interval.start, interval.end, interval.seconds
        );
    }
    if let Some(path) = report_path {
        fs::write(&path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("Report written to {}", path.display());
    }
    Ok(())
}

fn cmd_check(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!("Configuration OK: {} host(s)", config.hosts.len());

    let mut fleet = Fleet::connect(config.hosts.clone())?;
    for host in fleet.iter() {
        info!("{} ({}): {:?}", host.address(), host.role(), host.os());
    }

    let master = fleet.master()?;
    if !master.path_exists(&config.job.install_dir)? {
        bail!(
            "install directory {} not found on master",
            config.job.install_dir
        );
    }
    if !master.path_exists(&config.job.template)? {
        bail!("workload template {} not found on master", config.job.template);
    }
    info!("Master host ready: tool and template present");
    Ok(())
}

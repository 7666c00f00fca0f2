//! Command-line entry point for rust_flowlab.
//!
//! ```bash
//! rust_flowlab compile prime.toml --format yaml
//! rust_flowlab describe prime.toml
//! rust_flowlab run prime.toml --dry-run
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use rust_flowlab::config::FlowlabConfig;
use rust_flowlab::data::open_sink;
use rust_flowlab::executor::{Executor, RunReport};
use rust_flowlab::experiment::Experiment;
use rust_flowlab::schedule::RenderFormat;
use rust_flowlab::telemetry;

#[derive(Parser, Debug)]
#[command(name = "rust_flowlab")]
#[command(about = "Compile and run continuous-flow chemistry protocols", version)]
struct Cli {
    /// Configuration file (defaults and FLOWLAB_* variables still apply)
    #[arg(long, global = true, default_value = "flowlab.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile an experiment and print its schedule
    Compile {
        experiment: PathBuf,
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the apparatus of an experiment
    Describe { experiment: PathBuf },
    /// Compile and execute an experiment
    Run {
        experiment: PathBuf,
        /// Replace every driver with a simulated device
        #[arg(long)]
        dry_run: bool,
        /// Override the data log directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Yaml,
}

impl From<Format> for RenderFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => RenderFormat::Json,
            Format::Yaml => RenderFormat::Yaml,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = FlowlabConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    telemetry::init(&config.application);

    match cli.command {
        Command::Compile {
            experiment,
            format,
            output,
        } => {
            let experiment = load(&experiment)?;
            let rendered = experiment.protocol()?.render(format.into())?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "Schedule written");
                }
                None => println!("{}", rendered),
            }
        }
        Command::Describe { experiment } => {
            let experiment = load(&experiment)?;
            let apparatus = experiment.apparatus();
            println!("{}", apparatus.describe());
            println!("Total tubing volume: {:.3} mL", apparatus.tubing_volume_ml());
        }
        Command::Run {
            experiment,
            dry_run,
            output_dir,
        } => {
            if let Some(dir) = output_dir {
                config.storage.output_dir = dir;
            }
            run(&experiment, dry_run, &config).await?;
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<Experiment> {
    Experiment::load(path).with_context(|| format!("loading experiment {}", path.display()))
}

async fn run(path: &Path, dry_run: bool, config: &FlowlabConfig) -> Result<()> {
    let experiment = load(path)?;
    let schedule = experiment.protocol()?.compile()?;
    let drivers = experiment.drivers(dry_run)?;
    if dry_run {
        info!("Dry run: all components use simulated drivers");
    }

    let run_id = Uuid::new_v4();
    let (sink, log_path) = open_sink(&config.storage, run_id, &schedule.name)
        .context("opening data log")?;
    info!(path = %log_path.display(), "Logging run data");

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    let report = Executor::new(config.executor.clone())
        .with_run_id(run_id)
        .execute(&schedule, drivers, sink, cancel)
        .await?;
    interrupt.abort();

    print_summary(&report);
    report.into_result()?;
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!(
        "Run {}{}",
        report.run_id,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for outcome in &report.outcomes {
        let status = match &outcome.error {
            Some(e) => format!("FAILED: {}", e),
            None => "ok".to_string(),
        };
        println!(
            "  {:<16} {:<10} applied={:<4} readings={:<6} {}",
            outcome.component,
            format!("{:?}", outcome.final_phase()),
            outcome.applied,
            outcome.readings,
            status
        );
    }
}

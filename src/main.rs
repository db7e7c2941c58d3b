//! CLI Entry Point for b2b-dyno
//!
//! Provides command-line interface for:
//! - Running a test sequence on two VESC controllers, or on simulated ones
//! - Checking a configuration without touching hardware
//! - Probing a single controller
//!
//! # Usage
//!
//! ```bash
//! b2b-dyno check --config dyno.toml
//! b2b-dyno run --config dyno.toml
//! b2b-dyno run --config dyno.toml --simulate
//! b2b-dyno probe --port /dev/ttyACM0
//! ```

use anyhow::{Context, Result};
use b2b_dyno::config::DynoConfig;
use b2b_dyno::sequencer::TestPlan;
use b2b_dyno::{session, tracing_setup};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "b2b-dyno")]
#[command(about = "Back-to-back dynamometer test sequencer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured test sequence
    Run {
        /// Configuration file (TOML or JSON)
        #[arg(long, short, default_value = "dyno.toml")]
        config: PathBuf,

        /// Use simulated controllers instead of serial ports
        #[arg(long)]
        simulate: bool,

        /// Override the run log directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Validate a configuration and print the resulting plan
    Check {
        /// Configuration file (TOML or JSON)
        #[arg(long, short, default_value = "dyno.toml")]
        config: PathBuf,
    },

    /// Read firmware and one measurement from a single controller
    Probe {
        /// Serial port of the controller
        #[arg(long)]
        port: String,

        /// Serial baud rate
        #[arg(long, default_value_t = 115_200)]
        baud: u32,

        /// Reply timeout, e.g. "500ms"
        #[arg(long, default_value = "500ms", value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: std::time::Duration,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            log_dir,
        } => run(config, simulate, log_dir).await,
        Commands::Check { config } => check(config),
        Commands::Probe {
            port,
            baud,
            timeout,
        } => probe(&port, baud, timeout).await,
    }
}

/// Load, validate and start tracing. Nothing is commanded until this succeeds.
fn load(path: &Path) -> Result<(DynoConfig, TestPlan)> {
    let config = DynoConfig::load_from(path)
        .with_context(|| format!("Cannot load configuration {}", path.display()))?;
    let plan = config.validate().context("Configuration rejected")?;
    tracing_setup::init_from_config(&config)?;
    Ok((config, plan))
}

async fn run(path: PathBuf, simulate: bool, log_dir: Option<PathBuf>) -> Result<()> {
    let (mut config, plan) = load(&path)?;
    if let Some(dir) = log_dir {
        config.log.directory = dir;
    }

    tracing::info!(
        config = %path.display(),
        simulate,
        points = plan.total_points(),
        "Starting dyno run"
    );

    let summary = if simulate {
        session::run_simulated(&config, &plan).await?
    } else {
        run_hardware(&config, &plan).await?
    };

    match summary.fault {
        Some((role, code)) => {
            tracing::warn!(
                %role,
                fault = %code,
                captured = summary.points_captured,
                total = summary.total_points,
                "Run ended on a controller fault"
            );
        }
        None => tracing::info!(
            captured = summary.points_captured,
            rows = summary.rows_logged,
            "Run complete"
        ),
    }
    Ok(())
}

#[cfg(feature = "instrument_serial")]
async fn run_hardware(
    config: &DynoConfig,
    plan: &TestPlan,
) -> Result<b2b_dyno::sequencer::RunSummary> {
    session::run_hardware(config, plan).await
}

#[cfg(not(feature = "instrument_serial"))]
async fn run_hardware(
    _config: &DynoConfig,
    _plan: &TestPlan,
) -> Result<b2b_dyno::sequencer::RunSummary> {
    anyhow::bail!("Serial support not compiled in; rebuild with the 'instrument_serial' feature or use --simulate")
}

fn check(path: PathBuf) -> Result<()> {
    let (config, plan) = load(&path)?;
    let (dut, absorber) = config.ports();

    println!("Configuration OK: {}", path.display());
    println!("  DUT port:      {}", dut);
    println!("  Absorber port: {}", absorber);
    println!("  Grid mode:     {:?}", plan.mode);
    for (i, stage) in plan.stages.iter().enumerate() {
        let points: Vec<String> = stage
            .points
            .iter()
            .map(|p| format!("{} A x{}", p.current_a, p.capture.iterations(plan.poll_interval)))
            .collect();
        println!("  Stage {:>3}: {} rpm -> {}", i + 1, stage.rpm, points.join(", "));
    }
    println!("  Operating points: {}", plan.total_points());
    println!(
        "  Estimated duration: {}",
        humantime_serde::re::humantime::format_duration(plan.estimated_duration())
    );
    Ok(())
}

#[cfg(feature = "instrument_serial")]
async fn probe(port: &str, baud: u32, timeout: std::time::Duration) -> Result<()> {
    tracing_setup::init(tracing_setup::TracingConfig::default())?;
    let (firmware, sample) = session::probe(port, baud, timeout).await?;
    println!("{}: firmware {}", port, firmware);
    println!("{}", b2b_dyno::measurement::COLUMN_HEADER);
    println!("{}", sample.to_row());
    if sample.fault.is_fault() {
        println!("Fault: {}", sample.fault);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
async fn probe(_port: &str, _baud: u32, _timeout: std::time::Duration) -> Result<()> {
    anyhow::bail!("Serial support not compiled in; rebuild with the 'instrument_serial' feature")
}

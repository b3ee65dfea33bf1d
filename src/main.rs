//! `fourprobe`: run four-probe resistance sweeps from a TOML configuration.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fourprobe_daq::adapters::{InstrumentSession, MockSession, SimulatedSample, VisaSession};
use fourprobe_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use fourprobe_daq::data::{ConsoleLogger, CsvResultLogger, LoggerSet};
use fourprobe_daq::instrument::{ProbeController, SenseController, SourceController};
use fourprobe_daq::sweep::{Instruments, SenseStrategy, SweepEngine, SweepMode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fourprobe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured sweep
    Run {
        /// Drive simulated instruments instead of the bus
        #[arg(long)]
        simulate: bool,

        /// Resistance of the simulated sample in ohms
        #[arg(long, default_value = "100.0")]
        sample_ohms: f64,

        /// Write results here instead of the configured output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load and validate the configuration, then exit
    Validate,
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    if settings.application.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_session(resource: &str, timeout: Duration) -> Result<Box<dyn InstrumentSession>> {
    let session = VisaSession::new(resource)
        .with_timeout(timeout)
        .open()
        .await
        .with_context(|| format!("Failed to open '{}'", resource))?;
    Ok(Box::new(session))
}

async fn build_instruments(settings: &Settings, simulate: bool, sample_ohms: f64) -> Result<Instruments> {
    let sample = SimulatedSample::new(sample_ohms);

    let source_session: Box<dyn InstrumentSession> = if simulate {
        Box::new(MockSession::source(&settings.source.resource, &sample))
    } else {
        open_session(&settings.source.resource, settings.source.timeout).await?
    };
    let source = SourceController::new(source_session, settings.source_limits);

    let sense = match &settings.sense {
        Some(config) if settings.sweep.mode == SweepMode::HighPrecision => {
            let session: Box<dyn InstrumentSession> = if simulate {
                Box::new(MockSession::voltmeter(&config.resource, &sample))
            } else {
                open_session(&config.resource, config.timeout).await?
            };
            SenseStrategy::nanovoltmeter(SenseController::new(session), config.clone())
        }
        _ => SenseStrategy::SourceReadback,
    };

    let mut instruments = Instruments::new(source, sense);
    if let Some(probe) = &settings.probe {
        let session: Box<dyn InstrumentSession> = if simulate {
            Box::new(MockSession::meter(&probe.resource, 295.0))
        } else {
            open_session(&probe.resource, probe.timeout).await?
        };
        instruments = instruments.with_probe(ProbeController::new(session, probe.clone()));
    }
    Ok(instruments)
}

async fn run(settings: Settings, simulate: bool, sample_ohms: f64, output: Option<PathBuf>) -> Result<()> {
    let instruments = build_instruments(&settings, simulate, sample_ohms).await?;
    let mut engine = SweepEngine::new(instruments, settings.source.clone())
        .with_name(&settings.application.name)
        .with_retry(settings.retry.clone());

    let csv = match output {
        Some(path) => CsvResultLogger::new(path),
        None => CsvResultLogger::in_directory(&settings.application.output_dir, &settings.application.name),
    };
    let csv_path = csv.path().to_path_buf();
    let mut loggers = LoggerSet::new().with(ConsoleLogger).with(csv);

    let outcome = engine.run(&settings.sweep, &mut loggers).await;
    if let Err(err) = engine.shutdown().await {
        warn!("Instrument shutdown reported an error: {}", err);
    }
    let result = outcome.context("Sweep rejected")?;

    info!(
        "Results written to '{}' ({} points in {:.1} s)",
        csv_path.display(),
        result.points.len(),
        result.duration_secs().unwrap_or_default()
    );
    if result.output_left_enabled {
        warn!("The source output could not be confirmed off. Check the instrument.");
    }
    if let Some(fault) = result.fault() {
        bail!(
            "Sweep faulted at step {:?} ({:?}): {}",
            fault.step,
            fault.kind,
            fault.message
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    init_tracing(&settings);

    match cli.command {
        Commands::Validate => {
            info!(
                "Configuration OK: {} sweep, {} points",
                settings.sweep.mode,
                settings.sweep.point_count()
            );
            Ok(())
        }
        Commands::Run {
            simulate,
            sample_ohms,
            output,
        } => run(settings, simulate, sample_ohms, output).await,
    }
}

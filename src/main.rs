//! Detector run monitoring CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ecal_monitor::{build_runtime, run_monitoring, validate_raw_run_dir, Config, Workspace};

#[derive(Parser)]
#[command(name = "ecal-monitor")]
#[command(about = "Convert and event-build detector runs while acquisition writes them", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "monitoring.yaml", global = true)]
    config: PathBuf,

    /// Override the configured worker count
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring loop for one raw run folder
    Run {
        /// Folder of the run to be monitored
        raw_run_folder: PathBuf,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "monitoring.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { raw_run_folder } => run_command(raw_run_folder, cli.config, cli.workers),
        Commands::Validate => validate_command(cli.config),
        Commands::GenerateConfig { output } => generate_config_command(output),
    }
}

fn run_command(raw_run_folder: PathBuf, config_path: PathBuf, workers: Option<usize>) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;

    // Apply overrides
    if let Some(workers) = workers {
        config.monitoring.max_workers = workers;
    }
    config.validate()?;

    let raw_run_dir = validate_raw_run_dir(&raw_run_folder)?;
    let workspace = Workspace::resolve(&raw_run_dir, &config)?;

    // The workspace log doubles as the previous-session marker, so prepare()
    // must look at the directory before logging opens the file.
    let report = workspace.prepare()?;
    let _guard = init_logging(&workspace.log_path())?;
    tracing::info!("Logging to {} started.", workspace.log_path().display());
    report.log(&workspace);

    let runtime = build_runtime()?;
    let stats = runtime.block_on(run_monitoring(config, raw_run_dir, workspace))?;
    tracing::info!("Session complete: {stats}");
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

/// Console layer plus an append-mode file layer into the workspace log.
/// The returned guard flushes the file writer on drop.
fn init_logging(log_path: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let (file_writer, guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
    Ok(guard)
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# ecal-monitor configuration

# === MONITORING: the pipeline loop ===
monitoring:
  # Parent directory for per-run output workspaces
  output_parent: "data"

  # Workspace name override (default: the raw run folder's base name)
  # output_name: "run_050123"

  # Number of parallel workers draining the job queue
  max_workers: 10

  # Minimum seconds between raw-directory scans
  poll_interval_secs: 2

  # Seconds a worker waits on an empty queue before re-checking discovery
  dequeue_timeout_secs: 2

  # Base idle-alert threshold; alert n fires after n * base idle seconds.
  # Drop a file named suppress_idle_info into the workspace to silence
  # the alerts, or stop_monitoring to stop the session gracefully.
  idle_alert_base_secs: 60

  # Within one stage, service the newest fragment first
  newest_first: true

# === EVENTBUILDING: parameters for the event builder ===
eventbuilding:
  pedestals_file: "calibration/pedestals.txt"
  mip_calibration_file: "calibration/mip.txt"
  pedestals_lg_file: "calibration/pedestals_lowgain.txt"
  mip_calibration_lg_file: "calibration/mip_lowgain.txt"

  # Tungsten configuration identifier
  w_config: 3

  # Minimum number of slabs hit for an event to be built
  min_slabs_hit: 4

  # Detector-position descriptor passed through to the builder
  cob_positions_string: "8 9 10 11 12 13"

  # Run identifier (default: guessed from the run name)
  # id_run: 50123

# === TOOLS: external analysis toolchain ===
tools:
  # Checkout of the testbeam analysis tools
  analysis_dir: "continuous_event_building/SiWECAL-TB-analysis"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());
    Ok(())
}

//! Continuous monitoring pipeline for detector runs.
//!
//! While acquisition is still writing, every raw fragment of a run is pushed
//! through conversion and event building by external analysis tools, so a
//! near-final view of the data exists moments after the run ends.
//!
//! # Architecture
//!
//! - **Workspace**: per-run output tree with idempotent resumption
//! - **Watcher**: throttled discovery of raw fragments and run completion
//! - **Pipeline**: priority job queue drained by a bounded worker pool
//! - **Stages**: external conversion and event-building collaborators with
//!   atomic artifact publication
//!
//! # Usage
//!
//! ```no_run
//! use ecal_monitor::{build_runtime, run_monitoring, Config, Workspace};
//! use std::path::PathBuf;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&PathBuf::from("monitoring.yaml"))?;
//!     let raw_run_dir = PathBuf::from("/daq/run_050123");
//!     let workspace = Workspace::resolve(&raw_run_dir, &config)?;
//!     workspace.prepare()?;
//!     let runtime = build_runtime()?;
//!     runtime.block_on(run_monitoring(config, raw_run_dir, workspace))?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod pipeline;
pub mod run_id;
pub mod watcher;
pub mod workspace;

pub use config::Config;
pub use pipeline::{
    EventBuildingParams, ExternalStageRunner, Job, JobQueue, RunState, Scheduler, SchedulerConfig,
    SchedulerStats, Stage, StageError, StageOutcome, StageRunner, ToolChain,
};
pub use watcher::{IdleMonitor, RawFileWatcher};
pub use workspace::Workspace;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Check the raw run directory and resolve it to a canonical path.
/// Canonicalization also strips a trailing slash, which would otherwise
/// leave the workspace without a usable base name.
pub fn validate_raw_run_dir(path: &Path) -> Result<PathBuf> {
    let raw_run_dir = path
        .canonicalize()
        .with_context(|| format!("raw run folder {} is not accessible", path.display()))?;
    if !raw_run_dir.is_dir() {
        bail!("{} is not a directory", raw_run_dir.display());
    }
    let run_settings = raw_run_dir.join(workspace::RUN_SETTINGS);
    if !run_settings.exists() {
        bail!(
            "{} must exist in the raw run folder",
            run_settings.display()
        );
    }
    Ok(raw_run_dir)
}

/// Run one full monitoring session against the external analysis toolchain.
///
/// Validates the computing environment, resolves the run identifier,
/// snapshots the effective configuration, derives the channel mask, and
/// then drains the pipeline until the run completes or an operator stops
/// it. The workspace must already be prepared.
pub async fn run_monitoring(
    mut config: Config,
    raw_run_dir: PathBuf,
    workspace: Workspace,
) -> Result<SchedulerStats> {
    let tools = ToolChain::new(config.tools.analysis_dir.clone());
    tools.validate_environment().await?;
    config.eventbuilding.resolve_calibration_files()?;

    let run_id = match config.eventbuilding.id_run {
        Some(id) => id,
        None => {
            let guessed = run_id::guess_run_id(&workspace.name(), workspace.parent());
            tracing::info!("Guessed run identifier {} from {:?}", guessed, workspace.name());
            guessed
        }
    };
    config.eventbuilding.id_run = Some(run_id);
    workspace.snapshot_config(&config)?;
    tracing::info!(
        "Config snapshot written to {}",
        workspace.config_snapshot_path().display()
    );

    let masked_file = tools.derive_channel_mask(&raw_run_dir, &workspace).await?;
    let params = EventBuildingParams::from_config(&config.eventbuilding, masked_file, run_id);
    let runner = Arc::new(ExternalStageRunner::new(tools, workspace.clone(), params));

    run_scheduler(&config, raw_run_dir, workspace, runner).await
}

/// Wire the queue, watcher, and worker pool, and drain the run.
/// Split from [`run_monitoring`] so tests can substitute the stage runner.
pub async fn run_scheduler(
    config: &Config,
    raw_run_dir: PathBuf,
    workspace: Workspace,
    runner: Arc<dyn StageRunner>,
) -> Result<SchedulerStats> {
    let state = RunState::new();
    let queue = Arc::new(JobQueue::new(config.monitoring.newest_first));
    let idle = IdleMonitor::new(
        Duration::from_secs(config.monitoring.idle_alert_base_secs),
        &workspace,
    );
    let watcher = Arc::new(RawFileWatcher::new(
        raw_run_dir,
        Duration::from_secs(config.monitoring.poll_interval_secs),
        idle,
    ));
    let scheduler_config = SchedulerConfig {
        max_workers: config.monitoring.max_workers,
        dequeue_timeout: Duration::from_secs(config.monitoring.dequeue_timeout_secs),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(
        queue,
        state,
        runner,
        watcher,
        workspace,
        scheduler_config,
    );

    let stats = scheduler.run().await?;
    if stats.stopped_gracefully {
        tracing::info!("Monitoring stopped on operator request. {stats}");
    } else {
        tracing::info!("The run has finished. The monitoring has treated all files. {stats}");
    }
    Ok(stats)
}

/// Build the Tokio runtime for a monitoring session.
pub fn build_runtime() -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    Ok(builder.build()?)
}

//! Pipeline stages and external stage invocation.
//!
//! The actual stage computations are opaque external collaborator
//! processes: a ROOT macro for conversion and a Python event builder.
//! This module owns the uniform invocation contract around them: compute
//! the deterministic final artifact path, skip the call if it already
//! exists, otherwise run the collaborator into the scratch area and
//! publish the result with an atomic rename. The existence of the final
//! path is the sole idempotency signal; there is no separate ledger.

use crate::config::EventBuildingConfig;
use crate::workspace::{Workspace, RUN_SETTINGS};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use thiserror::Error;
use tokio::process::Command;

/// Environment hint logged when the ROOT toolchain is missing.
const ROOT_ENV_TIP: &str =
    "source /cvmfs/sft.cern.ch/lcg/views/LCG_99/x86_64-centos7-gcc10-opt/setup.sh";

/// Literal line the mask-summary macro prints when it cannot read the
/// settings file; its exit status stays zero in that case.
const MASKING_FAILURE_SENTINEL: &str = " dameyo - damedame";

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Raw fragment to intermediate structured artifact
    Conversion,
    /// Intermediate artifact + calibration to built events
    EventBuilding,
    /// Online monitoring of built events; recognized placeholder, jobs
    /// reaching it are consumed without further action
    Monitoring,
}

impl Stage {
    /// Scheduling rank; the queue pops the numerically smallest rank first,
    /// so stages closer to completion drain before new conversions start.
    pub fn rank(self) -> u8 {
        match self {
            Stage::Monitoring => 1,
            Stage::EventBuilding => 2,
            Stage::Conversion => 3,
        }
    }

    /// Stage transition table: Conversion -> EventBuilding -> Monitoring,
    /// then terminal.
    pub fn successor(self) -> Option<Stage> {
        match self {
            Stage::Conversion => Some(Stage::EventBuilding),
            Stage::EventBuilding => Some(Stage::Monitoring),
            Stage::Monitoring => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Conversion => "Conversion",
            Stage::EventBuilding => "EventBuilding",
            Stage::Monitoring => "Monitoring",
        };
        write!(f, "{name}")
    }
}

/// Result of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Final artifact path for the follow-on job
    pub artifact: PathBuf,

    /// The artifact was already published by an earlier invocation; no
    /// collaborator was run
    pub reused: bool,
}

/// Failure at the stage-invocation boundary. Any of these is unrecoverable
/// for the whole session: there is no per-stage retry and no quarantine.
#[derive(Debug, Error)]
pub enum StageError {
    /// The collaborator could not be launched at all.
    #[error("{stage} collaborator could not be launched: {command}")]
    Spawn {
        stage: Stage,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The collaborator exited non-zero or produced unexpected diagnostics.
    #[error("{stage} collaborator failed ({status}): {command}")]
    Collaborator {
        stage: Stage,
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    /// The finished artifact could not be moved out of scratch.
    #[error("publishing the {stage} artifact to {} failed", .path.display())]
    Publish {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    /// Log the full diagnostic context. The partial scratch output is left
    /// behind on purpose for manual inspection.
    pub fn log(&self) {
        tracing::error!("{self}");
        match self {
            StageError::Collaborator { stdout, stderr, .. } => {
                tracing::error!("collaborator stdout:\n{stdout}");
                tracing::error!("collaborator stderr:\n{stderr}");
            }
            StageError::Spawn { source, .. } | StageError::Publish { source, .. } => {
                tracing::error!("cause: {source}");
            }
        }
        tracing::error!(
            "Unexpected error while running a pipeline stage. Maybe the lines above \
             with the collaborator's output help to understand the issue."
        );
    }
}

/// Uniform contract for running one pipeline stage on one input artifact.
///
/// Implementations must be idempotent: when the final artifact for
/// `(stage, input)` already exists they return it without side effects.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(
        &self,
        stage: Stage,
        input: &Path,
        index: u32,
    ) -> std::result::Result<StageOutcome, StageError>;
}

/// Fixed parameter set for the event-building collaborator, resolved once
/// at startup and reused for every fragment. Only the fragment sequence
/// index varies per job.
#[derive(Debug, Clone)]
pub struct EventBuildingParams {
    pub pedestals_file: PathBuf,
    pub mip_calibration_file: PathBuf,
    pub pedestals_lg_file: PathBuf,
    pub mip_calibration_lg_file: PathBuf,
    pub masked_file: PathBuf,
    pub w_config: i64,
    pub min_slabs_hit: u32,
    pub cob_positions_string: String,
    pub id_run: u32,
}

impl EventBuildingParams {
    pub fn from_config(config: &EventBuildingConfig, masked_file: PathBuf, id_run: u32) -> Self {
        Self {
            pedestals_file: config.pedestals_file.clone(),
            mip_calibration_file: config.mip_calibration_file.clone(),
            pedestals_lg_file: config.pedestals_lg_file.clone(),
            mip_calibration_lg_file: config.mip_calibration_lg_file.clone(),
            masked_file,
            w_config: config.w_config,
            min_slabs_hit: config.min_slabs_hit,
            cob_positions_string: config.cob_positions_string.clone(),
            id_run,
        }
    }

    fn apply(&self, cmd: &mut Command, index: u32) {
        cmd.arg("--pedestals_file").arg(&self.pedestals_file);
        cmd.arg("--mip_calibration_file")
            .arg(&self.mip_calibration_file);
        cmd.arg("--pedestals_lg_file").arg(&self.pedestals_lg_file);
        cmd.arg("--mip_calibration_lg_file")
            .arg(&self.mip_calibration_lg_file);
        cmd.arg("--masked_file").arg(&self.masked_file);
        cmd.arg("--w_config").arg(self.w_config.to_string());
        cmd.arg("--min_slabs_hit").arg(self.min_slabs_hit.to_string());
        cmd.arg("--cob_positions_string")
            .arg(&self.cob_positions_string);
        cmd.arg("--id_run").arg(self.id_run.to_string());
        cmd.arg("--id_dat").arg(index.to_string());
    }
}

/// Locations of the external analysis toolchain.
#[derive(Debug, Clone)]
pub struct ToolChain {
    analysis_dir: PathBuf,
}

impl ToolChain {
    pub fn new(analysis_dir: PathBuf) -> Self {
        Self { analysis_dir }
    }

    fn converter_dir(&self) -> PathBuf {
        self.analysis_dir.join("converter_SLB")
    }

    fn eventbuilding_dir(&self) -> PathBuf {
        self.analysis_dir.join("eventbuilding")
    }

    fn commissioning_dir(&self) -> PathBuf {
        self.analysis_dir.join("SLBcommissioning")
    }

    /// Probe the computing environment before the loop starts.
    ///
    /// A missing ROOT installation is fatal; event building with Python 2
    /// is merely discouraged, so a wrong interpreter only warns.
    pub async fn validate_environment(&self) -> Result<()> {
        if !self.analysis_dir.is_dir() {
            bail!(
                "analysis tools not found at {}",
                self.analysis_dir.display()
            );
        }

        match Command::new("root").arg("--version").output().await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                bail!("CERN ROOT not available. Tip: try the environment at\n{ROOT_ENV_TIP}");
            }
            Err(err) => return Err(err).context("probing `root --version`"),
        }

        // Not necessarily the interpreter running this process, but the one
        // that will run event building (and is linked against ROOT).
        match Command::new("python").arg("--version").output().await {
            Ok(output) => {
                let mut version = String::from_utf8_lossy(&output.stdout).into_owned();
                version.push_str(&String::from_utf8_lossy(&output.stderr));
                let major = version
                    .trim()
                    .strip_prefix("Python ")
                    .and_then(|v| v.split('.').next())
                    .and_then(|m| m.parse::<u32>().ok());
                if major != Some(3) {
                    tracing::warn!(
                        "Event building with {} is not forbidden, but discouraged for \
                         performance reasons. Tip: try the environment at\n{}",
                        version.trim(),
                        ROOT_ENV_TIP
                    );
                }
            }
            Err(err) => {
                tracing::warn!("Could not probe the python interpreter: {err}");
            }
        }
        Ok(())
    }

    /// Derive the channel mask from the run settings file.
    ///
    /// Copies the settings into the workspace, runs the mask-summary macro
    /// on the copy, and publishes the macro's `<stem>_masked.txt` product as
    /// the workspace mask file. The macro signals a read failure through a
    /// literal sentinel line on stdout while still exiting zero.
    pub async fn derive_channel_mask(
        &self,
        raw_run_dir: &Path,
        workspace: &Workspace,
    ) -> Result<PathBuf> {
        let settings_copy = workspace.root().join(RUN_SETTINGS);
        tokio::fs::copy(raw_run_dir.join(RUN_SETTINGS), &settings_copy)
            .await
            .with_context(|| format!("copying {RUN_SETTINGS} into the workspace"))?;
        let settings_stem = settings_copy.with_extension("");

        let macro_call = format!(
            r#"test_read_masked_channels_summary.C("{}")"#,
            settings_stem.display()
        );
        let mut cmd = Command::new("root");
        cmd.args(["-b", "-l", "-q"])
            .arg(&macro_call)
            .current_dir(self.commissioning_dir());
        let output = cmd
            .output()
            .await
            .context("running the mask-summary macro")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let settings_not_read = stdout.lines().nth(2) == Some(MASKING_FAILURE_SENTINEL);
        if !output.status.success() || settings_not_read {
            bail!(
                "mask-summary macro failed ({}) while reading {}.\nstdout:\n{}\nstderr:\n{}",
                output.status,
                settings_copy.display(),
                stdout,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let macro_product = PathBuf::from(format!("{}_masked.txt", settings_stem.display()));
        let mask_path = workspace.masked_channels_path();
        tokio::fs::rename(&macro_product, &mask_path)
            .await
            .with_context(|| format!("publishing the channel mask to {}", mask_path.display()))?;
        tokio::fs::remove_file(&settings_copy).await.ok();
        tracing::debug!("Channel masks written to {}", mask_path.display());
        Ok(mask_path)
    }
}

/// Production [`StageRunner`] driving the external analysis toolchain.
pub struct ExternalStageRunner {
    tools: ToolChain,
    workspace: Workspace,
    params: EventBuildingParams,
}

impl ExternalStageRunner {
    pub fn new(tools: ToolChain, workspace: Workspace, params: EventBuildingParams) -> Self {
        Self {
            tools,
            workspace,
            params,
        }
    }

    async fn convert(&self, raw_file: &Path) -> std::result::Result<StageOutcome, StageError> {
        let fragment_name = file_name(raw_file);
        let converted_name = format!("converted_{fragment_name}.root");
        let final_path = self.workspace.converted_dir().join(&converted_name);
        if final_path.exists() {
            return Ok(StageOutcome {
                artifact: final_path,
                reused: true,
            });
        }

        let tmp_path = self.workspace.scratch_dir().join(&converted_name);
        let macro_call = format!(
            r#"ConvertDataSL.cc("{}", false, "{}")"#,
            raw_file.display(),
            tmp_path.display()
        );
        let mut cmd = Command::new("root");
        cmd.args(["-b", "-l", "-q"])
            .arg(&macro_call)
            .current_dir(self.tools.converter_dir());
        run_collaborator(Stage::Conversion, cmd).await?;

        publish(Stage::Conversion, &tmp_path, &final_path)?;
        Ok(StageOutcome {
            artifact: final_path,
            reused: false,
        })
    }

    async fn build_events(
        &self,
        converted_file: &Path,
        index: u32,
    ) -> std::result::Result<StageOutcome, StageError> {
        let converted_name = file_name(converted_file);
        let build_name = converted_name.replace("converted_", "build_");
        let final_path = self.workspace.built_dir().join(&build_name);
        if final_path.exists() {
            return Ok(StageOutcome {
                artifact: final_path,
                reused: true,
            });
        }

        let tmp_path = self.workspace.scratch_dir().join(&build_name);
        let mut cmd = Command::new("./build_events.py");
        cmd.current_dir(self.tools.eventbuilding_dir());
        cmd.arg(converted_file);
        cmd.arg("--out_file_name").arg(&tmp_path);
        self.params.apply(&mut cmd, index);
        cmd.arg("--no_progress_info");
        run_collaborator(Stage::EventBuilding, cmd).await?;

        publish(Stage::EventBuilding, &tmp_path, &final_path)?;
        Ok(StageOutcome {
            artifact: final_path,
            reused: false,
        })
    }
}

#[async_trait]
impl StageRunner for ExternalStageRunner {
    async fn run_stage(
        &self,
        stage: Stage,
        input: &Path,
        index: u32,
    ) -> std::result::Result<StageOutcome, StageError> {
        match stage {
            Stage::Conversion => self.convert(input).await,
            Stage::EventBuilding => self.build_events(input, index).await,
            // Placeholder stage; nothing to invoke.
            Stage::Monitoring => Ok(StageOutcome {
                artifact: input.to_path_buf(),
                reused: true,
            }),
        }
    }
}

/// Run one collaborator to completion. A non-zero exit status or any
/// stderr output at all is a stage failure.
async fn run_collaborator(stage: Stage, mut cmd: Command) -> std::result::Result<Output, StageError> {
    let command = format!("{:?}", cmd.as_std());
    let output = cmd.output().await.map_err(|source| StageError::Spawn {
        stage,
        command: command.clone(),
        source,
    })?;
    if !output.status.success() || !output.stderr.is_empty() {
        return Err(StageError::Collaborator {
            stage,
            command,
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

/// Atomically publish a finished scratch file at its final path.
fn publish(stage: Stage, tmp: &Path, final_path: &Path) -> std::result::Result<(), StageError> {
    std::fs::rename(tmp, final_path).map_err(|source| StageError::Publish {
        stage,
        path: final_path.to_path_buf(),
        source,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> EventBuildingParams {
        EventBuildingParams {
            pedestals_file: PathBuf::from("ped.txt"),
            mip_calibration_file: PathBuf::from("mip.txt"),
            pedestals_lg_file: PathBuf::from("ped_lg.txt"),
            mip_calibration_lg_file: PathBuf::from("mip_lg.txt"),
            masked_file: PathBuf::from("masked_channels.txt"),
            w_config: 3,
            min_slabs_hit: 4,
            cob_positions_string: "8 9 10".to_string(),
            id_run: 123,
        }
    }

    fn test_runner(workspace: &Workspace) -> ExternalStageRunner {
        // Points at a toolchain that does not exist; any attempt to actually
        // invoke a collaborator fails loudly.
        ExternalStageRunner::new(
            ToolChain::new(PathBuf::from("/nonexistent/toolchain")),
            workspace.clone(),
            test_params(),
        )
    }

    #[test]
    fn test_stage_successor_table() {
        assert_eq!(Stage::Conversion.successor(), Some(Stage::EventBuilding));
        assert_eq!(Stage::EventBuilding.successor(), Some(Stage::Monitoring));
        assert_eq!(Stage::Monitoring.successor(), None);
    }

    #[test]
    fn test_stage_ranks_prefer_later_stages() {
        assert!(Stage::Monitoring.rank() < Stage::EventBuilding.rank());
        assert!(Stage::EventBuilding.rank() < Stage::Conversion.rank());
    }

    #[tokio::test]
    async fn test_conversion_is_idempotent_on_published_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path().join("run"));
        workspace.prepare().unwrap();
        let published = workspace
            .converted_dir()
            .join("converted_beam.dat_0007.root");
        std::fs::write(&published, "already converted").unwrap();

        // The toolchain path is bogus; success proves no collaborator ran.
        let runner = test_runner(&workspace);
        let outcome = runner
            .run_stage(Stage::Conversion, Path::new("/daq/beam.dat_0007"), 7)
            .await
            .unwrap();
        assert!(outcome.reused);
        assert_eq!(outcome.artifact, published);
    }

    #[tokio::test]
    async fn test_event_building_is_idempotent_on_published_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path().join("run"));
        workspace.prepare().unwrap();
        let converted = workspace
            .converted_dir()
            .join("converted_beam.dat_0007.root");
        std::fs::write(&converted, "converted").unwrap();
        let published = workspace.built_dir().join("build_beam.dat_0007.root");
        std::fs::write(&published, "already built").unwrap();

        let runner = test_runner(&workspace);
        let outcome = runner
            .run_stage(Stage::EventBuilding, &converted, 7)
            .await
            .unwrap();
        assert!(outcome.reused);
        assert_eq!(outcome.artifact, published);
    }

    #[tokio::test]
    async fn test_missing_collaborator_is_a_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path().join("run"));
        workspace.prepare().unwrap();
        let converted = workspace
            .converted_dir()
            .join("converted_beam.dat_0001.root");
        std::fs::write(&converted, "converted").unwrap();

        let runner = test_runner(&workspace);
        let err = runner
            .run_stage(Stage::EventBuilding, &converted, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Spawn { .. }));
    }
}

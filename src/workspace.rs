//! Per-run output workspace.
//!
//! Each monitored run owns one directory under the configured output parent,
//! holding the stage artifacts (`scratch/`, `converted/`, `built/`), the
//! session log, a snapshot of the effective configuration, and the channel
//! mask. The session log doubles as the marker that a previous monitoring
//! session used the directory, which gates idempotent resumption: artifacts
//! published by an earlier session are kept, half-written scratch files are
//! not.

use crate::config::Config;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Session log file; also the "previous session existed" marker.
pub const LOG_FILE: &str = "monitoring.log";

/// Snapshot of the effective configuration, written before the loop starts.
pub const CONFIG_SNAPSHOT: &str = "monitoring.yaml";

/// Channel mask derived from the run settings at startup.
pub const MASKED_CHANNELS: &str = "masked_channels.txt";

/// Acquisition settings file that must accompany every raw run.
pub const RUN_SETTINGS: &str = "Run_Settings.txt";

/// Operator-droppable marker requesting a graceful stop.
const STOP_MARKER: &str = "stop_monitoring";

/// Operator-droppable marker silencing idle alerts.
const SUPPRESS_IDLE_MARKER: &str = "suppress_idle_info";

const SUBFOLDERS: [&str; 3] = ["scratch", "converted", "built"];

/// The per-run output directory tree.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a workspace handle rooted at `root` without touching the
    /// filesystem. Call [`Workspace::prepare`] before using it.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Map a raw run directory to its workspace path: the configured output
    /// parent (created if absent) joined with either the configured name
    /// override or the raw directory's base name.
    pub fn resolve(raw_run_dir: &Path, config: &Config) -> Result<Self> {
        let parent = &config.monitoring.output_parent;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output parent {}", parent.display()))?;
        let parent = parent
            .canonicalize()
            .with_context(|| format!("resolving output parent {}", parent.display()))?;

        let name = match &config.monitoring.output_name {
            Some(name) => name.clone(),
            None => raw_run_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| {
                    format!("raw run folder {} has no base name", raw_run_dir.display())
                })?,
        };

        Ok(Self::new(parent.join(name)))
    }

    /// Prepare the directory tree, resuming an earlier session if one left
    /// the directory behind.
    ///
    /// A non-empty directory without the session log is treated as a fatal
    /// misconfiguration (most likely a wrong path) and aborts startup. On a
    /// genuine resume the previous config snapshot and channel mask are
    /// renamed to a timestamp-suffixed version so they can be regenerated,
    /// and all scratch files are deleted. Directory creation is idempotent
    /// and safe on a partially created tree.
    pub fn prepare(&self) -> Result<PrepareReport> {
        let mut report = PrepareReport::default();

        if self.root.is_dir() && fs::read_dir(&self.root)?.next().is_some() {
            report.resumed = true;
            if !self.log_path().exists() {
                bail!(
                    "the output directory {} exists but holds no session log at {}. \
                     A previous monitoring session should have left one behind, so the \
                     directory is assumed to be the wrong one. To use it anyway, create \
                     an empty file with that name.",
                    self.root.display(),
                    self.log_path().display()
                );
            }
            report.archived = self.archive_previous_session_files()?;
            self.clear_scratch()?;
        }

        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating workspace {}", self.root.display()))?;
        for sub in SUBFOLDERS {
            fs::create_dir_all(self.root.join(sub))?;
        }
        Ok(report)
    }

    /// Rename run-level files from the previous session to a timestamped
    /// version, so this session can regenerate them.
    fn archive_previous_session_files(&self) -> Result<Vec<PathBuf>> {
        let suffix = chrono::Local::now().format("_%Y-%m-%d-%H%M%S").to_string();
        let mut archived = Vec::new();
        for name in [CONFIG_SNAPSHOT, MASKED_CHANNELS] {
            let path = self.root.join(name);
            if !path.is_file() {
                continue;
            }
            let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
            let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
            let new_name = match (stem, ext) {
                (Some(stem), Some(ext)) => format!("{stem}{suffix}.{ext}"),
                _ => format!("{name}{suffix}"),
            };
            let target = self.root.join(new_name);
            fs::rename(&path, &target)
                .with_context(|| format!("archiving {}", path.display()))?;
            archived.push(target);
        }
        Ok(archived)
    }

    /// Delete every file in the scratch subfolder. Half-written stage output
    /// from an aborted session must not survive into this one.
    fn clear_scratch(&self) -> Result<()> {
        let scratch = self.scratch_dir();
        if !scratch.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&scratch)?.flatten() {
            if entry.path().is_file() {
                fs::remove_file(entry.path())
                    .with_context(|| format!("clearing {}", entry.path().display()))?;
            }
        }
        Ok(())
    }

    /// Write the effective configuration into the workspace for later
    /// reproducibility review.
    pub fn snapshot_config(&self, config: &Config) -> Result<()> {
        let yaml = config.to_yaml()?;
        fs::write(self.config_snapshot_path(), yaml)
            .with_context(|| format!("writing {}", self.config_snapshot_path().display()))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The workspace's base name; feeds run-identifier guessing.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The directory holding all run workspaces.
    pub fn parent(&self) -> &Path {
        self.root.parent().unwrap_or(&self.root)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn config_snapshot_path(&self) -> PathBuf {
        self.root.join(CONFIG_SNAPSHOT)
    }

    pub fn masked_channels_path(&self) -> PathBuf {
        self.root.join(MASKED_CHANNELS)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    pub fn converted_dir(&self) -> PathBuf {
        self.root.join("converted")
    }

    pub fn built_dir(&self) -> PathBuf {
        self.root.join("built")
    }

    pub fn stop_marker_path(&self) -> PathBuf {
        self.root.join(STOP_MARKER)
    }

    pub fn suppress_idle_path(&self) -> PathBuf {
        self.root.join(SUPPRESS_IDLE_MARKER)
    }

    /// Whether an operator dropped the graceful-stop marker.
    pub fn stop_requested(&self) -> bool {
        self.stop_marker_path().exists()
    }
}

/// What [`Workspace::prepare`] found and did; logged once logging is up.
#[derive(Debug, Default)]
pub struct PrepareReport {
    /// The directory already held a previous session.
    pub resumed: bool,

    /// Previous-session files renamed to a timestamped version.
    pub archived: Vec<PathBuf>,
}

impl PrepareReport {
    /// Emit the report. Deferred until after logging initialization because
    /// the log file itself is the resume marker.
    pub fn log(&self, workspace: &Workspace) {
        if !self.resumed {
            return;
        }
        tracing::warn!(
            "The output directory {} already exists. This is ok and expected if an \
             earlier monitoring session for this run was started (and aborted).",
            workspace.root().display()
        );
        for path in &self.archived {
            tracing::info!("Previous session file archived as {}", path.display());
        }
    }
}

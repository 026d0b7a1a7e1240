//! Configuration for the monitoring pipeline.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration, loaded once at startup and snapshotted into the
/// workspace after the run identifier has been resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Monitoring loop configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Parameters handed to the event-building collaborator
    pub eventbuilding: EventBuildingConfig,

    /// Locations of the external analysis tools
    pub tools: ToolsConfig,
}

/// Monitoring loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Parent directory for per-run output workspaces
    #[serde(default = "default_output_parent")]
    pub output_parent: PathBuf,

    /// Workspace name override (default: the raw run folder's base name)
    #[serde(default)]
    pub output_name: Option<String>,

    /// Number of parallel workers draining the job queue
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Minimum seconds between raw-directory scans
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Seconds a worker waits on an empty queue before re-checking discovery
    #[serde(default = "default_dequeue_timeout_secs")]
    pub dequeue_timeout_secs: u64,

    /// Base idle-alert threshold; alert n fires after n * base idle seconds
    #[serde(default = "default_idle_alert_base_secs")]
    pub idle_alert_base_secs: u64,

    /// Within one stage, service the newest fragment first
    #[serde(default = "default_true")]
    pub newest_first: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            output_parent: default_output_parent(),
            output_name: None,
            max_workers: default_max_workers(),
            poll_interval_secs: default_poll_interval_secs(),
            dequeue_timeout_secs: default_dequeue_timeout_secs(),
            idle_alert_base_secs: default_idle_alert_base_secs(),
            newest_first: true,
        }
    }
}

/// Fixed parameter set for the event-building collaborator. All paths are
/// resolved to absolute, existing files before the loop starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBuildingConfig {
    /// High-gain pedestal calibration file
    pub pedestals_file: PathBuf,

    /// High-gain MIP calibration file
    pub mip_calibration_file: PathBuf,

    /// Low-gain pedestal calibration file
    pub pedestals_lg_file: PathBuf,

    /// Low-gain MIP calibration file
    pub mip_calibration_lg_file: PathBuf,

    /// Tungsten configuration identifier
    pub w_config: i64,

    /// Minimum number of slabs hit for an event to be built
    pub min_slabs_hit: u32,

    /// Detector-position descriptor passed through to the builder
    pub cob_positions_string: String,

    /// Run identifier override (default: guessed from the run name)
    #[serde(default)]
    pub id_run: Option<u32>,
}

impl EventBuildingConfig {
    /// Resolve the four calibration files to absolute paths, failing on the
    /// first one that does not exist. A missing calibration file is a fatal
    /// startup fault.
    pub fn resolve_calibration_files(&mut self) -> anyhow::Result<()> {
        for path in [
            &mut self.pedestals_file,
            &mut self.mip_calibration_file,
            &mut self.pedestals_lg_file,
            &mut self.mip_calibration_lg_file,
        ] {
            *path = path
                .canonicalize()
                .with_context(|| format!("calibration file {} not found", path.display()))?;
        }
        Ok(())
    }
}

/// Locations of the external analysis tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Checkout of the testbeam analysis tools (converter macro,
    /// event builder, commissioning macros)
    pub analysis_dir: PathBuf,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from the file extension.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON, so it is also the fallback.
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.monitoring.max_workers == 0 {
            anyhow::bail!("max_workers must be >= 1");
        }
        if self.monitoring.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be > 0");
        }
        if self.monitoring.dequeue_timeout_secs == 0 {
            anyhow::bail!("dequeue_timeout_secs must be > 0");
        }
        if self.monitoring.idle_alert_base_secs == 0 {
            anyhow::bail!("idle_alert_base_secs must be > 0");
        }
        if self.eventbuilding.min_slabs_hit == 0 {
            anyhow::bail!("min_slabs_hit must be >= 1");
        }
        if self.tools.analysis_dir.as_os_str().is_empty() {
            anyhow::bail!("tools.analysis_dir must be set");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_output_parent() -> PathBuf {
    PathBuf::from("data")
}
fn default_max_workers() -> usize {
    10
}
fn default_poll_interval_secs() -> u64 {
    2
}
fn default_dequeue_timeout_secs() -> u64 {
    2
}
fn default_idle_alert_base_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
eventbuilding:
  pedestals_file: "ped.txt"
  mip_calibration_file: "mip.txt"
  pedestals_lg_file: "ped_lg.txt"
  mip_calibration_lg_file: "mip_lg.txt"
  w_config: 3
  min_slabs_hit: 4
  cob_positions_string: "8 9 10"
tools:
  analysis_dir: "SiWECAL-TB-analysis"
"#;

    #[test]
    fn test_monitoring_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.monitoring.output_parent, PathBuf::from("data"));
        assert_eq!(config.monitoring.max_workers, 10);
        assert_eq!(config.monitoring.poll_interval_secs, 2);
        assert_eq!(config.monitoring.idle_alert_base_secs, 60);
        assert!(config.monitoring.newest_first);
        assert!(config.eventbuilding.id_run.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.monitoring.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_keeps_resolved_run_id() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.eventbuilding.id_run = Some(123);
        let yaml = config.to_yaml().unwrap();
        let reread = Config::from_yaml(&yaml).unwrap();
        assert_eq!(reread.eventbuilding.id_run, Some(123));
        assert_eq!(reread.eventbuilding.w_config, 3);
    }

    #[test]
    fn test_missing_calibration_file_is_fatal() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        let err = config
            .eventbuilding
            .resolve_calibration_files()
            .unwrap_err();
        assert!(err.to_string().contains("calibration file"));
    }
}

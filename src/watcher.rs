//! Raw-data discovery and idle alerting.
//!
//! Acquisition writes numbered fragment files (`<prefix>.dat_NNNN`) into
//! the raw run directory and drops a well-known marker file when the run
//! ends. The watcher polls for both, throttled to one scan per interval,
//! and turns newly appeared fragments into Conversion jobs. Fragments may
//! appear out of order or late, so discovery works off a high-water mark
//! and silently skips gaps.

use crate::pipeline::{Job, RunState, Stage};
use crate::workspace::Workspace;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Marker file the acquisition writes at end-of-run.
pub const RUN_FINISHED_MARKER: &str = "hitsHistogram.txt";

/// Polls the raw input location for new fragments and run completion.
pub struct RawFileWatcher {
    raw_run_dir: PathBuf,
    poll_interval: Duration,
    idle: IdleMonitor,
}

impl RawFileWatcher {
    pub fn new(raw_run_dir: PathBuf, poll_interval: Duration, idle: IdleMonitor) -> Self {
        Self {
            raw_run_dir,
            poll_interval,
            idle,
        }
    }

    /// One discovery pass; returns Conversion jobs for newly appeared
    /// fragments, in increasing index order.
    ///
    /// Nothing is scanned once the run has finished, or while the throttle
    /// interval since the last scan has not elapsed — in the latter case an
    /// idle caller sleeps out the interval here instead of busy-polling.
    /// On the scan that first sees the completion marker, one extra job for
    /// the maximum-index fragment is emitted: that fragment may have been
    /// written concurrently with the marker.
    pub async fn poll_once(&self, state: &RunState, queue_is_empty: bool) -> Vec<Job> {
        if state.run_finished() {
            return Vec::new();
        }
        if !state.begin_discovery(self.poll_interval) {
            if queue_is_empty {
                tokio::time::sleep(self.poll_interval).await;
            }
            return Vec::new();
        }

        let fragments = scan_fragments(&self.raw_run_dir);
        let mut jobs = Vec::new();
        if let Some((new_max, _)) = fragments.last() {
            let start = state.high_water_mark();
            for (index, path) in &fragments {
                if *index >= start && index < new_max {
                    jobs.push(Job::new(Stage::Conversion, *index, path.clone()));
                }
            }
            state.advance_high_water_mark(*new_max);
        }

        let marker = self.raw_run_dir.join(RUN_FINISHED_MARKER);
        if marker.exists() && state.set_run_finished() {
            if let Some((index, path)) = fragments.last() {
                jobs.push(Job::new(Stage::Conversion, *index, path.clone()));
            }
            tracing::info!("The run has finished. Monitoring will try to catch up now.");
        }

        self.idle.check(state, &marker);
        jobs
    }
}

/// Enumerate `(index, path)` for all fragment files, sorted by index.
fn scan_fragments(dir: &Path) -> Vec<(u32, PathBuf)> {
    let mut fragments = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return fragments;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = fragment_index(name) {
            fragments.push((index, entry.path()));
        }
    }
    fragments.sort_by_key(|(index, _)| *index);
    fragments
}

/// Parse the 4-digit sequence suffix out of a `<prefix>.dat_NNNN` name.
pub fn fragment_index(name: &str) -> Option<u32> {
    let (_, suffix) = name.rsplit_once(".dat_")?;
    if suffix.len() != 4 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Escalating informational alerts for a pipeline that has been idle too
/// long, usually because the end-of-run marker never appeared.
///
/// Alert n fires once the idle time exceeds `n * base_threshold`, so the
/// alerts space out linearly instead of repeating at a fixed interval.
/// A marker file in the workspace suppresses the log lines; the schedule
/// keeps advancing regardless.
pub struct IdleMonitor {
    base_threshold: Duration,
    suppress_marker: PathBuf,
}

impl IdleMonitor {
    pub fn new(base_threshold: Duration, workspace: &Workspace) -> Self {
        Self {
            base_threshold,
            suppress_marker: workspace.suppress_idle_path(),
        }
    }

    pub fn check(&self, state: &RunState, completion_marker: &Path) {
        let idle_for = state.idle_duration();
        if idle_for < self.base_threshold * state.idle_alerts() {
            return;
        }
        state.bump_idle_alerts();
        if self.suppress_marker.exists() {
            return;
        }
        tracing::info!(
            "Already waiting for new jobs since {} seconds. By now we would have \
             expected to find the end-of-run marker: {}.",
            idle_for.as_secs(),
            completion_marker.display()
        );
        tracing::info!(
            "Tip: to exit the loop gracefully and run the end-of-run computations, \
             create a dummy version of that marker. To suppress this alert, create \
             the file {}.",
            self.suppress_marker.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher_for(dir: &Path, workspace: &Workspace) -> RawFileWatcher {
        // Zero interval: every poll is a real scan.
        RawFileWatcher::new(
            dir.to_path_buf(),
            Duration::ZERO,
            IdleMonitor::new(Duration::from_secs(3600), workspace),
        )
    }

    fn write_fragment(dir: &Path, index: u32) {
        std::fs::write(dir.join(format!("beam.dat_{index:04}")), "data").unwrap();
    }

    fn test_workspace() -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path().join("run"));
        workspace.prepare().unwrap();
        (tmp, workspace)
    }

    #[test]
    fn test_fragment_index_parsing() {
        assert_eq!(fragment_index("beam.dat_0042"), Some(42));
        assert_eq!(fragment_index("beam.dat_9999"), Some(9999));
        assert_eq!(fragment_index("beam.dat_123"), None);
        assert_eq!(fragment_index("beam.dat_00123"), None);
        assert_eq!(fragment_index("beam.dat_00x2"), None);
        assert_eq!(fragment_index("beam.raw_0042"), None);
        assert_eq!(fragment_index(RUN_FINISHED_MARKER), None);
    }

    #[tokio::test]
    async fn test_poll_skips_gaps_and_advances_high_water_mark() {
        let raw = tempfile::tempdir().unwrap();
        let (_out, workspace) = test_workspace();
        for index in [0, 1, 3, 5] {
            write_fragment(raw.path(), index);
        }

        let state = RunState::new();
        let watcher = watcher_for(raw.path(), &workspace);
        let jobs = watcher.poll_once(&state, false).await;

        // Everything below the new maximum (5) that exists on disk.
        let indices: Vec<_> = jobs.iter().map(|j| j.index).collect();
        assert_eq!(indices, vec![0, 1, 3]);
        assert!(jobs.iter().all(|j| j.stage == Stage::Conversion));
        assert_eq!(state.high_water_mark(), 5);
        assert!(!state.run_finished());
    }

    #[tokio::test]
    async fn test_poll_emits_nothing_below_the_high_water_mark() {
        let raw = tempfile::tempdir().unwrap();
        let (_out, workspace) = test_workspace();
        for index in [0, 1, 2] {
            write_fragment(raw.path(), index);
        }

        let state = RunState::new();
        let watcher = watcher_for(raw.path(), &workspace);
        watcher.poll_once(&state, false).await;

        // No new files: the second scan finds nothing left to enqueue.
        let jobs = watcher.poll_once(&state, false).await;
        assert!(jobs.is_empty());
        assert_eq!(state.high_water_mark(), 2);
    }

    #[tokio::test]
    async fn test_completion_marker_emits_final_fragment_once() {
        let raw = tempfile::tempdir().unwrap();
        let (_out, workspace) = test_workspace();
        for index in [0, 1, 2] {
            write_fragment(raw.path(), index);
        }
        std::fs::write(raw.path().join(RUN_FINISHED_MARKER), "").unwrap();

        let state = RunState::new();
        let watcher = watcher_for(raw.path(), &workspace);
        let jobs = watcher.poll_once(&state, false).await;

        // [0, 2) plus the extra job covering the maximum-index fragment.
        let indices: Vec<_> = jobs.iter().map(|j| j.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(state.run_finished());

        // Once finished, discovery is a no-op.
        let jobs = watcher.poll_once(&state, false).await;
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_throttled_poll_scans_nothing() {
        let raw = tempfile::tempdir().unwrap();
        let (_out, workspace) = test_workspace();
        write_fragment(raw.path(), 0);
        write_fragment(raw.path(), 1);

        let state = RunState::new();
        let watcher = RawFileWatcher::new(
            raw.path().to_path_buf(),
            Duration::from_secs(3600),
            IdleMonitor::new(Duration::from_secs(3600), &workspace),
        );
        let first = watcher.poll_once(&state, false).await;
        assert_eq!(first.len(), 1);
        // Within the throttle interval: no scan, nothing emitted.
        write_fragment(raw.path(), 2);
        let second = watcher.poll_once(&state, false).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_idle_alert_schedule_escalates() {
        let (_out, workspace) = test_workspace();
        let state = RunState::new();
        let monitor = IdleMonitor::new(Duration::ZERO, &workspace);
        let marker = Path::new("hitsHistogram.txt");

        assert_eq!(state.idle_alerts(), 1);
        monitor.check(&state, marker);
        assert_eq!(state.idle_alerts(), 2);
        monitor.check(&state, marker);
        assert_eq!(state.idle_alerts(), 3);
    }

    #[tokio::test]
    async fn test_idle_alert_far_below_threshold_is_a_noop() {
        let (_out, workspace) = test_workspace();
        let state = RunState::new();
        let monitor = IdleMonitor::new(Duration::from_secs(3600), &workspace);
        monitor.check(&state, Path::new("hitsHistogram.txt"));
        assert_eq!(state.idle_alerts(), 1);
    }

    #[tokio::test]
    async fn test_suppressed_idle_alerts_still_escalate() {
        let (_out, workspace) = test_workspace();
        std::fs::write(workspace.suppress_idle_path(), "").unwrap();
        let state = RunState::new();
        let monitor = IdleMonitor::new(Duration::ZERO, &workspace);
        monitor.check(&state, Path::new("hitsHistogram.txt"));
        assert_eq!(state.idle_alerts(), 2);
    }
}

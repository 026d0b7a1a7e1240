//! Worker pool and per-worker task loop.
//!
//! The scheduler owns one shared priority queue and a fixed pool of
//! workers. Each worker cycles through discovery (only when nothing past
//! Conversion is queued), a stop check, and a dequeue with a short
//! timeout; a dequeued job is dispatched to its stage and, on success,
//! followed by a job for the successor stage. The session ends when the
//! run has finished and the queue is drained, or when an operator drops
//! the stop marker into the workspace.

use crate::pipeline::queue::{Job, JobQueue};
use crate::pipeline::stages::{Stage, StageRunner};
use crate::watcher::RawFileWatcher;
use crate::workspace::Workspace;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared context for one monitoring session, handed to every worker.
///
/// The watcher advances the high-water mark and the finished flag; workers
/// feed the completion timestamp and the per-stage counters. Everything is
/// either atomic or behind a small internal lock, so a redundant discovery
/// scan is the worst a race can cause; duplicate stage execution is ruled
/// out by idempotent artifact publication, not by this struct.
#[derive(Debug)]
pub struct RunState {
    /// Largest fragment index already considered by discovery
    high_water_mark: AtomicU32,

    /// The end-of-acquisition marker has been seen
    run_finished: AtomicBool,

    /// An operator-requested stop preempted normal completion
    stopped_gracefully: AtomicBool,

    /// Number of idle alerts issued so far, starting at 1
    idle_alerts: AtomicU32,

    /// When discovery last scanned the raw directory
    last_discovery_check: Mutex<Option<Instant>>,

    /// When a worker last completed a job
    last_completed_job: Mutex<Instant>,

    // Session counters
    fragments_discovered: AtomicU64,
    conversions_done: AtomicU64,
    builds_done: AtomicU64,
    artifacts_reused: AtomicU64,
}

impl RunState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            high_water_mark: AtomicU32::new(0),
            run_finished: AtomicBool::new(false),
            stopped_gracefully: AtomicBool::new(false),
            idle_alerts: AtomicU32::new(1),
            last_discovery_check: Mutex::new(None),
            last_completed_job: Mutex::new(Instant::now()),
            fragments_discovered: AtomicU64::new(0),
            conversions_done: AtomicU64::new(0),
            builds_done: AtomicU64::new(0),
            artifacts_reused: AtomicU64::new(0),
        })
    }

    pub fn high_water_mark(&self) -> u32 {
        self.high_water_mark.load(Ordering::Relaxed)
    }

    pub fn advance_high_water_mark(&self, new_max: u32) {
        self.high_water_mark.fetch_max(new_max, Ordering::Relaxed);
    }

    pub fn run_finished(&self) -> bool {
        self.run_finished.load(Ordering::Relaxed)
    }

    /// Returns true only for the caller that flips the flag.
    pub fn set_run_finished(&self) -> bool {
        !self.run_finished.swap(true, Ordering::Relaxed)
    }

    pub fn stopped_gracefully(&self) -> bool {
        self.stopped_gracefully.load(Ordering::Relaxed)
    }

    /// Returns true only for the caller that records the stop.
    pub fn mark_stopped_gracefully(&self) -> bool {
        self.stopped_gracefully
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn idle_alerts(&self) -> u32 {
        self.idle_alerts.load(Ordering::Relaxed)
    }

    pub fn bump_idle_alerts(&self) {
        self.idle_alerts.fetch_add(1, Ordering::Relaxed);
    }

    /// Claim a discovery scan if the throttle interval has elapsed.
    /// Check and timestamp update are one step, so concurrent workers do
    /// not both scan for the same interval.
    pub fn begin_discovery(&self, interval: Duration) -> bool {
        let mut last = self.last_discovery_check.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    pub fn record_discovered(&self, count: usize) {
        self.fragments_discovered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self, stage: Stage, reused: bool) {
        *self.last_completed_job.lock().unwrap() = Instant::now();
        if reused {
            self.artifacts_reused.fetch_add(1, Ordering::Relaxed);
        }
        match stage {
            Stage::Conversion => self.conversions_done.fetch_add(1, Ordering::Relaxed),
            Stage::EventBuilding => self.builds_done.fetch_add(1, Ordering::Relaxed),
            Stage::Monitoring => 0,
        };
    }

    /// Time since a worker last completed a job.
    pub fn idle_duration(&self) -> Duration {
        self.last_completed_job.lock().unwrap().elapsed()
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of parallel workers
    pub max_workers: usize,

    /// How long a worker waits on an empty queue before re-checking
    /// discovery and termination conditions
    pub dequeue_timeout: Duration,

    /// Delay between worker launches; gives the first workers a head start
    /// on the initial discovery scan
    pub worker_start_stagger: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            dequeue_timeout: Duration::from_secs(2),
            worker_start_stagger: Duration::from_secs(1),
        }
    }
}

/// The pipeline scheduler: priority queue plus bounded worker pool.
pub struct Scheduler {
    queue: Arc<JobQueue>,
    state: Arc<RunState>,
    runner: Arc<dyn StageRunner>,
    watcher: Arc<RawFileWatcher>,
    workspace: Workspace,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        state: Arc<RunState>,
        runner: Arc<dyn StageRunner>,
        watcher: Arc<RawFileWatcher>,
        workspace: Workspace,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            state,
            runner,
            watcher,
            workspace,
            config,
        }
    }

    /// Run the worker pool until the session completes.
    ///
    /// Workers are launched with a staggered start. After all workers have
    /// returned, their outcomes are inspected individually; if none faulted
    /// and the stop was not operator-requested, the queue's outstanding-work
    /// counter is awaited before the session counts as complete.
    pub async fn run(&self) -> Result<SchedulerStats> {
        tracing::info!("Starting {} pipeline workers", self.config.max_workers);

        let mut handles = Vec::with_capacity(self.config.max_workers);
        for worker_id in 0..self.config.max_workers {
            let ctx = WorkerContext {
                queue: self.queue.clone(),
                state: self.state.clone(),
                runner: self.runner.clone(),
                watcher: self.watcher.clone(),
                workspace: self.workspace.clone(),
                dequeue_timeout: self.config.dequeue_timeout,
            };
            handles.push(tokio::spawn(worker_loop(ctx, worker_id)));
            tokio::time::sleep(self.config.worker_start_stagger).await;
        }

        let results = futures::future::join_all(handles).await;
        let mut worker_faults = 0;
        for (worker_id, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    worker_faults += 1;
                    tracing::error!("Worker {worker_id} failed: {err:#}");
                }
                Err(err) => {
                    worker_faults += 1;
                    tracing::error!("Worker {worker_id} panicked: {err}");
                }
            }
        }

        // With a faulted worker the outstanding-work counter can no longer
        // be trusted to reach zero; after a graceful stop it legitimately
        // never will.
        if worker_faults == 0 && !self.state.stopped_gracefully() {
            self.queue.join().await;
        }

        Ok(SchedulerStats {
            fragments_discovered: self.state.fragments_discovered.load(Ordering::Relaxed),
            conversions: self.state.conversions_done.load(Ordering::Relaxed),
            builds: self.state.builds_done.load(Ordering::Relaxed),
            artifacts_reused: self.state.artifacts_reused.load(Ordering::Relaxed),
            worker_faults,
            stopped_gracefully: self.state.stopped_gracefully(),
        })
    }
}

/// Everything one worker needs; cheap to clone per worker.
struct WorkerContext {
    queue: Arc<JobQueue>,
    state: Arc<RunState>,
    runner: Arc<dyn StageRunner>,
    watcher: Arc<RawFileWatcher>,
    workspace: Workspace,
    dequeue_timeout: Duration,
}

/// One worker's life: discover, check for termination, dequeue, execute.
async fn worker_loop(ctx: WorkerContext, worker_id: usize) -> Result<()> {
    loop {
        // Only look for new raw input while nothing downstream is queued;
        // fragments already in flight take precedence.
        if !ctx.queue.has_downstream_work() {
            let jobs = ctx.watcher.poll_once(&ctx.state, ctx.queue.is_empty()).await;
            if !jobs.is_empty() {
                ctx.state.record_discovered(jobs.len());
                tracing::debug!("Worker {worker_id} discovered {} new fragments", jobs.len());
            }
            for job in jobs {
                ctx.queue.push(job);
            }
        }

        let all_done = ctx.state.run_finished() && ctx.queue.is_empty();
        if all_done || ctx.workspace.stop_requested() {
            if !all_done && ctx.state.mark_stopped_gracefully() {
                tracing::info!(
                    "Graceful stop granted before the end of monitoring, as requested \
                     via {}.",
                    ctx.workspace.stop_marker_path().display()
                );
            }
            return Ok(());
        }

        let Some(job) = ctx.queue.pop_timeout(ctx.dequeue_timeout).await else {
            continue;
        };
        execute_job(&ctx, job).await;
    }
}

/// Dispatch one job and enqueue the follow-on for the successor stage.
///
/// A stage failure is unrecoverable: it is logged with its full subprocess
/// context and the whole process exits, leaving the failing fragment's
/// scratch output in place for inspection.
async fn execute_job(ctx: &WorkerContext, job: Job) {
    let outcome = match job.stage {
        Stage::Conversion | Stage::EventBuilding => {
            match ctx.runner.run_stage(job.stage, &job.path, job.index).await {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    err.log();
                    std::process::exit(1);
                }
            }
        }
        Stage::Monitoring => {
            tracing::debug!(
                "Online monitoring is not implemented yet; consuming job for {}",
                job.path.display()
            );
            None
        }
    };

    if let (Some(outcome), Some(next)) = (&outcome, job.stage.successor()) {
        ctx.queue
            .push(Job::new(next, job.index, outcome.artifact.clone()));
    }

    ctx.queue.task_done();
    let reused = outcome.as_ref().is_some_and(|o| o.reused);
    ctx.state.record_job_completed(job.stage, reused);
    tracing::debug!("One task done: {} for {}", job.stage, job.path.display());
}

/// Statistics from a completed monitoring session.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Raw fragments discovered and enqueued
    pub fragments_discovered: u64,

    /// Conversion jobs completed
    pub conversions: u64,

    /// Event-building jobs completed
    pub builds: u64,

    /// Jobs satisfied by an already-published artifact
    pub artifacts_reused: u64,

    /// Workers that ended with a fault
    pub worker_faults: usize,

    /// An operator stop preempted natural completion
    pub stopped_gracefully: bool,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Discovered: {}, Converted: {}, Built: {}, Reused: {}, Worker faults: {}{}",
            self.fragments_discovered,
            self.conversions,
            self.builds,
            self.artifacts_reused,
            self.worker_faults,
            if self.stopped_gracefully {
                " (stopped gracefully)"
            } else {
                ""
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.dequeue_timeout, Duration::from_secs(2));
        assert_eq!(config.worker_start_stagger, Duration::from_secs(1));
    }

    #[test]
    fn test_run_state_flags_flip_once() {
        let state = RunState::new();
        assert!(state.set_run_finished());
        assert!(!state.set_run_finished());
        assert!(state.run_finished());

        assert!(state.mark_stopped_gracefully());
        assert!(!state.mark_stopped_gracefully());
        assert!(state.stopped_gracefully());
    }

    #[test]
    fn test_high_water_mark_never_moves_backwards() {
        let state = RunState::new();
        state.advance_high_water_mark(7);
        state.advance_high_water_mark(3);
        assert_eq!(state.high_water_mark(), 7);
    }

    #[test]
    fn test_discovery_throttle_claims_one_scan_per_interval() {
        let state = RunState::new();
        let interval = Duration::from_secs(60);
        assert!(state.begin_discovery(interval));
        assert!(!state.begin_discovery(interval));
        // A zero interval is always due again.
        assert!(state.begin_discovery(Duration::ZERO));
    }

    #[test]
    fn test_stats_display() {
        let stats = SchedulerStats {
            fragments_discovered: 12,
            conversions: 12,
            builds: 11,
            artifacts_reused: 3,
            worker_faults: 0,
            stopped_gracefully: true,
        };
        let display = format!("{stats}");
        assert!(display.contains("Converted: 12"));
        assert!(display.contains("stopped gracefully"));
    }
}

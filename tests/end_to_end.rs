//! End-to-end monitoring sessions against stubbed stage collaborators.
//!
//! The external toolchain is replaced by a runner that copies its input to
//! the artifact path, so the full loop (discovery, priority scheduling,
//! stage chaining, termination) runs in-process.

use async_trait::async_trait;
use ecal_monitor::watcher::RUN_FINISHED_MARKER;
use ecal_monitor::{
    IdleMonitor, JobQueue, RawFileWatcher, RunState, Scheduler, SchedulerConfig, Stage,
    StageError, StageOutcome, StageRunner, Workspace,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Stage runner that echoes its input into the final artifact path.
struct EchoStageRunner {
    workspace: Workspace,
}

#[async_trait]
impl StageRunner for EchoStageRunner {
    async fn run_stage(
        &self,
        stage: Stage,
        input: &Path,
        _index: u32,
    ) -> Result<StageOutcome, StageError> {
        let name = input.file_name().unwrap().to_string_lossy().into_owned();
        let final_path = match stage {
            Stage::Conversion => self
                .workspace
                .converted_dir()
                .join(format!("converted_{name}.root")),
            Stage::EventBuilding => self
                .workspace
                .built_dir()
                .join(name.replace("converted_", "build_")),
            Stage::Monitoring => {
                return Ok(StageOutcome {
                    artifact: input.to_path_buf(),
                    reused: true,
                })
            }
        };
        if final_path.exists() {
            return Ok(StageOutcome {
                artifact: final_path,
                reused: true,
            });
        }
        std::fs::copy(input, &final_path).unwrap();
        Ok(StageOutcome {
            artifact: final_path,
            reused: false,
        })
    }
}

struct Session {
    _raw: TempDir,
    _out: TempDir,
    workspace: Workspace,
    state: Arc<RunState>,
    queue: Arc<JobQueue>,
    scheduler: Scheduler,
}

/// Assemble a small, fast session over `fragment_count` raw fragments.
fn session(fragment_count: u32, finished: bool) -> Session {
    let raw = TempDir::new().unwrap();
    for index in 0..fragment_count {
        std::fs::write(
            raw.path().join(format!("beam.dat_{index:04}")),
            format!("fragment {index}"),
        )
        .unwrap();
    }
    if finished {
        std::fs::write(raw.path().join(RUN_FINISHED_MARKER), "").unwrap();
    }

    let out = TempDir::new().unwrap();
    let workspace = Workspace::new(out.path().join("run_0001"));
    workspace.prepare().unwrap();

    let state = RunState::new();
    let queue = Arc::new(JobQueue::new(true));
    let idle = IdleMonitor::new(Duration::from_secs(3600), &workspace);
    let watcher = Arc::new(RawFileWatcher::new(
        raw.path().to_path_buf(),
        Duration::from_millis(20),
        idle,
    ));
    let runner = Arc::new(EchoStageRunner {
        workspace: workspace.clone(),
    });
    let scheduler = Scheduler::new(
        queue.clone(),
        state.clone(),
        runner,
        watcher,
        workspace.clone(),
        SchedulerConfig {
            max_workers: 3,
            dequeue_timeout: Duration::from_millis(50),
            worker_start_stagger: Duration::from_millis(5),
        },
    );

    Session {
        _raw: raw,
        _out: out,
        workspace,
        state,
        queue,
        scheduler,
    }
}

#[tokio::test]
async fn test_finished_run_is_drained_and_terminates() {
    let session = session(3, true);

    let stats = tokio::time::timeout(Duration::from_secs(30), session.scheduler.run())
        .await
        .expect("session must terminate on its own")
        .unwrap();

    // Every fragment ends up with a distinct converted and built artifact.
    for index in 0..3 {
        let converted = session
            .workspace
            .converted_dir()
            .join(format!("converted_beam.dat_{index:04}.root"));
        let built = session
            .workspace
            .built_dir()
            .join(format!("build_beam.dat_{index:04}.root"));
        assert!(converted.is_file(), "missing {}", converted.display());
        assert!(built.is_file(), "missing {}", built.display());
        assert_eq!(
            std::fs::read_to_string(&built).unwrap(),
            format!("fragment {index}")
        );
    }

    assert!(session.state.run_finished());
    assert!(session.queue.is_empty());
    assert!(!stats.stopped_gracefully);
    assert_eq!(stats.worker_faults, 0);
    assert_eq!(stats.builds, 3);
}

#[tokio::test]
async fn test_resumed_session_reuses_published_artifacts() {
    let session = session(3, true);

    // One fragment was already fully converted by an earlier session.
    std::fs::write(
        session
            .workspace
            .converted_dir()
            .join("converted_beam.dat_0001.root"),
        "fragment 1",
    )
    .unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(30), session.scheduler.run())
        .await
        .expect("session must terminate on its own")
        .unwrap();

    assert_eq!(stats.builds, 3);
    assert!(stats.artifacts_reused >= 1);
    for index in 0..3 {
        assert!(session
            .workspace
            .built_dir()
            .join(format!("build_beam.dat_{index:04}.root"))
            .is_file());
    }
}

#[tokio::test]
async fn test_stop_marker_preempts_completion_exactly_once() {
    // No completion marker: without the stop request this session would
    // poll forever.
    let session = session(2, false);
    std::fs::write(session.workspace.stop_marker_path(), "").unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(30), session.scheduler.run())
        .await
        .expect("stop marker must end the session")
        .unwrap();

    assert!(stats.stopped_gracefully);
    assert!(!session.state.run_finished());
    assert_eq!(stats.worker_faults, 0);
}

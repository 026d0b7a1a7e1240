//! Pipeline orchestration: job queue, worker pool, and stage contracts.

mod queue;
mod scheduler;
mod stages;

pub use queue::{Job, JobQueue};
pub use scheduler::{RunState, Scheduler, SchedulerConfig, SchedulerStats};
pub use stages::{
    EventBuildingParams, ExternalStageRunner, Stage, StageError, StageOutcome, StageRunner,
    ToolChain,
};

//! Priority job queue shared by the worker pool.
//!
//! Jobs are ordered by stage rank first (numerically smallest rank pops
//! first), so fragments already in flight through later stages drain before
//! new conversion work starts. This bounds the amount of half-processed
//! scratch state and keeps data flowing to completion. Within one stage the
//! tie-break is configurable: newest fragment first (the default) or oldest
//! first.

use crate::pipeline::stages::Stage;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// One unit of pipeline work: run `stage` on the artifact at `path`.
///
/// Jobs are immutable; completing one produces a new job for the successor
/// stage. `index` is the fragment's position in the acquisition stream
/// (monotonically increasing, not necessarily contiguous).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub stage: Stage,
    pub index: u32,
    pub path: PathBuf,
}

impl Job {
    pub fn new(stage: Stage, index: u32, path: PathBuf) -> Self {
        Self { stage, index, path }
    }
}

/// Heap entry; `order` is precomputed at push time from the tie-break
/// policy so the heap comparison stays policy-free.
#[derive(Debug)]
struct QueuedJob {
    rank: u8,
    order: u32,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry, so the smallest rank must
        // compare greatest; within a rank the larger order key wins.
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| self.order.cmp(&other.order))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    outstanding: usize,
}

/// Stage-ranked priority queue with an outstanding-work counter.
///
/// `push` adds work, `pop_timeout` hands it to a worker, and `task_done`
/// acknowledges it; `join` resolves once every pushed job has been
/// acknowledged. The counter, not the heap, decides session completion:
/// a popped job is still outstanding until its worker finishes it.
pub struct JobQueue {
    inner: Mutex<QueueState>,
    pushed: Notify,
    drained: Notify,
    newest_first: bool,
}

impl JobQueue {
    pub fn new(newest_first: bool) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                outstanding: 0,
            }),
            pushed: Notify::new(),
            drained: Notify::new(),
            newest_first,
        }
    }

    /// Enqueue a job and wake one waiting worker.
    pub fn push(&self, job: Job) {
        let order = if self.newest_first {
            job.index
        } else {
            u32::MAX - job.index
        };
        let mut state = self.inner.lock().unwrap();
        state.heap.push(QueuedJob {
            rank: job.stage.rank(),
            order,
            job,
        });
        state.outstanding += 1;
        drop(state);
        self.pushed.notify_one();
    }

    /// Pop the highest-priority job without waiting.
    pub fn try_pop(&self) -> Option<Job> {
        self.inner.lock().unwrap().heap.pop().map(|entry| entry.job)
    }

    /// Pop the highest-priority job, waiting up to `timeout` for one to be
    /// pushed. Returns `None` on timeout.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            if tokio::time::timeout_at(deadline, self.pushed.notified())
                .await
                .is_err()
            {
                // One last look; a push may have raced the deadline.
                return self.try_pop();
            }
        }
    }

    /// Acknowledge one previously popped job as fully processed.
    pub fn task_done(&self) {
        let mut state = self.inner.lock().unwrap();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every pushed job has been acknowledged via
    /// [`JobQueue::task_done`].
    pub async fn join(&self) {
        let drained = self.drained.notified();
        tokio::pin!(drained);
        loop {
            // Register for the wakeup before reading the counter; a
            // notification between the read and the await must not be lost.
            drained.as_mut().enable();
            if self.inner.lock().unwrap().outstanding == 0 {
                return;
            }
            drained.as_mut().await;
            drained.set(self.drained.notified());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    /// Whether any queued job is ranked ahead of Conversion, i.e. a fragment
    /// is partway through the pipeline. Workers only look for new raw input
    /// when this is false.
    pub fn has_downstream_work(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .heap
            .peek()
            .is_some_and(|entry| entry.rank < Stage::Conversion.rank())
    }
}

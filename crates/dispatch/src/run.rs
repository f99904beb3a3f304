//! Batch run state: the jobs dispatched so far and the run-level outcome.

use std::collections::HashMap;

use serde::Serialize;

use fleet_core::job::{Job, Stage};
use fleet_core::types::{JobId, RunId, Timestamp};
use fleet_events::BatchCounts;

use crate::queue::QueueKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// No new dispatch; waiting for in-flight jobs to settle.
    Stopping,
    Stopped,
    Completed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }
}

/// One "drain this queue across the pool" operation.
#[derive(Debug)]
pub struct BatchRun {
    pub id: RunId,
    pub queue: QueueKind,
    pub status: RunStatus,
    /// Jobs the run intends to process (dispatched plus still pending).
    planned: usize,
    /// Most jobs in flight at once; the endpoint count bounds it anyway.
    concurrency: Option<usize>,
    order: Vec<JobId>,
    jobs: HashMap<JobId, Job>,
    dropped_previews: u64,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

/// Serializable view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub queue: QueueKind,
    pub status: RunStatus,
    pub concurrency: Option<usize>,
    /// Jobs not yet dispatched.
    pub pending: usize,
    /// Dispatched jobs in dispatch order.
    pub jobs: Vec<Job>,
    pub counts: BatchCounts,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl BatchRun {
    pub fn new(id: RunId, queue: QueueKind, planned: usize) -> Self {
        Self {
            id,
            queue,
            status: RunStatus::Running,
            planned,
            concurrency: None,
            order: Vec::new(),
            jobs: HashMap::new(),
            dropped_previews: 0,
            started_at: chrono::Utc::now(),
            finished_at: None,
        }
    }

    /// Cap the number of jobs in flight at once.
    pub fn with_concurrency(mut self, limit: Option<usize>) -> Self {
        self.concurrency = limit;
        self
    }

    /// Whether another job may be dispatched without exceeding the
    /// concurrency limit.
    pub fn has_capacity(&self) -> bool {
        self.concurrency.map_or(true, |limit| self.in_flight() < limit)
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Record a job the dispatcher just assigned.
    pub fn record_dispatch(&mut self, job: Job) {
        self.order.push(job.id);
        self.jobs.insert(job.id, job);
        self.planned = self.planned.max(self.order.len());
    }

    pub fn job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn job_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    /// Dispatched jobs in dispatch order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    pub fn dispatched(&self) -> usize {
        self.order.len()
    }

    /// Jobs the run still intends to dispatch.
    pub fn pending(&self) -> usize {
        self.planned - self.order.len()
    }

    /// Shrink the pending count to what the active queue still holds.
    pub fn cap_pending(&mut self, queued: usize) {
        let pending = self.pending().min(queued);
        self.planned = self.order.len() + pending;
    }

    /// Dispatched jobs that have not settled.
    pub fn in_flight(&self) -> usize {
        self.jobs.values().filter(|job| !job.stage.is_terminal()).count()
    }

    pub fn record_dropped_preview(&mut self) -> u64 {
        self.dropped_previews += 1;
        self.dropped_previews
    }

    /// `running → stopping`. Returns `false` if the run was not running.
    pub fn request_stop(&mut self) -> bool {
        if self.status != RunStatus::Running {
            return false;
        }
        self.status = RunStatus::Stopping;
        true
    }

    pub fn finish(&mut self, status: RunStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(chrono::Utc::now());
    }

    /// Aggregate counters, computed from current per-job state.
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts {
            run_id: self.id,
            total: self.planned,
            completed: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
            dropped_previews: self.dropped_previews,
            percent: 0,
        };
        let mut progress_sum = 0usize;
        for job in self.jobs.values() {
            match job.stage {
                Stage::Completed => counts.completed += 1,
                Stage::Failed => counts.failed += 1,
                Stage::Timeout => counts.timed_out += 1,
                Stage::Cancelled => counts.cancelled += 1,
                _ => {}
            }
            progress_sum += if job.stage.is_terminal() {
                100
            } else {
                usize::from(job.progress)
            };
        }
        counts.percent = if self.planned == 0 {
            100
        } else {
            (progress_sum / self.planned).min(100) as u8
        };
        counts
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            queue: self.queue,
            status: self.status,
            concurrency: self.concurrency,
            pending: self.pending(),
            jobs: self.jobs().cloned().collect(),
            counts: self.counts(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

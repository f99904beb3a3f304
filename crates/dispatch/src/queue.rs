//! FIFO job queues.
//!
//! Two independent [`JobQueue`]s exist: the upload queue for first-pass
//! jobs and the reprocess queue for jobs re-submitted from completed
//! results. A run drains exactly one of them.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use fleet_core::error::CoreError;
use fleet_core::job::Job;
use fleet_core::types::JobId;

/// Which queue a run drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Upload,
    Reprocess,
}

impl QueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Reprocess => "reprocess",
        }
    }
}

/// Ordered collection of pending jobs.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a validated job at the tail.
    pub fn enqueue(&mut self, job: Job) -> Result<(), CoreError> {
        job.validate()?;
        if self.contains(job.id) {
            return Err(CoreError::Validation(format!("job {} is already queued", job.id)));
        }
        self.jobs.push_back(job);
        Ok(())
    }

    /// Pop the job at the head.
    pub fn dequeue_next(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Remove a job wherever it sits; the order of the rest is kept.
    pub fn remove(&mut self, job_id: JobId) -> Option<Job> {
        let index = self.jobs.iter().position(|job| job.id == job_id)?;
        self.jobs.remove(index)
    }

    /// Remove the first job matching `pred`.
    pub fn remove_where(&mut self, pred: impl Fn(&Job) -> bool) -> Option<Job> {
        let index = self.jobs.iter().position(pred)?;
        self.jobs.remove(index)
    }

    /// Drop every job; returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.jobs.len();
        self.jobs.clear();
        count
    }

    /// Snapshot of the queue in dispatch order.
    pub fn list(&self) -> Vec<Job> {
        self.jobs.iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.jobs.iter().any(|job| job.id == job_id)
    }

    pub fn peek(&self) -> Option<&Job> {
        self.jobs.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }
}

/// The upload and reprocess queues, guarded together.
#[derive(Debug, Default)]
pub struct Queues {
    pub upload: JobQueue,
    pub reprocess: JobQueue,
}

impl Queues {
    pub fn get(&self, kind: QueueKind) -> &JobQueue {
        match kind {
            QueueKind::Upload => &self.upload,
            QueueKind::Reprocess => &self.reprocess,
        }
    }

    pub fn get_mut(&mut self, kind: QueueKind) -> &mut JobQueue {
        match kind {
            QueueKind::Upload => &mut self.upload,
            QueueKind::Reprocess => &mut self.reprocess,
        }
    }

    /// Which queue holds `job_id`, if any.
    pub fn locate(&self, job_id: JobId) -> Option<QueueKind> {
        [QueueKind::Upload, QueueKind::Reprocess]
            .into_iter()
            .find(|kind| self.get(*kind).contains(job_id))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn job(name: &str) -> Job {
        Job::new(format!("/uploads/{name}"), name, serde_json::json!({}))
    }

    fn names(queue: &JobQueue) -> Vec<String> {
        queue.iter().map(|j| j.display_name.clone()).collect()
    }

    #[test]
    fn fifo_order() {
        let mut queue = JobQueue::new();
        for name in ["a.png", "b.png", "c.png"] {
            queue.enqueue(job(name)).unwrap();
        }
        assert_eq!(queue.count(), 3);
        assert_eq!(queue.peek().unwrap().display_name, "a.png");
        assert_eq!(queue.dequeue_next().unwrap().display_name, "a.png");
        assert_eq!(queue.dequeue_next().unwrap().display_name, "b.png");
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let mut queue = JobQueue::new();
        let jobs: Vec<Job> = ["a.png", "b.png", "c.png", "d.png"].map(job).into();
        for j in &jobs {
            queue.enqueue(j.clone()).unwrap();
        }

        assert_eq!(queue.remove(jobs[1].id).unwrap().id, jobs[1].id);
        assert!(queue.remove(jobs[1].id).is_none());
        assert_eq!(names(&queue), ["a.png", "c.png", "d.png"]);
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut queue = JobQueue::new();
        let j = job("a.png");
        queue.enqueue(j.clone()).unwrap();
        assert_matches!(queue.enqueue(j), Err(CoreError::Validation(_)));
    }

    #[test]
    fn invalid_job_rejected() {
        let mut queue = JobQueue::new();
        let bad = Job::new("", "a.png", serde_json::json!({}));
        assert_matches!(queue.enqueue(bad), Err(CoreError::Validation(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_reports_count() {
        let mut queue = JobQueue::new();
        queue.enqueue(job("a.png")).unwrap();
        queue.enqueue(job("b.png")).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn queues_locate_jobs() {
        let mut queues = Queues::default();
        let first = job("a.png");
        let again = first.reprocess_copy();
        queues.upload.enqueue(first.clone()).unwrap();
        queues.reprocess.enqueue(again.clone()).unwrap();

        assert_eq!(queues.locate(first.id), Some(QueueKind::Upload));
        assert_eq!(queues.locate(again.id), Some(QueueKind::Reprocess));
        assert_eq!(queues.locate(JobId::new()), None);
        assert_eq!(queues.get(QueueKind::Reprocess).count(), 1);
    }
}

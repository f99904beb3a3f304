//! Completed job results, kept across runs.
//!
//! Each finished run contributes its completed jobs. A later result for the
//! same display name replaces the earlier one, so the store holds the latest
//! output per source image until it is cleared.

use fleet_core::job::{Job, Stage};
use fleet_core::types::JobId;

#[derive(Debug, Default)]
pub struct ResultStore {
    jobs: Vec<Job>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a completed job. Returns `false` for any other stage.
    pub fn record(&mut self, job: Job) -> bool {
        if job.stage != Stage::Completed {
            return false;
        }
        self.jobs.retain(|kept| kept.display_name != job.display_name);
        self.jobs.push(job);
        true
    }

    pub fn get(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == job_id)
    }

    /// Results in the order they completed.
    pub fn list(&self) -> Vec<Job> {
        self.jobs.clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Forget every result; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let removed = self.jobs.len();
        self.jobs.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(name: &str, stage: Stage) -> Job {
        let mut job = Job::new(format!("/uploads/{name}"), name, serde_json::json!({}));
        job.assign(0).unwrap();
        let _ = job.settle(stage, None);
        job
    }

    #[test]
    fn only_completed_jobs_are_kept() {
        let mut store = ResultStore::new();
        assert!(store.record(finished("a.png", Stage::Completed)));
        assert!(!store.record(finished("b.png", Stage::Failed)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn newer_result_replaces_same_name() {
        let mut store = ResultStore::new();
        let first = finished("a.png", Stage::Completed);
        let second = finished("a.png", Stage::Completed);
        store.record(first.clone());
        store.record(finished("b.png", Stage::Completed));
        store.record(second.clone());

        assert!(store.get(first.id).is_none());
        assert_eq!(store.get(second.id).unwrap().display_name, "a.png");
        let names: Vec<_> = store.list().into_iter().map(|j| j.display_name).collect();
        assert_eq!(names, vec!["b.png", "a.png"]);
    }

    #[test]
    fn clear_reports_removed_count() {
        let mut store = ResultStore::new();
        store.record(finished("a.png", Stage::Completed));
        store.record(finished("b.png", Stage::Completed));
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
    }
}

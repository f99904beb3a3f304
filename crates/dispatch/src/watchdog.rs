//! Per-job watchdog timers.
//!
//! A timer is armed when a job is assigned and disarmed when the job
//! settles. A timer that fires runs its callback once; a disarmed timer
//! never fires.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_core::types::JobId;

#[derive(Debug, Default)]
pub struct Watchdogs {
    timers: HashMap<JobId, CancellationToken>,
}

impl Watchdogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a timer that calls `on_fire` after `after` unless disarmed.
    ///
    /// Re-arming a job replaces its previous timer.
    pub fn arm<F>(&mut self, job_id: JobId, after: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        if let Some(previous) = self.timers.insert(job_id, token.clone()) {
            previous.cancel();
        }
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => on_fire(),
            }
        });
    }

    /// Cancel the job's timer. Returns `false` if none was armed.
    pub fn disarm(&mut self, job_id: JobId) -> bool {
        match self.timers.remove(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn disarm_all(&mut self) {
        for (_, token) in self.timers.drain() {
            token.cancel();
        }
    }

    pub fn armed(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&fired);
        (fired, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_deadline() {
        let mut watchdogs = Watchdogs::new();
        let (fired, on_fire) = counter();
        watchdogs.arm(JobId::new(), Duration::from_secs(600), on_fire);

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let mut watchdogs = Watchdogs::new();
        let job = JobId::new();
        let (fired, on_fire) = counter();
        watchdogs.arm(job, Duration::from_secs(10), on_fire);

        assert!(watchdogs.disarm(job));
        assert!(!watchdogs.disarm(job));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(watchdogs.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let mut watchdogs = Watchdogs::new();
        let job = JobId::new();
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        watchdogs.arm(job, Duration::from_secs(5), on_first);
        watchdogs.arm(job, Duration::from_secs(20), on_second);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(watchdogs.armed(), 1);
    }
}

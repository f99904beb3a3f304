//! Event relay: turns raw endpoint events into job transitions and
//! normalized [`BatchEvent`]s.
//!
//! Pure state transformation over the run and the pool; the caller holds
//! the locks, publishes the returned events, and schedules the side
//! effects described by [`Relayed`].

use fleet_core::endpoint::{EndpointEvent, PreviewRef};
use fleet_core::error::{CoreError, ErrorInfo};
use fleet_core::job::{Job, Stage};
use fleet_core::types::{EndpointId, EngineHandle, JobId};
use fleet_events::{BatchEvent, JobStatusUpdate};

use crate::pool::EndpointPool;
use crate::run::BatchRun;
use crate::throttle::Admission;

/// Progress band covered by the `processing` stage.
const PROCESSING_FLOOR: u64 = 10;
const PROCESSING_CEIL: u64 = 95;

/// A job that reached a terminal stage and freed its endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub job_id: JobId,
    pub endpoint: EndpointId,
    pub stage: Stage,
    /// Engine handle of the job, if one was known.
    pub handle: Option<EngineHandle>,
}

/// What applying one event produced.
#[derive(Debug, Default)]
pub struct Relayed {
    /// Normalized events to publish, in order.
    pub events: Vec<BatchEvent>,
    pub settled: Option<Settled>,
    /// A preview slot was granted; release it on timeout.
    pub preview_ticket: Option<u64>,
    /// The endpoint was removed from the pool for the rest of the run.
    pub endpoint_lost: bool,
}

impl Relayed {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.settled.is_none()
            && self.preview_ticket.is_none()
            && !self.endpoint_lost
    }
}

/// Apply one raw event from `endpoint`.
///
/// Returns `Err(CoreError::SupersededEvent)` for events that belong to no
/// current job; callers discard those silently.
pub fn apply_event(
    run: Option<&mut BatchRun>,
    pool: &mut EndpointPool,
    endpoint: EndpointId,
    event: EndpointEvent,
) -> Result<Relayed, CoreError> {
    match event {
        EndpointEvent::Connected => Ok(Relayed::default()),
        EndpointEvent::ConnectionLost { reason } => Ok(endpoint_failed(run, pool, endpoint, reason)),
        event => {
            let run_id = run.as_ref().filter(|r| r.is_active()).map(|r| r.id);
            let job_id = pool.attribute(endpoint, run_id, event.handle())?;
            let run = run.ok_or(CoreError::SupersededEvent { endpoint, run_id })?;
            apply_job_event(run, pool, endpoint, job_id, event)
        }
    }
}

fn apply_job_event(
    run: &mut BatchRun,
    pool: &mut EndpointPool,
    endpoint: EndpointId,
    job_id: JobId,
    event: EndpointEvent,
) -> Result<Relayed, CoreError> {
    let mut relayed = Relayed::default();

    match event {
        EndpointEvent::StageChanged { stage, .. } => {
            if !matches!(
                stage,
                Stage::Uploading | Stage::Processing | Stage::Downloading
            ) {
                tracing::warn!(endpoint, %job_id, stage = stage.as_str(), "Ignoring engine stage");
                return Ok(relayed);
            }
            let job = job_in(run, job_id)?;
            if job.advance(stage, None).is_applied() {
                push_status(run, job_id, &mut relayed);
            }
        }

        EndpointEvent::NodeProgress {
            node, value, max, ..
        } => {
            let job = job_in(run, job_id)?;
            let mut changed = false;
            if job.stage.ordinal() <= Stage::Processing.ordinal() {
                let progress = node_progress(value, max);
                changed |= job.advance(Stage::Processing, progress).is_applied();
            }
            if node.is_some() && job.current_node != node && !job.stage.is_terminal() {
                job.current_node = node;
                changed = true;
            }
            if changed {
                push_status(run, job_id, &mut relayed);
            }
        }

        EndpointEvent::PreviewReady { preview, .. } => {
            relay_preview(run, pool, endpoint, job_id, preview, &mut relayed);
        }

        EndpointEvent::ResultReady { outputs, .. } => {
            job_in(run, job_id)?.result = Some(outputs);
            return Ok(settle_job(run, pool, endpoint, job_id, Stage::Completed, None));
        }

        EndpointEvent::Error { message, .. } => {
            let error = CoreError::JobFailure { job_id, message };
            return Ok(settle_job(
                run,
                pool,
                endpoint,
                job_id,
                Stage::Failed,
                Some(error.info()),
            ));
        }

        EndpointEvent::Interrupted { .. } => {
            return Ok(settle_job(run, pool, endpoint, job_id, Stage::Cancelled, None));
        }

        EndpointEvent::Connected | EndpointEvent::ConnectionLost { .. } => {}
    }

    Ok(relayed)
}

/// Move a job into a terminal stage and free its endpoint.
///
/// A no-op if the job already settled.
pub fn settle_job(
    run: &mut BatchRun,
    pool: &mut EndpointPool,
    endpoint: EndpointId,
    job_id: JobId,
    stage: Stage,
    error: Option<ErrorInfo>,
) -> Relayed {
    let mut relayed = Relayed::default();
    let Some(job) = run.job_mut(job_id) else {
        return relayed;
    };
    if !job.settle(stage, error).is_applied() {
        return relayed;
    }

    let holds_job = pool
        .assignment(endpoint)
        .is_some_and(|assignment| assignment.job_id == job_id);
    let handle = if holds_job {
        pool.release(endpoint).and_then(|assignment| assignment.handle)
    } else {
        None
    };

    tracing::info!(run_id = run.id, %job_id, endpoint, stage = stage.as_str(), "Job settled");
    push_status(run, job_id, &mut relayed);
    relayed.settled = Some(Settled {
        job_id,
        endpoint,
        stage,
        handle,
    });
    relayed
}

/// Disable `endpoint` for the rest of the run and fail the job it holds.
pub fn endpoint_failed(
    run: Option<&mut BatchRun>,
    pool: &mut EndpointPool,
    endpoint: EndpointId,
    reason: String,
) -> Relayed {
    pool.mark_unavailable(endpoint);
    tracing::warn!(endpoint, reason = %reason, "Endpoint disabled after connection failure");

    let held = pool.assignment(endpoint).map(|a| (a.job_id, a.run_id));
    let mut relayed = match (run, held) {
        (Some(run), Some((job_id, run_id))) if run.id == run_id => {
            let error = CoreError::EndpointConnectionFailure {
                endpoint,
                job_id: Some(job_id),
                message: reason,
            };
            settle_job(run, pool, endpoint, job_id, Stage::Failed, Some(error.info()))
        }
        _ => Relayed::default(),
    };
    relayed.endpoint_lost = true;
    relayed
}

fn relay_preview(
    run: &mut BatchRun,
    pool: &mut EndpointPool,
    endpoint: EndpointId,
    job_id: JobId,
    preview: PreviewRef,
    relayed: &mut Relayed,
) {
    match pool.previews_mut().try_acquire(endpoint) {
        Admission::Granted { ticket } => {
            relayed.events.push(BatchEvent::PreviewReady {
                run_id: run.id,
                job_id,
                endpoint,
                ticket,
                preview,
            });
            relayed.preview_ticket = Some(ticket);
        }
        Admission::Dropped => {
            let dropped_total = run.record_dropped_preview();
            tracing::debug!(endpoint, %job_id, dropped_total, "Preview dropped");
            relayed.events.push(BatchEvent::PreviewDropped {
                run_id: run.id,
                job_id,
                endpoint,
                dropped_total,
            });
        }
        Admission::Disabled => {}
    }
}

/// Map step progress inside a node onto the job's processing band.
fn node_progress(value: u32, max: u32) -> Option<u8> {
    if max == 0 {
        return None;
    }
    let span = PROCESSING_CEIL - PROCESSING_FLOOR;
    let scaled = PROCESSING_FLOOR + u64::from(value.min(max)) * span / u64::from(max);
    u8::try_from(scaled).ok()
}

fn job_in(run: &mut BatchRun, job_id: JobId) -> Result<&mut Job, CoreError> {
    run.job_mut(job_id)
        .ok_or_else(|| CoreError::not_found("job", job_id))
}

fn push_status(run: &BatchRun, job_id: JobId, relayed: &mut Relayed) {
    if let Some(job) = run.job(job_id) {
        relayed
            .events
            .push(BatchEvent::JobStatusChanged(JobStatusUpdate::from_job(run.id, job)));
        relayed.events.push(BatchEvent::BatchProgress(run.counts()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use fleet_core::error::ErrorKind;

    use super::*;
    use crate::queue::QueueKind;

    struct Fixture {
        run: BatchRun,
        pool: EndpointPool,
        jobs: Vec<JobId>,
    }

    /// `n` endpoints, each holding one freshly dispatched job.
    fn fixture(n: usize) -> Fixture {
        let mut run = BatchRun::new(1, QueueKind::Upload, n);
        let mut pool = EndpointPool::new(n, 2, true);
        let mut jobs = Vec::new();
        for endpoint in 0..n {
            let mut job = Job::new(format!("/in/{endpoint}.png"), "x.png", serde_json::json!({}));
            job.assign(endpoint).unwrap();
            pool.assign(endpoint, job.id, run.id).unwrap();
            jobs.push(job.id);
            run.record_dispatch(job);
        }
        Fixture { run, pool, jobs }
    }

    impl Fixture {
        fn apply(&mut self, endpoint: EndpointId, event: EndpointEvent) -> Result<Relayed, CoreError> {
            apply_event(Some(&mut self.run), &mut self.pool, endpoint, event)
        }

        fn stage(&self, i: usize) -> Stage {
            self.run.job(self.jobs[i]).unwrap().stage
        }
    }

    fn stage(handle: &str, stage: Stage) -> EndpointEvent {
        EndpointEvent::StageChanged {
            handle: Some(handle.to_string()),
            stage,
        }
    }

    fn preview() -> EndpointEvent {
        EndpointEvent::PreviewReady {
            handle: None,
            preview: PreviewRef::Inline {
                mime: "image/jpeg",
                data: Arc::from(vec![1u8, 2, 3]),
            },
        }
    }

    fn result(handle: &str) -> EndpointEvent {
        EndpointEvent::ResultReady {
            handle: handle.to_string(),
            outputs: serde_json::json!({"9": {"images": []}}),
        }
    }

    #[test]
    fn full_lifecycle_in_order() {
        let mut fx = fixture(1);
        let uploading = EndpointEvent::StageChanged {
            handle: None,
            stage: Stage::Uploading,
        };
        fx.apply(0, uploading).unwrap();
        fx.apply(0, stage("p1", Stage::Processing)).unwrap();
        let progress = fx
            .apply(
                0,
                EndpointEvent::NodeProgress {
                    handle: Some("p1".into()),
                    node: Some("3".into()),
                    value: 10,
                    max: 20,
                },
            )
            .unwrap();
        assert_eq!(progress.events.len(), 2);
        assert_eq!(fx.run.job(fx.jobs[0]).unwrap().progress, 52);
        assert_eq!(fx.run.job(fx.jobs[0]).unwrap().current_node.as_deref(), Some("3"));

        fx.apply(0, stage("p1", Stage::Downloading)).unwrap();
        let done = fx.apply(0, result("p1")).unwrap();

        assert_eq!(fx.stage(0), Stage::Completed);
        assert_eq!(fx.run.job(fx.jobs[0]).unwrap().progress, 100);
        assert_matches!(done.settled, Some(Settled { stage: Stage::Completed, endpoint: 0, ref handle, .. }) if handle.as_deref() == Some("p1"));
        assert_matches!(done.events.last(), Some(BatchEvent::BatchProgress(c)) if c.completed == 1 && c.percent == 100);
        assert_eq!(fx.pool.find_idle(), Some(0));
    }

    #[test]
    fn earlier_stage_after_later_is_ignored() {
        let mut fx = fixture(1);
        fx.apply(0, stage("p1", Stage::Downloading)).unwrap();
        let late = fx.apply(0, stage("p1", Stage::Processing)).unwrap();
        assert!(late.is_empty());
        assert_eq!(fx.stage(0), Stage::Downloading);

        // Progress for a job that already moved past processing is dropped.
        let progress = fx
            .apply(
                0,
                EndpointEvent::NodeProgress {
                    handle: Some("p1".into()),
                    node: None,
                    value: 1,
                    max: 2,
                },
            )
            .unwrap();
        assert!(progress.is_empty());
        assert_eq!(fx.run.job(fx.jobs[0]).unwrap().progress, 95);
    }

    #[test]
    fn replayed_terminal_event_is_a_no_op() {
        let mut fx = fixture(1);
        fx.apply(0, result("p1")).unwrap();
        let before = fx.run.counts();

        let replay = fx.apply(0, result("p1"));
        assert_matches!(replay, Err(CoreError::SupersededEvent { endpoint: 0, .. }));
        assert_eq!(fx.run.counts(), before);
        assert_eq!(fx.stage(0), Stage::Completed);
    }

    #[test]
    fn preview_burst_grants_two_and_drops_three() {
        let mut fx = fixture(2);
        let mut ready = 0;
        let mut dropped = 0;
        for _ in 0..5 {
            let relayed = fx.apply(0, preview()).unwrap();
            match relayed.events.as_slice() {
                [BatchEvent::PreviewReady { ticket, .. }] => {
                    assert_eq!(relayed.preview_ticket, Some(*ticket));
                    ready += 1;
                }
                [BatchEvent::PreviewDropped { .. }] => dropped += 1,
                other => panic!("unexpected events {other:?}"),
            }
            assert!(fx.pool.previews().in_flight(0) <= 2);
        }
        assert_eq!((ready, dropped), (2, 3));

        // Drops never touch job stage or completion counters.
        assert_eq!(fx.stage(0), Stage::Assigned);
        let counts = fx.run.counts();
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.dropped_previews, 3);
        // Endpoint 1 has its own slots.
        assert_matches!(fx.apply(1, preview()).unwrap().events[0], BatchEvent::PreviewReady { .. });
    }

    #[test]
    fn engine_error_fails_only_that_job() {
        let mut fx = fixture(2);
        let relayed = fx
            .apply(
                1,
                EndpointEvent::Error {
                    handle: "p2".into(),
                    message: "OOM".into(),
                },
            )
            .unwrap();
        assert_eq!(fx.stage(1), Stage::Failed);
        assert_eq!(fx.stage(0), Stage::Assigned);
        let error = fx.run.job(fx.jobs[1]).unwrap().error.clone().unwrap();
        assert_eq!(error.kind, ErrorKind::JobFailure);
        assert_eq!(error.job_id, Some(fx.jobs[1]));
        assert!(relayed.settled.is_some());
        // A job failure does not disable the endpoint.
        assert!(fx.pool.is_available(1));
    }

    #[test]
    fn connection_loss_fails_job_and_disables_endpoint() {
        let mut fx = fixture(2);
        let relayed = fx
            .apply(
                1,
                EndpointEvent::ConnectionLost {
                    reason: "socket closed".into(),
                },
            )
            .unwrap();

        assert!(relayed.endpoint_lost);
        assert_eq!(fx.stage(1), Stage::Failed);
        assert_eq!(
            fx.run.job(fx.jobs[1]).unwrap().error.as_ref().unwrap().kind,
            ErrorKind::EndpointConnectionFailure
        );
        assert!(!fx.pool.is_available(1));
        assert_eq!(fx.pool.assignment(1), None);
        assert_eq!(fx.pool.find_idle(), None);
    }

    #[test]
    fn connection_loss_while_idle_still_disables() {
        let mut pool = EndpointPool::new(1, 2, true);
        let relayed = apply_event(
            None,
            &mut pool,
            0,
            EndpointEvent::ConnectionLost {
                reason: "refused".into(),
            },
        )
        .unwrap();
        assert!(relayed.endpoint_lost);
        assert!(relayed.events.is_empty());
        assert!(!pool.is_available(0));
    }

    #[test]
    fn interrupted_job_is_cancelled() {
        let mut fx = fixture(1);
        fx.apply(0, stage("p1", Stage::Processing)).unwrap();
        let relayed = fx
            .apply(0, EndpointEvent::Interrupted { handle: "p1".into() })
            .unwrap();
        assert_eq!(fx.stage(0), Stage::Cancelled);
        assert_eq!(relayed.settled.unwrap().stage, Stage::Cancelled);
    }

    #[test]
    fn events_after_run_finished_are_superseded() {
        let mut fx = fixture(1);
        fx.run.finish(crate::run::RunStatus::Stopped);
        assert_matches!(
            fx.apply(0, stage("p1", Stage::Processing)),
            Err(CoreError::SupersededEvent { run_id: None, .. })
        );
    }

    #[test]
    fn settle_twice_is_a_no_op() {
        let mut fx = fixture(1);
        let job = fx.jobs[0];
        let first = settle_job(&mut fx.run, &mut fx.pool, 0, job, Stage::Timeout, None);
        assert!(first.settled.is_some());
        let second = settle_job(&mut fx.run, &mut fx.pool, 0, job, Stage::Failed, None);
        assert!(second.is_empty());
        assert_eq!(fx.stage(0), Stage::Timeout);
    }

    #[test]
    fn node_progress_maps_into_processing_band() {
        assert_eq!(node_progress(0, 0), None);
        assert_eq!(node_progress(0, 20), Some(10));
        assert_eq!(node_progress(20, 20), Some(95));
        assert_eq!(node_progress(40, 20), Some(95));
    }

    #[test]
    fn node_progress_handles_huge_step_counts() {
        assert_eq!(node_progress(60_000_000, 60_000_000), Some(95));
        assert_eq!(node_progress(u32::MAX, u32::MAX), Some(95));
        assert_eq!(node_progress(u32::MAX / 2, u32::MAX), Some(52));
    }
}

//! The dispatcher: owns the queues, the endpoint pool, and the current
//! batch run, drives dispatch, and relays endpoint events.
//!
//! Concurrency: one control loop per run plus one relay task per
//! endpoint. Shared state lives in one `std::sync::Mutex` per aggregate
//! and no lock is held across an `.await`. When more than one is needed
//! they are taken in the order run, pool, queues, watchdogs, results.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use fleet_core::endpoint::{Endpoint, EndpointError, EndpointEvent};
use fleet_core::error::CoreError;
use fleet_core::job::{Job, Stage};
use fleet_core::types::{EndpointId, EngineHandle, JobId, RunId};
use fleet_events::{BatchEvent, EventBus, JobStatusUpdate};

use crate::config::DispatchConfig;
use crate::pool::{EndpointPool, EndpointStatus};
use crate::queue::{QueueKind, Queues};
use crate::relay::{self, Relayed};
use crate::results::ResultStore;
use crate::run::{BatchRun, RunSnapshot, RunStatus};
use crate::watchdog::Watchdogs;

#[derive(Debug, Default)]
struct RunState {
    current: Option<BatchRun>,
    last_id: RunId,
}

struct Inner {
    endpoints: Vec<Arc<dyn Endpoint>>,
    job_watchdog: Duration,
    preview_release_timeout: Duration,
    run: Mutex<RunState>,
    pool: Mutex<EndpointPool>,
    queues: Mutex<Queues>,
    watchdogs: Mutex<Watchdogs>,
    results: Mutex<ResultStore>,
    bus: EventBus,
    /// Wakes the control loop when an endpoint frees up or the run changes.
    wake: Notify,
    shutdown: CancellationToken,
}

/// Handle to the dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

/// A job handed to an endpoint by one dispatch pass.
struct Submission {
    run_id: RunId,
    endpoint: EndpointId,
    job: Job,
}

impl Dispatcher {
    /// Build the dispatcher and spawn one relay task per endpoint.
    ///
    /// `endpoints[i].id()` must equal `i`. Must be called from within a
    /// Tokio runtime.
    pub fn start(
        config: &DispatchConfig,
        endpoints: Vec<Arc<dyn Endpoint>>,
    ) -> Result<Self, CoreError> {
        if endpoints.is_empty() {
            return Err(CoreError::Validation(
                "dispatcher needs at least one endpoint".to_string(),
            ));
        }
        if let Some((index, endpoint)) = endpoints
            .iter()
            .enumerate()
            .find(|(index, endpoint)| endpoint.id() != *index)
        {
            return Err(CoreError::Validation(format!(
                "endpoint at position {index} reports id {}",
                endpoint.id()
            )));
        }

        let pool = EndpointPool::new(
            endpoints.len(),
            config.max_previews_per_endpoint,
            config.previews_enabled,
        );
        let dispatcher = Self {
            inner: Arc::new(Inner {
                job_watchdog: config.job_watchdog,
                preview_release_timeout: config.preview_release_timeout,
                run: Mutex::new(RunState::default()),
                pool: Mutex::new(pool),
                queues: Mutex::new(Queues::default()),
                watchdogs: Mutex::new(Watchdogs::new()),
                results: Mutex::new(ResultStore::new()),
                bus: EventBus::new(config.event_channel_capacity),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                endpoints,
            }),
        };
        dispatcher.spawn_relays();

        tracing::info!(
            endpoints = dispatcher.inner.endpoints.len(),
            max_previews = config.max_previews_per_endpoint,
            previews_enabled = config.previews_enabled,
            watchdog_secs = config.job_watchdog.as_secs(),
            "Dispatcher started",
        );
        Ok(dispatcher)
    }

    /// Subscribe to the normalized event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.inner.bus.subscribe()
    }

    // ---- queues ----

    /// Add a first-pass job to the upload queue.
    ///
    /// A queued upload with the same display name is superseded (removed).
    pub fn enqueue_upload(&self, job: Job) -> Result<JobId, CoreError> {
        self.enqueue(QueueKind::Upload, job)
    }

    /// Add a job to the reprocess queue.
    pub fn enqueue_reprocess(&self, mut job: Job) -> Result<JobId, CoreError> {
        job.reprocess = true;
        self.enqueue(QueueKind::Reprocess, job)
    }

    fn enqueue(&self, kind: QueueKind, job: Job) -> Result<JobId, CoreError> {
        job.validate()?;
        let job_id = job.id;

        let mut run = lock(&self.inner.run);
        let pool = lock(&self.inner.pool);
        let mut queues = lock(&self.inner.queues);

        let dispatched = run
            .current
            .as_ref()
            .is_some_and(|r| r.job(job_id).is_some());
        if dispatched || pool.endpoint_of(job_id).is_some() || queues.locate(job_id).is_some() {
            return Err(CoreError::Validation(format!("job {job_id} is already known")));
        }

        if kind == QueueKind::Upload {
            if let Some(old) = queues
                .upload
                .remove_where(|queued| queued.display_name == job.display_name)
            {
                tracing::info!(
                    superseded = %old.id,
                    %job_id,
                    display_name = %job.display_name,
                    "Queued upload superseded",
                );
            }
        }
        queues.get_mut(kind).enqueue(job)?;
        cap_active_run(run.current.as_mut(), &queues);

        tracing::debug!(%job_id, queue = kind.as_str(), "Job enqueued");
        Ok(job_id)
    }

    /// Drop every job from a queue. Jobs already dispatched are unaffected.
    pub fn clear_queue(&self, kind: QueueKind) -> usize {
        let mut run = lock(&self.inner.run);
        let mut queues = lock(&self.inner.queues);
        let removed = queues.get_mut(kind).clear();
        cap_active_run(run.current.as_mut(), &queues);
        drop(queues);
        drop(run);

        tracing::info!(queue = kind.as_str(), removed, "Queue cleared");
        self.inner.wake.notify_one();
        removed
    }

    /// Delete a queued job. Jobs bound to an endpoint are rejected.
    pub fn remove_job(&self, job_id: JobId) -> Result<Job, CoreError> {
        let mut run = lock(&self.inner.run);
        let pool = lock(&self.inner.pool);
        if let Some(endpoint) = pool.endpoint_of(job_id) {
            return Err(CoreError::invalid_state(
                Some(job_id),
                format!("job is assigned to endpoint {endpoint}; cancel it or stop the run first"),
            ));
        }
        let mut queues = lock(&self.inner.queues);
        let kind = queues
            .locate(job_id)
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        let job = queues
            .get_mut(kind)
            .remove(job_id)
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        cap_active_run(run.current.as_mut(), &queues);
        drop(queues);
        drop(pool);
        drop(run);

        self.inner.wake.notify_one();
        Ok(job)
    }

    pub fn list_queue(&self, kind: QueueKind) -> Vec<Job> {
        lock(&self.inner.queues).get(kind).list()
    }

    /// Completed jobs of every run so far, latest per display name.
    pub fn results(&self) -> Vec<Job> {
        lock(&self.inner.results).list()
    }

    /// Forget all stored results. Queued reprocess jobs are kept.
    pub fn clear_results(&self) -> usize {
        let removed = lock(&self.inner.results).clear();
        tracing::info!(removed, "Results cleared");
        removed
    }

    /// Copy a stored result into the reprocess queue with fresh seeds.
    pub fn mark_for_reprocess(&self, job_id: JobId) -> Result<JobId, CoreError> {
        let source = self.stored_result(job_id)?;

        let mut queues = lock(&self.inner.queues);
        if queues.reprocess.iter().any(|q| q.artifact == source.artifact) {
            return Err(CoreError::invalid_state(
                Some(job_id),
                "job is already marked for reprocessing",
            ));
        }
        let copy = source.reprocess_copy();
        let copy_id = copy.id;
        queues.reprocess.enqueue(copy)?;

        tracing::info!(source = %job_id, job_id = %copy_id, "Job marked for reprocessing");
        Ok(copy_id)
    }

    /// Undo [`mark_for_reprocess`](Self::mark_for_reprocess). Accepts the
    /// source job id or the reprocess job id.
    pub fn unmark_reprocess(&self, job_id: JobId) -> Result<Job, CoreError> {
        let artifact = lock(&self.inner.results)
            .get(job_id)
            .map(|job| job.artifact.clone());

        let mut run = lock(&self.inner.run);
        let mut queues = lock(&self.inner.queues);
        let removed = match queues.reprocess.remove(job_id) {
            Some(job) => Some(job),
            None => artifact.and_then(|artifact| {
                queues
                    .reprocess
                    .remove_where(|queued| queued.artifact == artifact)
            }),
        };
        let removed = removed.ok_or_else(|| CoreError::not_found("reprocess job", job_id))?;
        cap_active_run(run.current.as_mut(), &queues);
        Ok(removed)
    }

    /// Look up a completed job, first among stored results, then in the
    /// latest run.
    fn stored_result(&self, job_id: JobId) -> Result<Job, CoreError> {
        if let Some(job) = lock(&self.inner.results).get(job_id) {
            return Ok(job.clone());
        }
        let run = lock(&self.inner.run);
        let job = run
            .current
            .as_ref()
            .and_then(|r| r.job(job_id))
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        if job.stage == Stage::Completed {
            // Replaced by a newer result for the same name, or cleared.
            return Err(CoreError::not_found("result", job_id));
        }
        Err(CoreError::invalid_state(
            Some(job_id),
            format!("only completed jobs can be reprocessed, job is {}", job.stage.as_str()),
        ))
    }

    // ---- runs ----

    /// Start draining `kind` across the pool.
    ///
    /// Concurrency is bounded by the endpoint count; `concurrency` may
    /// lower it further.
    pub fn start_run(&self, kind: QueueKind, concurrency: Option<usize>) -> Result<RunId, CoreError> {
        if concurrency == Some(0) {
            return Err(CoreError::Validation(
                "concurrency limit must be at least 1".to_string(),
            ));
        }

        let run_id = {
            let mut run = lock(&self.inner.run);
            if let Some(current) = run.current.as_ref().filter(|r| r.is_active()) {
                return Err(CoreError::invalid_state(
                    None,
                    format!("run {} is still {}", current.id, current.status.as_str()),
                ));
            }
            let mut pool = lock(&self.inner.pool);
            let queues = lock(&self.inner.queues);

            let planned = queues.get(kind).count();
            if planned == 0 {
                return Err(CoreError::Validation(format!(
                    "the {} queue is empty",
                    kind.as_str()
                )));
            }

            pool.reset_availability();
            run.last_id += 1;
            let run_id = run.last_id;
            run.current = Some(BatchRun::new(run_id, kind, planned).with_concurrency(concurrency));

            tracing::info!(run_id, queue = kind.as_str(), planned, ?concurrency, "Batch run started");
            run_id
        };

        // The first pass runs inline so assignment order is deterministic.
        self.dispatch_pass();

        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.drive(run_id).await });
        Ok(run_id)
    }

    /// Stop dispatching new jobs. In-flight jobs settle on their own; the
    /// run then becomes `stopped`.
    pub fn stop(&self, run_id: RunId) -> Result<RunSnapshot, CoreError> {
        let mut run = lock(&self.inner.run);
        let current = run
            .current
            .as_mut()
            .filter(|r| r.id == run_id)
            .ok_or_else(|| CoreError::not_found("run", run_id))?;
        if current.request_stop() {
            tracing::info!(run_id, in_flight = current.in_flight(), "Batch run stopping");
        }
        let snapshot = current.snapshot();
        drop(run);

        self.inner.wake.notify_one();
        Ok(snapshot)
    }

    pub fn status(&self, run_id: RunId) -> Result<RunSnapshot, CoreError> {
        lock(&self.inner.run)
            .current
            .as_ref()
            .filter(|r| r.id == run_id)
            .map(BatchRun::snapshot)
            .ok_or_else(|| CoreError::not_found("run", run_id))
    }

    /// Snapshot of the latest run, if any.
    pub fn current_run(&self) -> Option<RunSnapshot> {
        lock(&self.inner.run).current.as_ref().map(BatchRun::snapshot)
    }

    pub fn endpoint_status(&self) -> Vec<EndpointStatus> {
        lock(&self.inner.pool).status()
    }

    /// Cancel an in-flight job: settle it as `cancelled`, free its
    /// endpoint, and ask the engine to drop it.
    pub fn cancel_job(&self, job_id: JobId) -> Result<(), CoreError> {
        let mut run = lock(&self.inner.run);
        let mut pool = lock(&self.inner.pool);
        let Some(endpoint) = pool.endpoint_of(job_id) else {
            drop(pool);
            drop(run);
            let queued = lock(&self.inner.queues).locate(job_id).is_some();
            return Err(if queued {
                CoreError::invalid_state(Some(job_id), "job is queued, not in flight; remove it instead")
            } else {
                CoreError::not_found("job", job_id)
            });
        };
        let Some(current) = run.current.as_mut() else {
            return Err(CoreError::not_found("job", job_id));
        };

        let relayed = relay::settle_job(current, &mut pool, endpoint, job_id, Stage::Cancelled, None);
        drop(pool);
        self.publish_relayed(relayed, &mut run);
        Ok(())
    }

    /// Report an admitted preview as fetched, freeing its slot early.
    ///
    /// Returns `false` if the slot was already released.
    pub fn release_preview(&self, ticket: u64) -> bool {
        lock(&self.inner.pool).previews_mut().redeem(ticket)
    }

    /// Stop every background task. In-flight jobs are left as they are.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        lock(&self.inner.watchdogs).disarm_all();
        self.inner.wake.notify_one();
        tracing::info!("Dispatcher shut down");
    }

    // ---- event relay ----

    fn spawn_relays(&self) {
        for endpoint in &self.inner.endpoints {
            let id = endpoint.id();
            let Some(mut events) = endpoint.take_events() else {
                tracing::warn!(endpoint = id, "Endpoint event stream already taken");
                continue;
            };
            let dispatcher = self.clone();
            let shutdown = self.inner.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => dispatcher.handle_endpoint_event(id, event),
                            None => {
                                tracing::warn!(endpoint = id, "Endpoint event stream closed");
                                break;
                            }
                        },
                    }
                }
            });
        }
    }

    /// Apply one raw event from `endpoint` and publish the outcome.
    pub fn handle_endpoint_event(&self, endpoint: EndpointId, event: EndpointEvent) {
        let name = event.name();
        let mut run = lock(&self.inner.run);
        let mut pool = lock(&self.inner.pool);
        let outcome = relay::apply_event(run.current.as_mut(), &mut pool, endpoint, event);
        drop(pool);

        match outcome {
            Ok(relayed) => self.publish_relayed(relayed, &mut run),
            Err(CoreError::SupersededEvent { run_id, .. }) => {
                tracing::debug!(endpoint, event = name, ?run_id, "Discarding superseded event");
            }
            Err(e) => {
                tracing::warn!(endpoint, event = name, error = %e, "Failed to apply endpoint event");
            }
        }
    }

    /// Publish relay output and schedule its side effects. Called with the
    /// run lock held so events leave in state order.
    fn publish_relayed(&self, relayed: Relayed, run: &mut MutexGuard<'_, RunState>) {
        for event in relayed.events {
            self.inner.bus.publish(event);
        }

        if let Some(ticket) = relayed.preview_ticket {
            let dispatcher = self.clone();
            let timeout = self.inner.preview_release_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if dispatcher.release_preview(ticket) {
                    tracing::trace!(ticket, "Preview slot released by timeout");
                }
            });
        }

        if let Some(settled) = relayed.settled {
            lock(&self.inner.watchdogs).disarm(settled.job_id);
            if settled.stage == Stage::Completed {
                let finished = run.current.as_ref().and_then(|r| r.job(settled.job_id));
                if let Some(job) = finished {
                    lock(&self.inner.results).record(job.clone());
                }
            }
            if matches!(settled.stage, Stage::Cancelled | Stage::Timeout) {
                if let Some(handle) = settled.handle {
                    self.cancel_on_engine(settled.endpoint, handle);
                }
            }
            self.inner.wake.notify_one();
        } else if relayed.endpoint_lost {
            self.inner.wake.notify_one();
        }
    }

    fn cancel_on_engine(&self, endpoint: EndpointId, handle: EngineHandle) {
        let Some(target) = self.inner.endpoints.get(endpoint).cloned() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = target.cancel(&handle).await {
                tracing::warn!(endpoint, handle = %handle, error = %e, "Engine cancel failed");
            }
        });
    }

    // ---- dispatch ----

    /// Control loop of one run: dispatch, then wait for an endpoint to
    /// free up, until the run finishes.
    async fn drive(&self, run_id: RunId) {
        loop {
            self.dispatch_pass();
            if self.finish_if_settled(run_id) {
                break;
            }
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
            }
        }
        tracing::debug!(run_id, "Run control loop exited");
    }

    /// Assign queued jobs to idle endpoints and spawn their submissions.
    fn dispatch_pass(&self) {
        let submissions = self.assign_idle();
        for submission in submissions {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.submit(submission).await });
        }
    }

    fn assign_idle(&self) -> Vec<Submission> {
        let mut submissions = Vec::new();
        let mut run_state = lock(&self.inner.run);
        let Some(run) = run_state.current.as_mut() else {
            return submissions;
        };
        if run.status != RunStatus::Running {
            return submissions;
        }

        let mut pool = lock(&self.inner.pool);
        let mut queues = lock(&self.inner.queues);
        while run.pending() > 0 && run.has_capacity() {
            let Some(endpoint) = pool.find_idle() else {
                break;
            };
            let Some(mut job) = queues.get_mut(run.queue).dequeue_next() else {
                run.cap_pending(0);
                break;
            };
            if let Err(e) = job.assign(endpoint).and_then(|()| pool.assign(endpoint, job.id, run.id)) {
                tracing::error!(job_id = %job.id, endpoint, error = %e, "Assignment failed");
                break;
            }

            tracing::info!(run_id = run.id, job_id = %job.id, endpoint, "Job assigned");
            self.inner
                .bus
                .publish(BatchEvent::JobStatusChanged(JobStatusUpdate::from_job(run.id, &job)));
            self.arm_watchdog(run.id, endpoint, job.id);
            run.record_dispatch(job.clone());
            submissions.push(Submission {
                run_id: run.id,
                endpoint,
                job,
            });
        }
        submissions
    }

    fn arm_watchdog(&self, run_id: RunId, endpoint: EndpointId, job_id: JobId) {
        let dispatcher = self.clone();
        let after = self.inner.job_watchdog;
        lock(&self.inner.watchdogs).arm(job_id, after, move || {
            dispatcher.on_watchdog(run_id, endpoint, job_id, after);
        });
    }

    fn on_watchdog(&self, run_id: RunId, endpoint: EndpointId, job_id: JobId, after: Duration) {
        let mut run = lock(&self.inner.run);
        let mut pool = lock(&self.inner.pool);
        let Some(current) = run.current.as_mut().filter(|r| r.id == run_id) else {
            return;
        };
        let error = CoreError::JobTimeout {
            job_id,
            after_secs: after.as_secs(),
        };
        tracing::warn!(run_id, %job_id, endpoint, "Job watchdog fired");
        let relayed = relay::settle_job(current, &mut pool, endpoint, job_id, Stage::Timeout, Some(error.info()));
        drop(pool);
        self.publish_relayed(relayed, &mut run);
    }

    async fn submit(&self, submission: Submission) {
        let Submission {
            run_id,
            endpoint,
            job,
        } = submission;
        let Some(target) = self.inner.endpoints.get(endpoint).cloned() else {
            return;
        };

        match target.submit(&job).await {
            Ok(handle) => {
                let mut pool = lock(&self.inner.pool);
                if pool.set_handle(endpoint, job.id, handle.clone()) {
                    tracing::info!(run_id, job_id = %job.id, endpoint, handle = %handle, "Job submitted");
                } else {
                    drop(pool);
                    tracing::info!(job_id = %job.id, endpoint, "Job settled before submit returned");
                    self.cancel_on_engine(endpoint, handle);
                }
            }
            Err(e) => self.submit_failed(run_id, endpoint, job.id, e),
        }
    }

    fn submit_failed(&self, run_id: RunId, endpoint: EndpointId, job_id: JobId, err: EndpointError) {
        tracing::error!(run_id, %job_id, endpoint, error = %err, "Submit failed");
        let mut run = lock(&self.inner.run);
        let mut pool = lock(&self.inner.pool);
        let Some(current) = run.current.as_mut().filter(|r| r.id == run_id) else {
            return;
        };

        let relayed = if err.is_connection_failure() {
            relay::endpoint_failed(Some(current), &mut pool, endpoint, err.to_string())
        } else {
            let error = CoreError::JobFailure {
                job_id,
                message: err.to_string(),
            };
            relay::settle_job(current, &mut pool, endpoint, job_id, Stage::Failed, Some(error.info()))
        };
        drop(pool);
        self.publish_relayed(relayed, &mut run);
    }

    /// End the run once nothing is in flight and nothing more can be
    /// dispatched. Returns `true` when the run is (already) over.
    fn finish_if_settled(&self, run_id: RunId) -> bool {
        let mut run_state = lock(&self.inner.run);
        let Some(run) = run_state.current.as_mut().filter(|r| r.id == run_id) else {
            return true;
        };
        if !run.is_active() {
            return true;
        }
        if run.in_flight() > 0 {
            return false;
        }

        let status = if run.status == RunStatus::Stopping {
            RunStatus::Stopped
        } else if run.pending() == 0 {
            RunStatus::Completed
        } else if lock(&self.inner.pool).available_count() == 0 {
            let unavailable = CoreError::EndpointUnavailable { job_id: None };
            tracing::warn!(run_id, pending = run.pending(), error = %unavailable, "No endpoint left, stopping run");
            RunStatus::Stopped
        } else {
            return false;
        };

        run.finish(status);
        let counts = run.counts();
        tracing::info!(
            run_id,
            status = status.as_str(),
            completed = counts.completed,
            failed = counts.failed,
            timed_out = counts.timed_out,
            cancelled = counts.cancelled,
            dropped_previews = counts.dropped_previews,
            "Batch run finished",
        );
        let event = match status {
            RunStatus::Completed => BatchEvent::BatchComplete(counts),
            _ => BatchEvent::BatchStopped(counts),
        };
        self.inner.bus.publish(event);
        true
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Keep an active run's pending count within what its queue still holds.
fn cap_active_run(run: Option<&mut BatchRun>, queues: &Queues) {
    if let Some(run) = run.filter(|r| r.is_active()) {
        run.cap_pending(queues.get(run.queue).count());
    }
}

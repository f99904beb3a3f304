//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for normalized
//! [`BatchEvent`]s. It is designed to be shared via `Arc<EventBus>` between
//! the dispatcher (publisher) and the presentation layer (subscribers).

use serde::Serialize;
use tokio::sync::broadcast;

use fleet_core::endpoint::PreviewRef;
use fleet_core::error::ErrorInfo;
use fleet_core::job::{Job, Stage};
use fleet_core::job_events::{
    EVENT_BATCH_COMPLETE, EVENT_BATCH_PROGRESS, EVENT_BATCH_STOPPED, EVENT_JOB_STATUS_CHANGED,
    EVENT_PREVIEW_DROPPED, EVENT_PREVIEW_READY,
};
use fleet_core::types::{EndpointId, JobId, RunId};

// ---------------------------------------------------------------------------
// BatchEvent
// ---------------------------------------------------------------------------

/// Stage/progress update for a single job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusUpdate {
    pub run_id: RunId,
    pub job_id: JobId,
    pub display_name: String,
    pub endpoint: Option<EndpointId>,
    pub stage: Stage,
    pub progress: u8,
    pub current_node: Option<String>,
    pub error: Option<ErrorInfo>,
}

impl JobStatusUpdate {
    pub fn from_job(run_id: RunId, job: &Job) -> Self {
        Self {
            run_id,
            job_id: job.id,
            display_name: job.display_name.clone(),
            endpoint: job.endpoint,
            stage: job.stage,
            progress: job.progress,
            current_node: job.current_node.clone(),
            error: job.error.clone(),
        }
    }
}

/// Aggregate counters of a run, computed from current per-job state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchCounts {
    pub run_id: RunId,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub dropped_previews: u64,
    /// Overall progress, 0-100.
    pub percent: u8,
}

/// A normalized event published to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    JobStatusChanged(JobStatusUpdate),
    BatchProgress(BatchCounts),
    BatchComplete(BatchCounts),
    BatchStopped(BatchCounts),
    PreviewReady {
        run_id: RunId,
        job_id: JobId,
        endpoint: EndpointId,
        /// Pass back to the dispatcher once the preview has been fetched.
        ticket: u64,
        preview: PreviewRef,
    },
    PreviewDropped {
        run_id: RunId,
        job_id: JobId,
        endpoint: EndpointId,
        /// Total previews dropped during the run so far.
        dropped_total: u64,
    },
}

impl BatchEvent {
    /// The wire name of this event (matches the serialized `"type"`).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobStatusChanged(_) => EVENT_JOB_STATUS_CHANGED,
            Self::BatchProgress(_) => EVENT_BATCH_PROGRESS,
            Self::BatchComplete(_) => EVENT_BATCH_COMPLETE,
            Self::BatchStopped(_) => EVENT_BATCH_STOPPED,
            Self::PreviewReady { .. } => EVENT_PREVIEW_READY,
            Self::PreviewDropped { .. } => EVENT_PREVIEW_DROPPED,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Self::JobStatusChanged(update) => update.run_id,
            Self::BatchProgress(counts)
            | Self::BatchComplete(counts)
            | Self::BatchStopped(counts) => counts.run_id,
            Self::PreviewReady { run_id, .. } | Self::PreviewDropped { run_id, .. } => *run_id,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobStatusChanged(update) => Some(update.job_id),
            Self::PreviewReady { job_id, .. } | Self::PreviewDropped { job_id, .. } => {
                Some(*job_id)
            }
            Self::BatchProgress(_) | Self::BatchComplete(_) | Self::BatchStopped(_) => None,
        }
    }

    /// `true` for the events that end a run.
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, Self::BatchComplete(_) | Self::BatchStopped(_))
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`BatchEvent`]. A subscriber that
/// falls behind by more than the capacity observes `RecvError::Lagged`
/// instead of slowing the publisher down.
pub struct EventBus {
    sender: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: BatchEvent) {
        // SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(run_id: RunId) -> BatchCounts {
        BatchCounts {
            run_id,
            total: 3,
            completed: 2,
            failed: 1,
            timed_out: 0,
            cancelled: 0,
            dropped_previews: 4,
            percent: 100,
        }
    }

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(BatchEvent::BatchComplete(counts(7)));

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.event_type(), "batch_complete");
        assert_eq!(received.run_id(), 7);
        assert!(received.is_run_terminal());
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(BatchEvent::BatchProgress(counts(1)));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.event_type(), "batch_progress");
        assert_eq!(e2.event_type(), "batch_progress");
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(BatchEvent::BatchStopped(counts(1)));
    }

    #[test]
    fn job_status_serializes_with_type_tag() {
        let mut job = Job::new("/in/a.png", "a.png", serde_json::json!({}));
        job.assign(1).unwrap();
        let event = BatchEvent::JobStatusChanged(JobStatusUpdate::from_job(3, &job));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_status_changed");
        assert_eq!(json["stage"], "assigned");
        assert_eq!(json["endpoint"], 1);
        assert_eq!(json["run_id"], 3);
        assert_eq!(event.job_id(), Some(job.id));
    }

    #[test]
    fn inline_preview_serializes_without_bytes() {
        let event = BatchEvent::PreviewReady {
            run_id: 1,
            job_id: JobId::new(),
            endpoint: 0,
            ticket: 9,
            preview: PreviewRef::Inline {
                mime: "image/jpeg",
                data: vec![0xff, 0xd8, 0xff].into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "preview_ready");
        assert_eq!(json["ticket"], 9);
        assert_eq!(json["preview"]["kind"], "inline");
        assert_eq!(json["preview"]["mime"], "image/jpeg");
        assert!(json["preview"].get("data").is_none());
    }
}

//! Structured event journal.
//!
//! [`EventJournal`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! and writes every [`BatchEvent`] to the tracing pipeline as one
//! structured record. It runs as a long-lived background task and shuts
//! down when the bus is dropped.

use tokio::sync::broadcast;

use crate::bus::BatchEvent;

/// Background service that logs normalized events.
pub struct EventJournal;

impl EventJournal {
    /// Run the journal loop until the channel closes.
    ///
    /// Preview events are logged at `debug` level; everything else at `info`.
    pub async fn run(mut receiver: broadcast::Receiver<BatchEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => Self::record(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event journal lagged, some events were not logged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, journal shutting down");
                    break;
                }
            }
        }
    }

    fn record(event: &BatchEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, event_type = event.event_type(), "Failed to serialize event");
                return;
            }
        };
        match event {
            BatchEvent::PreviewReady { .. } | BatchEvent::PreviewDropped { .. } => {
                tracing::debug!(
                    event_type = event.event_type(),
                    run_id = event.run_id(),
                    %payload,
                    "Batch event",
                );
            }
            _ => {
                tracing::info!(
                    event_type = event.event_type(),
                    run_id = event.run_id(),
                    %payload,
                    "Batch event",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BatchCounts, EventBus};

    #[tokio::test]
    async fn journal_exits_when_bus_dropped() {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        bus.publish(BatchEvent::BatchProgress(BatchCounts {
            run_id: 1,
            total: 1,
            completed: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
            dropped_previews: 0,
            percent: 10,
        }));
        drop(bus);

        // Drains the buffered event, then observes Closed and returns.
        EventJournal::run(rx).await;
    }
}

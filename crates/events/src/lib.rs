//! Fleet event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`BatchEvent`]: the normalized event envelope published by the
//!   dispatcher (`job_status_changed`, `batch_progress`, `batch_complete`,
//!   `batch_stopped`, `preview_ready`, `preview_dropped`).
//! - [`EventJournal`]: background task logging every event.

pub mod bus;
pub mod journal;

pub use bus::{BatchCounts, BatchEvent, EventBus, JobStatusUpdate};
pub use journal::EventJournal;

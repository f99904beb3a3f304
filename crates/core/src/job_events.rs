//! Event type names for the normalized event stream.
//!
//! Used as the `"type"` tag of serialized `BatchEvent`s so that the
//! presentation layer can route them without depending on Rust types.

/// A job moved to a new stage or reported new progress.
pub const EVENT_JOB_STATUS_CHANGED: &str = "job_status_changed";

/// Aggregate run progress after a job settled.
pub const EVENT_BATCH_PROGRESS: &str = "batch_progress";

/// The run drained its queue and every job settled.
pub const EVENT_BATCH_COMPLETE: &str = "batch_complete";

/// The run was stopped and every in-flight job settled.
pub const EVENT_BATCH_STOPPED: &str = "batch_stopped";

/// A preview frame was admitted through the throttle.
pub const EVENT_PREVIEW_READY: &str = "preview_ready";

/// A preview frame was dropped by the throttle.
pub const EVENT_PREVIEW_DROPPED: &str = "preview_dropped";

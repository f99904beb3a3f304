//! Domain types shared across the fleet workspace: jobs and their stage
//! state machine, endpoint seam, error taxonomy, and event names.
//!
//! Pure data and pure functions only; no I/O lives here.

pub mod endpoint;
pub mod error;
pub mod job;
pub mod job_events;
pub mod types;

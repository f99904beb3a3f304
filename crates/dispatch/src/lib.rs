//! Job dispatch across a fixed pool of generation endpoints.
//!
//! - [`queue`]: the upload and reprocess FIFO queues.
//! - [`pool`] and [`throttle`]: endpoint occupancy and preview admission.
//! - [`run`]: the batch run and its aggregate counters.
//! - [`relay`]: raw endpoint event to job transition and normalized event.
//! - [`results`]: completed jobs kept across runs for reprocessing.
//! - [`watchdog`]: per-job timeout timers.
//! - [`dispatcher`]: the control loop tying them together.

pub mod config;
pub mod dispatcher;
pub mod pool;
pub mod queue;
pub mod relay;
pub mod results;
pub mod run;
pub mod throttle;
pub mod watchdog;

pub use config::DispatchConfig;
pub use dispatcher::Dispatcher;
pub use queue::QueueKind;
pub use run::{RunSnapshot, RunStatus};

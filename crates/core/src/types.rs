use std::fmt;

use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Stable index of a generation endpoint (`0..N-1`), one per GPU.
pub type EndpointId = usize;

/// Sequence number of a batch run. Doubles as the run's public id.
pub type RunId = u64;

/// Engine-side identifier returned by an endpoint when a job is submitted
/// (the ComfyUI `prompt_id`).
pub type EngineHandle = String;

/// Unique identifier of a [`Job`](crate::job::Job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

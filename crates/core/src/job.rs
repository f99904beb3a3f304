//! Job model and the per-job stage state machine.
//!
//! Forward order is `queued → assigned → uploading → processing →
//! downloading → completed`. `failed` and `timeout` are reachable from any
//! non-terminal stage, `cancelled` from any in-flight stage. Once a job is
//! terminal it never moves again.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorInfo};
use crate::types::{EndpointId, JobId, Timestamp};

/// Maximum length of a job display name.
const MAX_DISPLAY_NAME_LEN: usize = 255;

/// Node inputs that carry a sampler seed.
const SEED_INPUTS: [&str; 2] = ["seed", "noise_seed"];

/// Seeds stay within the integer range JSON consumers represent exactly.
const SEED_MASK: u64 = (1 << 53) - 1;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Lifecycle stage of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Assigned,
    Uploading,
    Processing,
    Downloading,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl Stage {
    /// Position in the forward order. All terminal stages share the last slot.
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Assigned => 1,
            Self::Uploading => 2,
            Self::Processing => 3,
            Self::Downloading => 4,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Bound to an endpoint and not yet settled.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Assigned | Self::Uploading | Self::Processing | Self::Downloading
        )
    }

    /// Progress percentage implied by merely reaching this stage.
    pub fn floor_progress(self) -> u8 {
        match self {
            Self::Queued | Self::Assigned => 0,
            Self::Uploading => 5,
            Self::Processing => 10,
            Self::Downloading => 95,
            Self::Completed => 100,
            Self::Failed | Self::Timeout | Self::Cancelled => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a job in `self` may move to `next`.
    pub fn can_transition_to(self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Timeout => true,
            Self::Cancelled => self.is_in_flight(),
            Self::Queued => false,
            _ => next.ordinal() > self.ordinal(),
        }
    }
}

/// Result of feeding a stage update into a job.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The job changed (stage and/or progress).
    Applied,
    /// Stale, duplicate, or illegal update; the job is unchanged.
    Ignored,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One image's pass through the generation pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    /// Source artifact reference owned by the upload collaborator
    /// (a path on shared storage).
    pub artifact: String,
    /// Original filename shown to users.
    pub display_name: String,
    /// Engine workflow, passed through untouched apart from the input image.
    #[serde(skip)]
    pub workflow: serde_json::Value,
    pub stage: Stage,
    /// Endpoint the job was bound to, kept after settling for reporting.
    pub endpoint: Option<EndpointId>,
    /// Last known progress, 0-100.
    pub progress: u8,
    pub current_node: Option<String>,
    pub error: Option<ErrorInfo>,
    /// Engine output references once completed.
    pub result: Option<serde_json::Value>,
    /// `true` for jobs re-submitted from completed results.
    pub reprocess: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    pub fn new(
        artifact: impl Into<String>,
        display_name: impl Into<String>,
        workflow: serde_json::Value,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: JobId::new(),
            artifact: artifact.into(),
            display_name: display_name.into(),
            workflow,
            stage: Stage::Queued,
            endpoint: None,
            progress: 0,
            current_node: None,
            error: None,
            result: None,
            reprocess: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// A fresh queued copy of this job for the reprocess queue.
    ///
    /// Every literal sampler seed in the workflow is replaced, otherwise the
    /// engine would serve the cached output of the identical prompt.
    pub fn reprocess_copy(&self) -> Self {
        let mut job = Self::new(
            self.artifact.clone(),
            self.display_name.clone(),
            self.workflow.clone(),
        );
        let seed = job.id.0.as_u64_pair().0 & SEED_MASK;
        reseed_workflow(&mut job.workflow, seed);
        job.reprocess = true;
        job
    }

    /// Check the job is well-formed before it enters a queue.
    ///
    /// Rules:
    /// - The artifact reference must not be empty.
    /// - The display name must not be empty nor exceed `MAX_DISPLAY_NAME_LEN`.
    /// - The workflow must be a JSON object.
    /// - The job must still be `queued`.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.artifact.trim().is_empty() {
            return Err(CoreError::Validation(
                "Job artifact reference must not be empty".to_string(),
            ));
        }
        if self.display_name.trim().is_empty() {
            return Err(CoreError::Validation(
                "Job display name must not be empty".to_string(),
            ));
        }
        if self.display_name.len() > MAX_DISPLAY_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "Job display name must not exceed {MAX_DISPLAY_NAME_LEN} characters"
            )));
        }
        if !self.workflow.is_object() {
            return Err(CoreError::Validation(
                "Job workflow must be a JSON object".to_string(),
            ));
        }
        if self.stage != Stage::Queued {
            return Err(CoreError::invalid_state(
                Some(self.id),
                format!("job is {}, only queued jobs can be enqueued", self.stage.as_str()),
            ));
        }
        Ok(())
    }

    /// Bind a queued job to an endpoint (`queued → assigned`).
    pub fn assign(&mut self, endpoint: EndpointId) -> Result<(), CoreError> {
        if self.stage != Stage::Queued {
            return Err(CoreError::invalid_state(
                Some(self.id),
                format!("cannot assign a job that is {}", self.stage.as_str()),
            ));
        }
        self.stage = Stage::Assigned;
        self.endpoint = Some(endpoint);
        self.progress = 0;
        self.touch();
        Ok(())
    }

    /// Move the job towards `stage`, optionally reporting progress.
    ///
    /// Earlier-in-order and post-terminal updates are ignored. A repeated
    /// stage only applies when it raises progress.
    pub fn advance(&mut self, stage: Stage, progress: Option<u8>) -> Transition {
        let progress = progress.map(|p| p.min(100));

        if stage == self.stage {
            if self.stage.is_terminal() {
                return Transition::Ignored;
            }
            return match progress {
                Some(p) if p > self.progress => {
                    self.progress = p;
                    self.touch();
                    Transition::Applied
                }
                _ => Transition::Ignored,
            };
        }

        if !self.stage.can_transition_to(stage) {
            return Transition::Ignored;
        }

        self.stage = stage;
        self.progress = self
            .progress
            .max(stage.floor_progress())
            .max(progress.unwrap_or(0))
            .min(100);
        if stage == Stage::Completed {
            self.progress = 100;
        }
        self.touch();
        Transition::Applied
    }

    /// Settle the job in a failure-like terminal stage, recording `error`.
    pub fn settle(&mut self, stage: Stage, error: Option<ErrorInfo>) -> Transition {
        debug_assert!(stage.is_terminal());
        let transition = self.advance(stage, None);
        if transition.is_applied() {
            self.error = error;
            self.current_node = None;
        }
        transition
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

/// Set every numeric `seed`/`noise_seed` node input to `seed`, returning how
/// many inputs changed. Linked inputs (`["node", slot]`) are left alone.
pub fn reseed_workflow(workflow: &mut serde_json::Value, seed: u64) -> usize {
    let Some(nodes) = workflow.as_object_mut() else {
        return 0;
    };
    let mut changed = 0;
    for node in nodes.values_mut() {
        let Some(inputs) = node.get_mut("inputs").and_then(|i| i.as_object_mut()) else {
            continue;
        };
        for key in SEED_INPUTS {
            if let Some(value) = inputs.get_mut(key).filter(|v| v.is_number()) {
                let next = if value.as_u64() == Some(seed) {
                    seed.wrapping_add(1) & SEED_MASK
                } else {
                    seed
                };
                *value = serde_json::Value::from(next);
                changed += 1;
            }
        }
    }
    changed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Domain error taxonomy shared by every fleet crate.
//!
//! Each [`CoreError`] carries a machine-readable [`ErrorKind`] and, where
//! one applies, the id of the job it concerns, so that a caller can decide
//! whether re-enqueueing is worthwhile.

use serde::Serialize;

use crate::types::{EndpointId, JobId, RunId};

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    EndpointUnavailable,
    EndpointConnectionFailure,
    JobFailure,
    JobTimeout,
    SupersededEvent,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::EndpointUnavailable => "endpoint_unavailable",
            Self::EndpointConnectionFailure => "endpoint_connection_failure",
            Self::JobFailure => "job_failure",
            Self::JobTimeout => "job_timeout",
            Self::SupersededEvent => "superseded_event",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// A malformed job or queue operation, rejected synchronously.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The operation is not allowed in the entity's current state.
    #[error("Invalid state: {message}")]
    InvalidState {
        job_id: Option<JobId>,
        message: String,
    },

    /// No idle endpoint could take work when one was required.
    #[error("No endpoint available")]
    EndpointUnavailable { job_id: Option<JobId> },

    /// The endpoint's connection failed; it is disabled for the rest of the run.
    #[error("Endpoint {endpoint} connection failure: {message}")]
    EndpointConnectionFailure {
        endpoint: EndpointId,
        job_id: Option<JobId>,
        message: String,
    },

    /// The engine reported an error for one job.
    #[error("Job {job_id} failed: {message}")]
    JobFailure { job_id: JobId, message: String },

    /// The per-job watchdog fired.
    #[error("Job {job_id} timed out after {after_secs}s")]
    JobTimeout { job_id: JobId, after_secs: u64 },

    /// The event belongs to a job or run that is no longer current.
    #[error("Superseded event from endpoint {endpoint}")]
    SupersededEvent {
        endpoint: EndpointId,
        run_id: Option<RunId>,
    },
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::EndpointUnavailable { .. } => ErrorKind::EndpointUnavailable,
            Self::EndpointConnectionFailure { .. } => ErrorKind::EndpointConnectionFailure,
            Self::JobFailure { .. } => ErrorKind::JobFailure,
            Self::JobTimeout { .. } => ErrorKind::JobTimeout,
            Self::SupersededEvent { .. } => ErrorKind::SupersededEvent,
        }
    }

    /// The job this error concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::InvalidState { job_id, .. }
            | Self::EndpointUnavailable { job_id }
            | Self::EndpointConnectionFailure { job_id, .. } => *job_id,
            Self::JobFailure { job_id, .. } | Self::JobTimeout { job_id, .. } => Some(*job_id),
            Self::NotFound { .. } | Self::Validation(_) | Self::SupersededEvent { .. } => None,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(job_id: Option<JobId>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            job_id,
            message: message.into(),
        }
    }

    /// Serializable summary for the normalized event stream.
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            job_id: self.job_id(),
            message: self.to_string(),
        }
    }
}

/// The externally visible shape of an error: kind, job id, and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub job_id: Option<JobId>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_scoped_errors_expose_job_id() {
        let id = JobId::new();
        let err = CoreError::JobTimeout {
            job_id: id,
            after_secs: 600,
        };
        assert_eq!(err.kind(), ErrorKind::JobTimeout);
        assert_eq!(err.job_id(), Some(id));
        assert_eq!(err.to_string(), format!("Job {id} timed out after 600s"));
    }

    #[test]
    fn validation_has_no_job_id() {
        let err = CoreError::Validation("display name must not be empty".into());
        assert_eq!(err.job_id(), None);
        assert_eq!(err.kind().as_str(), "validation");
    }

    #[test]
    fn info_serializes_kind_in_snake_case() {
        let id = JobId::new();
        let err = CoreError::EndpointConnectionFailure {
            endpoint: 1,
            job_id: Some(id),
            message: "socket closed".into(),
        };
        let json = serde_json::to_value(err.info()).unwrap();
        assert_eq!(json["kind"], "endpoint_connection_failure");
        assert_eq!(json["job_id"], id.to_string());
    }
}

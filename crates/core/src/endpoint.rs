//! The seam between the dispatcher and a generation-engine connection.
//!
//! An [`Endpoint`] wraps one GPU-bound engine. It accepts jobs, cancels
//! them, and hands out (once) the receiver of its raw [`EndpointEvent`]
//! stream. The dispatcher programs against this trait only; the ComfyUI
//! adapter and the in-memory test endpoint both implement it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::job::{Job, Stage};
use crate::types::{EndpointId, EngineHandle};

/// Receiver half of an endpoint's raw event stream.
pub type EndpointEvents = mpsc::UnboundedReceiver<EndpointEvent>;

/// A preview image as produced by the engine.
#[derive(Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreviewRef {
    /// Encoded image bytes pushed over the connection.
    Inline {
        mime: &'static str,
        #[serde(skip)]
        data: Arc<[u8]>,
    },
    /// A URL the client fetches itself.
    Url { url: String },
}

impl fmt::Debug for PreviewRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline { mime, data } => f
                .debug_struct("Inline")
                .field("mime", mime)
                .field("len", &data.len())
                .finish(),
            Self::Url { url } => f.debug_struct("Url").field("url", url).finish(),
        }
    }
}

/// Raw, heterogeneous event emitted by one endpoint.
///
/// `handle` is `None` when the engine does not say which job the event is
/// about (binary preview frames, legacy progress messages); such events
/// are attributed to the endpoint's current job.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// The connection to the engine was (re)established.
    Connected,
    /// The connection dropped; in-flight work on this endpoint is lost.
    ConnectionLost { reason: String },
    /// The job entered `uploading`, `processing`, or `downloading`.
    StageChanged {
        handle: Option<EngineHandle>,
        stage: Stage,
    },
    /// Step-level progress inside a node.
    NodeProgress {
        handle: Option<EngineHandle>,
        node: Option<String>,
        value: u32,
        max: u32,
    },
    PreviewReady {
        handle: Option<EngineHandle>,
        preview: PreviewRef,
    },
    /// Final outputs are available.
    ResultReady {
        handle: EngineHandle,
        outputs: serde_json::Value,
    },
    /// The engine reported an error for the job.
    Error {
        handle: EngineHandle,
        message: String,
    },
    /// The engine interrupted the job.
    Interrupted { handle: EngineHandle },
}

impl EndpointEvent {
    /// The engine job this event names, if any.
    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::StageChanged { handle, .. }
            | Self::NodeProgress { handle, .. }
            | Self::PreviewReady { handle, .. } => handle.as_deref(),
            Self::ResultReady { handle, .. }
            | Self::Error { handle, .. }
            | Self::Interrupted { handle } => Some(handle),
            Self::Connected | Self::ConnectionLost { .. } => None,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::StageChanged { .. } => "stage_changed",
            Self::NodeProgress { .. } => "node_progress",
            Self::PreviewReady { .. } => "preview_ready",
            Self::ResultReady { .. } => "result_ready",
            Self::Error { .. } => "error",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}

/// Errors returned by [`Endpoint`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The engine could not be reached. Disables the endpoint for the run.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The engine refused the job (bad workflow, validation error, ...).
    #[error("Engine rejected job: {0}")]
    Rejected(String),

    /// The job's source artifact could not be read.
    #[error("Artifact error: {0}")]
    Artifact(String),
}

impl EndpointError {
    /// Whether the failure is connection-level rather than job-level.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// One GPU-bound generation-engine connection.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Stable pool index of this endpoint.
    fn id(&self) -> EndpointId;

    /// Submit a job; returns the engine's handle for it.
    ///
    /// Implementations emit `StageChanged { stage: Uploading }` before
    /// transferring the artifact.
    async fn submit(&self, job: &Job) -> Result<EngineHandle, EndpointError>;

    /// Cancel a queued or running engine job.
    async fn cancel(&self, handle: &str) -> Result<(), EndpointError>;

    /// Take the raw event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<EndpointEvents>;
}

//! One ComfyUI server exposed as a dispatcher [`Endpoint`].
//!
//! [`ComfyUIEndpoint`] owns a long-lived connection task (connect ->
//! process -> reconnect with backoff) that translates WebSocket traffic
//! into [`EndpointEvent`]s, and implements job submission and
//! cancellation over the REST API.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleet_core::endpoint::{Endpoint, EndpointError, EndpointEvent, EndpointEvents};
use fleet_core::job::{Job, Stage};
use fleet_core::types::{EndpointId, EngineHandle};

use crate::api::ComfyUIApi;
use crate::client::ComfyUIClient;
use crate::processor::process_messages;
use crate::reconnect::{connect_with_backoff, Backoff};
use crate::workflow::bind_input_image;

/// How long [`ComfyUIEndpoint::shutdown`] waits for the connection task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A ComfyUI server bound to one GPU.
pub struct ComfyUIEndpoint {
    client: Arc<ComfyUIClient>,
    api: Arc<ComfyUIApi>,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
    event_rx: Mutex<Option<EndpointEvents>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ComfyUIEndpoint {
    /// * `http` - shared HTTP client (connection pooling across endpoints).
    pub fn new(id: EndpointId, ws_url: String, api_url: String, http: reqwest::Client) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            client: Arc::new(ComfyUIClient::new(id, ws_url, api_url.clone())),
            api: Arc::new(ComfyUIApi::with_client(http, api_url)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Endpoint for the ComfyUI listening on `host:port`.
    pub fn for_host(id: EndpointId, host: &str, port: u16, http: reqwest::Client) -> Self {
        Self::new(
            id,
            format!("ws://{host}:{port}"),
            format!("http://{host}:{port}"),
            http,
        )
    }

    /// Spawn the connection task. Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.is_some() {
            return;
        }

        let client = Arc::clone(&self.client);
        let api = Arc::clone(&self.api);
        let event_tx = self.event_tx.clone();
        let connected = Arc::clone(&self.connected);
        let cancel = self.cancel.clone();

        *task = Some(tokio::spawn(async move {
            let endpoint = client.endpoint();
            tracing::info!(endpoint, ws_url = %client.ws_url(), "Starting connection task");
            run_connection_loop(&client, &api, &event_tx, &connected, &cancel).await;
            tracing::info!(endpoint, "Connection task exited");
        }));
    }

    /// Whether the WebSocket is currently up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Probe the server over HTTP.
    pub async fn health_check(&self) -> Result<(), EndpointError> {
        self.api.system_stats().await?;
        Ok(())
    }

    /// Stop the connection task, waiting briefly for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = task {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
        }
        self.connected.store(false, Ordering::Release);
    }

    fn emit(&self, event: EndpointEvent) {
        // Fails only once the dispatcher has dropped the receiver.
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl Endpoint for ComfyUIEndpoint {
    fn id(&self) -> EndpointId {
        self.client.endpoint()
    }

    async fn submit(&self, job: &Job) -> Result<EngineHandle, EndpointError> {
        if !self.is_connected() {
            return Err(EndpointError::Connection(format!(
                "not connected to {}",
                self.client.ws_url()
            )));
        }

        self.emit(EndpointEvent::StageChanged {
            handle: None,
            stage: Stage::Uploading,
        });

        let bytes = tokio::fs::read(&job.artifact)
            .await
            .map_err(|e| EndpointError::Artifact(format!("{}: {e}", job.artifact)))?;
        let file_name = Path::new(&job.artifact)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&job.display_name)
            .to_string();

        let upload = self.api.upload_image(bytes, &file_name).await?;
        let workflow =
            bind_input_image(&job.workflow, &upload.qualified_name()).map_err(EndpointError::Rejected)?;

        let response = self
            .api
            .submit_workflow(&workflow, self.client.client_id())
            .await?;
        if response.has_node_errors() {
            return Err(EndpointError::Rejected(format!(
                "workflow validation failed: {}",
                response.node_errors
            )));
        }

        tracing::info!(
            endpoint = self.id(),
            job_id = %job.id,
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn cancel(&self, handle: &str) -> Result<(), EndpointError> {
        self.api.cancel_execution(handle).await?;
        self.api.interrupt().await?;
        tracing::info!(endpoint = self.id(), prompt_id = %handle, "Cancelled ComfyUI prompt");
        Ok(())
    }

    fn take_events(&self) -> Option<EndpointEvents> {
        match self.event_rx.lock() {
            Ok(mut rx) => rx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Core connection loop: connect -> process messages -> reconnect.
///
/// Runs until the cancellation token is triggered.
async fn run_connection_loop(
    client: &ComfyUIClient,
    api: &Arc<ComfyUIApi>,
    event_tx: &mpsc::UnboundedSender<EndpointEvent>,
    connected: &AtomicBool,
    cancel: &CancellationToken,
) {
    let endpoint = client.endpoint();
    let mut backoff = Backoff::default();

    loop {
        let Some(conn) = connect_with_backoff(client, &mut backoff, cancel).await else {
            return;
        };

        connected.store(true, Ordering::Release);
        if event_tx.send(EndpointEvent::Connected).is_err() {
            return;
        }

        let mut ws_stream = conn.ws_stream;
        let reason = tokio::select! {
            _ = cancel.cancelled() => {
                connected.store(false, Ordering::Release);
                return;
            }
            reason = process_messages(&mut ws_stream, endpoint, api, event_tx) => reason,
        };

        connected.store(false, Ordering::Release);
        tracing::warn!(endpoint, reason = %reason, "Connection to ComfyUI lost");
        if event_tx.send(EndpointEvent::ConnectionLost { reason }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn closed_endpoint() -> ComfyUIEndpoint {
        ComfyUIEndpoint::for_host(3, "127.0.0.1", 1, reqwest::Client::new())
    }

    #[test]
    fn events_can_be_taken_once() {
        let endpoint = closed_endpoint();
        assert_eq!(endpoint.id(), 3);
        assert!(endpoint.take_events().is_some());
        assert!(endpoint.take_events().is_none());
    }

    #[tokio::test]
    async fn submit_without_connection_is_a_connection_failure() {
        let endpoint = closed_endpoint();
        let job = Job::new("/in/a.png", "a.png", serde_json::json!({}));

        let err = endpoint.submit(&job).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_matches!(err, EndpointError::Connection(msg) if msg.contains("ws://127.0.0.1:1"));
    }

    #[tokio::test]
    async fn health_check_fails_when_server_is_down() {
        let err = closed_endpoint().health_check().await.unwrap_err();
        assert!(err.is_connection_failure());
    }

    #[tokio::test]
    async fn shutdown_stops_reconnecting() {
        let endpoint = closed_endpoint();
        endpoint.start();
        endpoint.start();
        endpoint.shutdown().await;
        assert!(!endpoint.is_connected());
        assert!(endpoint.task.lock().unwrap().is_none());
    }
}

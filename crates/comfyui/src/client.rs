//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for the ComfyUI
//! server behind one endpoint. Call [`ComfyUIClient::connect`] to establish
//! a live [`ComfyUIConnection`] over WebSocket.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

use fleet_core::types::EndpointId;

/// The raw WebSocket stream type used for ComfyUI connections.
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for the ComfyUI server behind one endpoint.
///
/// The `client_id` is generated once and reused across reconnects: ComfyUI
/// routes execution messages only to the WebSocket whose `clientId` matches
/// the one a prompt was queued with.
pub struct ComfyUIClient {
    endpoint: EndpointId,
    client_id: String,
    ws_url: String,
    api_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    pub endpoint: EndpointId,
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// Create a new client for one endpoint.
    ///
    /// * `endpoint` - pool index of the endpoint (GPU).
    /// * `ws_url`   - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `api_url`  - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(endpoint: EndpointId, ws_url: String, api_url: String) -> Self {
        Self {
            endpoint,
            client_id: uuid::Uuid::new_v4().to_string(),
            ws_url,
            api_url,
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Client id sent during the handshake and with every queued prompt.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            endpoint = self.endpoint,
            client_id = %self.client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            endpoint: self.endpoint,
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

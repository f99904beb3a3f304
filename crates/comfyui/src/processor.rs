//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, and translates them into the
//! engine-neutral [`EndpointEvent`]s the dispatcher consumes.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use fleet_core::endpoint::{EndpointEvent, PreviewRef};
use fleet_core::job::Stage;
use fleet_core::types::EndpointId;

use crate::api::ComfyUIApi;
use crate::client::WsStream;
use crate::messages::{
    output_images, parse_binary_frame, parse_message, ComfyUIMessage, BINARY_PREVIEW_IMAGE,
};

/// Outcome of translating one text frame.
#[derive(Debug)]
pub enum Translation {
    /// Forward this event as-is.
    Event(EndpointEvent),
    /// The prompt finished; fetch its history to obtain the outputs.
    FetchOutputs(String),
}

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a fatal receive error,
/// or the stream is exhausted, and returns the reason the connection
/// ended. Completion spawns a history fetch whose result is emitted as
/// `ResultReady` (or `Error` when the history cannot be read), so frame
/// reading never waits on HTTP.
pub async fn process_messages(
    ws_stream: &mut WsStream,
    endpoint: EndpointId,
    api: &Arc<ComfyUIApi>,
    event_tx: &mpsc::UnboundedSender<EndpointEvent>,
) -> String {
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                for translation in translate_text(&text, endpoint, api) {
                    match translation {
                        Translation::Event(event) => {
                            if event_tx.send(event).is_err() {
                                return "event receiver dropped".to_string();
                            }
                        }
                        Translation::FetchOutputs(prompt_id) => {
                            spawn_fetch_outputs(Arc::clone(api), endpoint, prompt_id, event_tx.clone());
                        }
                    }
                }
            }
            Ok(Message::Binary(data)) => {
                if let Some(event) = translate_binary(&data) {
                    if event_tx.send(event).is_err() {
                        return "event receiver dropped".to_string();
                    }
                } else {
                    tracing::trace!(endpoint, len = data.len(), "Ignoring binary frame");
                }
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(endpoint, ?frame, "ComfyUI WebSocket closed");
                return "websocket closed".to_string();
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(endpoint, error = %e, "WebSocket receive error");
                return format!("websocket receive error: {e}");
            }
        }
    }
    "websocket stream ended".to_string()
}

/// Translate one text frame into zero or more events.
pub fn translate_text(text: &str, endpoint: EndpointId, api: &ComfyUIApi) -> Vec<Translation> {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(endpoint, error = %e, raw_message = %text, "Unhandled ComfyUI message");
            return Vec::new();
        }
    };

    match msg {
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::info!(endpoint, prompt_id = %data.prompt_id, "Execution started");
            vec![Translation::Event(EndpointEvent::StageChanged {
                handle: Some(data.prompt_id),
                stage: Stage::Processing,
            })]
        }
        ComfyUIMessage::Executing(data) => match data.node {
            Some(node) => vec![Translation::Event(EndpointEvent::NodeProgress {
                handle: Some(data.prompt_id),
                node: Some(node),
                value: 0,
                max: 0,
            })],
            None => {
                tracing::info!(endpoint, prompt_id = %data.prompt_id, "Execution finished");
                vec![
                    Translation::Event(EndpointEvent::StageChanged {
                        handle: Some(data.prompt_id.clone()),
                        stage: Stage::Downloading,
                    }),
                    Translation::FetchOutputs(data.prompt_id),
                ]
            }
        },
        ComfyUIMessage::Progress(data) => vec![Translation::Event(EndpointEvent::NodeProgress {
            handle: data.prompt_id,
            node: data.node,
            value: u32::try_from(data.value).unwrap_or(0),
            max: u32::try_from(data.max).unwrap_or(0),
        })],
        ComfyUIMessage::Executed(data) => output_images(&data.output)
            .into_iter()
            .filter(|image| image.is_temp())
            .map(|image| {
                Translation::Event(EndpointEvent::PreviewReady {
                    handle: Some(data.prompt_id.clone()),
                    preview: PreviewRef::Url {
                        url: api.view_url(&image),
                    },
                })
            })
            .collect(),
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                endpoint,
                prompt_id = %data.prompt_id,
                node_id = ?data.node_id,
                error_type = %data.exception_type,
                "Execution error",
            );
            vec![Translation::Event(EndpointEvent::Error {
                handle: data.prompt_id,
                message: format!("{}: {}", data.exception_type, data.exception_message),
            })]
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            tracing::info!(endpoint, prompt_id = %data.prompt_id, "Execution interrupted");
            vec![Translation::Event(EndpointEvent::Interrupted {
                handle: data.prompt_id,
            })]
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(endpoint, cached = data.nodes.len(), "Execution used cache");
            Vec::new()
        }
        ComfyUIMessage::ExecutionSuccess(data) => {
            tracing::debug!(endpoint, prompt_id = %data.prompt_id, "Execution success");
            Vec::new()
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                endpoint,
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            Vec::new()
        }
    }
}

/// Translate a binary frame; only preview images produce an event.
pub fn translate_binary(data: &[u8]) -> Option<EndpointEvent> {
    let frame = parse_binary_frame(data)?;
    if frame.kind != BINARY_PREVIEW_IMAGE {
        return None;
    }
    Some(EndpointEvent::PreviewReady {
        handle: None,
        preview: PreviewRef::Inline {
            mime: frame.mime(),
            data: frame.payload.into(),
        },
    })
}

/// Pull the `outputs` object of `prompt_id` out of a `/history` response.
pub fn extract_outputs(history: &serde_json::Value, prompt_id: &str) -> Option<serde_json::Value> {
    history.get(prompt_id)?.get("outputs").cloned()
}

/// Fetch a finished prompt's outputs in the background and send the
/// resulting event on `event_tx`.
pub fn spawn_fetch_outputs(
    api: Arc<ComfyUIApi>,
    endpoint: EndpointId,
    prompt_id: String,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = fetch_outputs(&api, endpoint, prompt_id).await;
        if event_tx.send(event).is_err() {
            tracing::debug!(endpoint, "Outputs fetched after the event receiver closed");
        }
    })
}

async fn fetch_outputs(api: &ComfyUIApi, endpoint: EndpointId, prompt_id: String) -> EndpointEvent {
    match api.get_history(&prompt_id).await {
        Ok(history) => match extract_outputs(&history, &prompt_id) {
            Some(outputs) => EndpointEvent::ResultReady {
                handle: prompt_id,
                outputs,
            },
            None => EndpointEvent::Error {
                handle: prompt_id,
                message: "history has no outputs for prompt".to_string(),
            },
        },
        Err(e) => {
            tracing::warn!(endpoint, prompt_id = %prompt_id, error = %e, "History fetch failed");
            EndpointEvent::Error {
                handle: prompt_id,
                message: format!("failed to fetch outputs: {e}"),
            }
        }
    }
}

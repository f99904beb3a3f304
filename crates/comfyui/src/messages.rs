//! ComfyUI WebSocket message types and parsers.
//!
//! Text frames are JSON with the shape `{"type": "<kind>", "data": {...}}`
//! and deserialize into [`ComfyUIMessage`]. Binary frames carry preview
//! images behind an 8-byte header; see [`parse_binary_frame`].

use serde::Deserialize;

/// Binary frame type for a sampler preview image.
pub const BINARY_PREVIEW_IMAGE: u32 = 1;

/// Preview image encodings announced in the binary frame header.
const PREVIEW_FORMAT_JPEG: u32 = 1;
const PREVIEW_FORMAT_PNG: u32 = 2;

/// All ComfyUI WebSocket message types the adapter understands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    #[serde(rename = "execution_start")]
    ExecutionStart(PromptData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A node is executing, or the prompt finished when `node` is `None`.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step-level progress inside a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptData),

    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// The prompt was interrupted via `/interrupt`.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload carrying only the prompt id.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Older servers omit `prompt_id` and `node` from progress messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i32,
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub exception_message: String,
    pub exception_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// An image reference inside node outputs and history records.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output` for saved results, `temp` for previews.
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl ImageRef {
    pub fn is_temp(&self) -> bool {
        self.kind == "temp"
    }
}

/// Collect the `images` listed in one node's output object.
pub fn output_images(output: &serde_json::Value) -> Vec<ImageRef> {
    output
        .get("images")
        .and_then(|images| serde_json::from_value(images.clone()).ok())
        .unwrap_or_default()
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// A decoded binary frame: 4-byte big-endian type, 4-byte big-endian
/// format info, then the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFrame<'a> {
    pub kind: u32,
    pub format: u32,
    pub payload: &'a [u8],
}

impl BinaryFrame<'_> {
    /// MIME type of a preview payload.
    pub fn mime(&self) -> &'static str {
        match self.format {
            PREVIEW_FORMAT_JPEG => "image/jpeg",
            PREVIEW_FORMAT_PNG => "image/png",
            _ => "application/octet-stream",
        }
    }
}

/// Split a binary frame into header fields and payload.
///
/// Returns `None` for frames shorter than the 8-byte header.
pub fn parse_binary_frame(data: &[u8]) -> Option<BinaryFrame<'_>> {
    if data.len() < 8 {
        return None;
    }
    let kind = u32::from_be_bytes(data[0..4].try_into().ok()?);
    let format = u32::from_be_bytes(data[4..8].try_into().ok()?);
    Some(BinaryFrame {
        kind,
        format,
        payload: &data[8..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}}}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::Status(data) => assert_eq!(data.status.exec_info.queue_remaining, 3),
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_finished() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::Executing(data) => {
                assert!(data.node.is_none());
                assert_eq!(data.prompt_id, "xyz");
            }
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_legacy_progress_without_prompt() {
        let json = r#"{"type":"progress","data":{"value":5,"max":20}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::Progress(data) => {
                assert_eq!((data.value, data.max), (5, 20));
                assert!(data.prompt_id.is_none());
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_with_prompt_and_node() {
        let json = r#"{"type":"progress","data":{"value":7,"max":30,"prompt_id":"p1","node":"3"}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::Progress(data) => {
                assert_eq!(data.prompt_id.as_deref(), Some("p1"));
                assert_eq!(data.node.as_deref(), Some("3"));
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_error_with_null_node() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":null,"exception_message":"out of memory","exception_type":"RuntimeError"}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::ExecutionError(data) => {
                assert!(data.node_id.is_none());
                assert_eq!(data.exception_message, "out of memory");
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_interrupted() {
        let json = r#"{"type":"execution_interrupted","data":{"prompt_id":"abc","node_id":"9","node_type":"KSampler","executed":[]}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::ExecutionInterrupted(data) => assert_eq!(data.prompt_id, "abc"),
            other => panic!("Expected ExecutionInterrupted, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        let json = r#"{"type":"crystools.monitor","data":{}}"#;
        assert!(parse_message(json).is_err());
    }

    #[test]
    fn output_images_reads_temp_and_output_refs() {
        let output = serde_json::json!({"images": [
            {"filename": "prev_0001.png", "subfolder": "", "type": "temp"},
            {"filename": "final.png", "type": "output"}
        ]});
        let images = output_images(&output);
        assert_eq!(images.len(), 2);
        assert!(images[0].is_temp());
        assert!(!images[1].is_temp());
        assert_eq!(images[1].subfolder, "");
    }

    #[test]
    fn output_images_tolerates_missing_key() {
        assert!(output_images(&serde_json::json!({"text": ["hi"]})).is_empty());
    }

    #[test]
    fn binary_preview_frame_is_split() {
        let mut data = vec![0, 0, 0, 1, 0, 0, 0, 2];
        data.extend_from_slice(b"\x89PNG");
        let frame = parse_binary_frame(&data).unwrap();
        assert_eq!(frame.kind, BINARY_PREVIEW_IMAGE);
        assert_eq!(frame.mime(), "image/png");
        assert_eq!(frame.payload, b"\x89PNG");
    }

    #[test]
    fn short_binary_frame_rejected() {
        assert!(parse_binary_frame(&[0, 0, 0, 1]).is_none());
    }
}

//! Binding a job's uploaded source image into its workflow graph.

use serde_json::Value;

/// Node title that marks the workflow's image input.
pub const INPUT_IMAGE_TITLE: &str = "INPUT_IMAGE";

/// Node id used when no node carries [`INPUT_IMAGE_TITLE`].
const FALLBACK_INPUT_NODE: &str = "1";

/// Return a copy of `workflow` with the input node's `inputs.image` set to
/// `image_name`.
///
/// The input node is the one whose `_meta.title` is `INPUT_IMAGE`, or node
/// `"1"` when no node is titled that way.
pub fn bind_input_image(workflow: &Value, image_name: &str) -> Result<Value, String> {
    let mut bound = workflow.clone();
    let nodes = bound
        .as_object_mut()
        .ok_or_else(|| "workflow must be a JSON object of nodes".to_string())?;

    let node_id = nodes
        .iter()
        .find(|(_, node)| {
            node.pointer("/_meta/title").and_then(Value::as_str) == Some(INPUT_IMAGE_TITLE)
        })
        .map(|(id, _)| id.clone())
        .unwrap_or_else(|| FALLBACK_INPUT_NODE.to_string());

    let inputs = nodes
        .get_mut(&node_id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| format!("workflow has no input image node (looked for node {node_id})"))?;

    inputs.insert("image".to_string(), Value::String(image_name.to_string()));
    Ok(bound)
}

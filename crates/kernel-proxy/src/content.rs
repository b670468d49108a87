//! Conversion from iopub message content to nbformat output records.

use std::collections::BTreeMap;

use jupyter_protocol::JupyterMessageContent;
use serde_json::{json, Value};

/// Convert a JupyterMessageContent to an nbformat-style output record.
///
/// jupyter_protocol serializes as: `{"ExecuteResult": {"data": {...}, ...}}`
/// nbformat expects: `{"output_type": "execute_result", "data": {...}, ...}`
///
/// Returns `None` for content that does not produce a cell output
/// (status, execute_input, comm traffic, ...).
pub fn message_content_to_nbformat(content: &JupyterMessageContent) -> Option<Value> {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(json!({
                "output_type": "stream",
                "name": name,
                "text": stream.text
            }))
        }
        JupyterMessageContent::DisplayData(data) => Some(json!({
            "output_type": "display_data",
            "data": data.data,
            "metadata": data.metadata
        })),
        JupyterMessageContent::ExecuteResult(result) => Some(json!({
            "output_type": "execute_result",
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        })),
        JupyterMessageContent::ErrorOutput(error) => Some(json!({
            "output_type": "error",
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        })),
        _ => None,
    }
}

/// Flatten a JSON object into a string-keyed, string-valued map.
///
/// Strings are kept as-is, other scalars use their JSON text, and nested
/// values are dropped. Non-objects produce an empty map.
pub fn flatten_to_strings(value: &Value) -> BTreeMap<String, String> {
    let Some(obj) = value.as_object() else {
        return BTreeMap::new();
    };
    obj.iter()
        .filter_map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), s))
        })
        .collect()
}

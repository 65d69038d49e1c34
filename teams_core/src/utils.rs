use rmcp::model::{CallToolResult, Content};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::TeamsError;

/// Tool result carrying `data` as structured content plus a text rendering for
/// clients that only read `content`.
pub fn structured_result_with_text<T: Serialize>(
    data: &T,
    text_fallback: Option<String>,
) -> Result<CallToolResult, TeamsError> {
    let value = serde_json::to_value(data)?;

    // Structured content must be an object; wrap anything else under `data`.
    let map: JsonMap<String, JsonValue> = match value {
        JsonValue::Object(m) => m,
        other => {
            let mut m = JsonMap::new();
            m.insert("data".to_string(), other);
            m
        }
    };
    let object = JsonValue::Object(map);
    let text = match text_fallback {
        Some(text) => text,
        None => serde_json::to_string_pretty(&object)?,
    };

    Ok(CallToolResult {
        content: vec![Content::text(text)],
        structured_content: Some(object),
        is_error: Some(false),
        meta: None,
    })
}

/// Tool-level failure the calling agent can read and act on.
pub fn error_result(err: &TeamsError) -> CallToolResult {
    let mut text = err.to_string();
    if err.is_retryable() {
        text.push_str(" (temporary; retrying may succeed)");
    }
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: Some(serde_json::json!({
            "error": err.code_str(),
            "retryable": err.is_retryable(),
        })),
        is_error: Some(true),
        meta: None,
    }
}

/// Trims a string to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

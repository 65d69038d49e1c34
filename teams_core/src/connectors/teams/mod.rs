//! Microsoft Teams tools over Microsoft Graph, one connector per tool group.

pub mod channels;
pub mod chats;
pub mod search;
pub mod users;

pub use channels::ChannelsConnector;
pub use chats::ChatsConnector;
pub use search::SearchConnector;
pub use users::UsersConnector;

use rmcp::model::{JsonObject, Tool};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::TeamsError;
use crate::format::html_to_plain;
use crate::utils::truncate_chars;

pub(crate) const DEFAULT_PAGE: u32 = 20;
pub(crate) const MAX_PAGE: u32 = 50;
const PREVIEW_CHARS: usize = 2000;

/// Tool definition whose input schema is generated from `T`.
pub(crate) fn tool<T: JsonSchema>(
    name: &'static str,
    description: &'static str,
) -> Result<Tool, TeamsError> {
    let schema = match serde_json::to_value(schemars::schema_for!(T))? {
        Value::Object(map) => map,
        _ => {
            return Err(TeamsError::InternalError(format!(
                "schema for {} is not an object",
                name
            )))
        }
    };
    Ok(Tool {
        name: Cow::Borrowed(name),
        title: None,
        description: Some(Cow::Borrowed(description)),
        input_schema: Arc::new(schema),
        output_schema: None,
        annotations: None,
        icons: None,
    })
}

pub(crate) fn parse_args<T: DeserializeOwned>(args: JsonObject) -> Result<T, TeamsError> {
    serde_json::from_value(Value::Object(args)).map_err(|e| TeamsError::InvalidParams(e.to_string()))
}

/// Clamps a caller-supplied page size into `1..=max`, defaulting when absent.
pub(crate) fn clamp_limit(requested: Option<i64>, default: u32, max: u32) -> u32 {
    match requested {
        None => default,
        Some(n) => n.clamp(1, i64::from(max)) as u32,
    }
}

/// Percent-encodes a Graph path segment; empty identifiers are rejected.
pub(crate) fn path_segment(field: &str, value: &str) -> Result<String, TeamsError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TeamsError::InvalidInput(format!("{} is required", field)));
    }
    Ok(urlencoding::encode(value).into_owned())
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<(), TeamsError> {
    if value.trim().is_empty() {
        return Err(TeamsError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Items of a Graph collection response.
pub(crate) fn collection(resp: &Value) -> Vec<Value> {
    resp.get("value")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub(crate) fn has_more(resp: &Value) -> bool {
    resp.get("@odata.nextLink")
        .and_then(Value::as_str)
        .is_some_and(|link| !link.is_empty())
}

pub(crate) fn sort_newest_first(items: &mut [Value]) {
    items.sort_by(|a, b| match (created_at(a), created_at(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

fn created_at(item: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    item.get("createdDateTime")
        .and_then(Value::as_str)
        .and_then(crate::credentials::parse_expiry)
}

pub(crate) fn str_field<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Compact view of a Graph `chatMessage`.
pub(crate) fn message_view(message: &Value) -> Value {
    let content = str_field(message, "/body/content").unwrap_or_default();
    let text = if str_field(message, "/body/contentType") == Some("html") {
        html_to_plain(content)
    } else {
        content.to_string()
    };
    let from = str_field(message, "/from/user/displayName")
        .or_else(|| str_field(message, "/from/application/displayName"))
        .unwrap_or("Unknown");
    let mentions: Vec<&str> = message
        .get("mentions")
        .and_then(Value::as_array)
        .map(|m| {
            m.iter()
                .filter_map(|e| e.get("mentionText").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    json!({
        "id": message.get("id"),
        "content": truncate_chars(&text, PREVIEW_CHARS),
        "from": from,
        "from_user_id": str_field(message, "/from/user/id"),
        "created_at": message.get("createdDateTime"),
        "last_modified_at": message.get("lastModifiedDateTime"),
        "importance": message.get("importance"),
        "message_type": message.get("messageType"),
        "reply_to_id": message.get("replyToId"),
        "mentions": mentions,
        "web_url": message.get("webUrl"),
    })
}

/// Sorted page of messages with a continuation flag.
pub(crate) fn message_page(resp: &Value) -> (Vec<Value>, bool) {
    let mut items = collection(resp);
    sort_newest_first(&mut items);
    let views = items.iter().map(message_view).collect();
    (views, has_more(resp))
}

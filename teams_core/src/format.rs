//! Message bodies for Graph `chatMessage` posts: markdown rendering and `@mentions`.

use pulldown_cmark::{html, Options, Parser};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    #[default]
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Normal => "normal",
            Importance::High => "high",
            Importance::Urgent => "urgent",
        }
    }
}

/// A person to @mention: every `@name` in the body becomes a Graph mention of `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Mention {
    /// Text following `@` in the message, usually the display name
    pub name: String,
    /// Azure AD object id of the mentioned user
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormattedBody {
    pub content: String,
    pub content_type: &'static str,
    /// Graph `mentions` entities for the mentions that were found in the body.
    pub mentions: Vec<Value>,
}

impl FormattedBody {
    /// `body`/`mentions` portion of a chatMessage payload.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "body": {
                "content": self.content,
                "contentType": self.content_type,
            }
        });
        if !self.mentions.is_empty() {
            payload["mentions"] = Value::Array(self.mentions.clone());
        }
        payload
    }

    pub fn mention_names(&self) -> Vec<String> {
        self.mentions
            .iter()
            .filter_map(|m| m.get("mentionText").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_TASKLISTS);

    let parser = Parser::new_ext(markdown, options);
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out.trim_end().to_string()
}

pub fn build_message_body(content: &str, format: MessageFormat, mentions: &[Mention]) -> FormattedBody {
    let (mut body, mut content_type) = match format {
        MessageFormat::Text => (content.to_string(), "text"),
        MessageFormat::Markdown => (markdown_to_html(content), "html"),
        MessageFormat::Html => (content.to_string(), "html"),
    };

    let mentions: Vec<&Mention> = mentions
        .iter()
        .filter(|m| !m.name.trim().is_empty() && !m.user_id.trim().is_empty())
        .collect();
    if mentions.is_empty() {
        return FormattedBody {
            content: body,
            content_type,
            mentions: Vec::new(),
        };
    }

    // Mentions are only expressible in html bodies.
    if content_type == "text" {
        body = html_escape::encode_text(&body).into_owned();
        content_type = "html";
    }

    let mut entities = Vec::new();
    for (id, mention) in mentions.into_iter().enumerate() {
        let escaped = html_escape::encode_text(&mention.name);
        let needle = [format!("@{}", escaped), format!("@{}", mention.name)]
            .into_iter()
            .find(|n| body.contains(n.as_str()));
        let Some(needle) = needle else {
            continue;
        };

        let tag = format!("<at id=\"{}\">{}</at>", id, escaped);
        body = body.replace(&needle, &tag);
        entities.push(json!({
            "id": id,
            "mentionText": mention.name,
            "mentioned": {
                "user": {
                    "id": mention.user_id,
                    "displayName": mention.name,
                    "userIdentityType": "aadUser",
                }
            }
        }));
    }

    FormattedBody {
        content: body,
        content_type,
        mentions: entities,
    }
}

/// Strips tags from an html body for compact listings.
pub fn html_to_plain(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut in_tag = false;
    for c in content.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    html_escape::decode_html_entities(out.trim()).into_owned()
}

use async_trait::async_trait;
use rmcp::model::{CallToolResult, JsonObject, Tool};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::info;

use super::channels::sent_text;
use super::{
    clamp_limit, collection, has_more, message_page, parse_args, path_segment, require_text,
    str_field, tool, DEFAULT_PAGE, MAX_PAGE,
};
use crate::context::{GraphServices, ServiceRequest, ToolContext};
use crate::credentials::normalize_email;
use crate::error::TeamsError;
use crate::format::{build_message_body, Importance, Mention, MessageFormat};
use crate::graph::GraphClient;
use crate::scopes::ToolGroup;
use crate::utils::structured_result_with_text;
use crate::Connector;

const SERVICE: &str = "chat";
const CHAT_SCOPES: &[&str] = &["teams_chat"];
const MEMBER_TYPE: &str = "#microsoft.graph.aadUserConversationMember";

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListChatsInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    /// Number of chats to return (1-50, default 20)
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessagesInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    /// Chat id (from list_chats)
    pub chat_id: String,
    /// Number of messages to return (1-50, default 20)
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SendChatMessageInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    pub chat_id: String,
    /// Message body
    pub message: String,
    #[serde(default)]
    pub importance: Importance,
    /// Body format: text, markdown or html
    #[serde(default)]
    pub format: MessageFormat,
    /// People to @mention; each `@name` in the message is linked to `user_id`
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ChatType {
    #[serde(rename = "oneOnOne")]
    OneOnOne,
    #[serde(rename = "group")]
    Group,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::OneOnOne => "oneOnOne",
            ChatType::Group => "group",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateChatInput {
    /// Email of the signed-in user to act as; added to the chat as owner
    pub user_email: String,
    /// Emails of the other participants
    pub user_emails: Vec<String>,
    /// oneOnOne or group; inferred from the number of participants when omitted
    #[serde(default)]
    pub chat_type: Option<ChatType>,
    /// Topic for group chats
    #[serde(default)]
    pub topic: Option<String>,
}

/// Participants and type of a chat about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPlan {
    pub chat_type: ChatType,
    pub participants: Vec<String>,
    pub topic: Option<String>,
}

/// Checks the participant list against the requested chat type. The caller is never
/// counted as a participant since Graph adds them as owner.
pub fn plan_chat(input: &CreateChatInput) -> Result<ChatPlan, TeamsError> {
    let me = normalize_email(&input.user_email);
    let mut seen = BTreeSet::new();
    let participants: Vec<String> = input
        .user_emails
        .iter()
        .map(|e| normalize_email(e))
        .filter(|e| !e.is_empty() && *e != me)
        .filter(|e| seen.insert(e.clone()))
        .collect();

    if participants.is_empty() {
        return Err(TeamsError::InvalidInput(
            "user_emails must name at least one other participant".into(),
        ));
    }
    let chat_type = input.chat_type.unwrap_or(if participants.len() == 1 {
        ChatType::OneOnOne
    } else {
        ChatType::Group
    });
    match chat_type {
        ChatType::OneOnOne if participants.len() != 1 => {
            return Err(TeamsError::InvalidInput(format!(
                "a oneOnOne chat needs exactly one other participant, got {}",
                participants.len()
            )))
        }
        ChatType::Group if participants.len() < 2 => {
            return Err(TeamsError::InvalidInput(
                "a group chat needs at least two other participants".into(),
            ))
        }
        _ => {}
    }

    let topic = match chat_type {
        ChatType::Group => input
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        ChatType::OneOnOne => None,
    };
    Ok(ChatPlan {
        chat_type,
        participants,
        topic,
    })
}

fn member(client: &GraphClient, user_id: &str, role: &str) -> Value {
    json!({
        "@odata.type": MEMBER_TYPE,
        "roles": [role],
        "user@odata.bind": format!("{}/users('{}')", client.base_url(), user_id),
    })
}

async fn user_id(client: &GraphClient, email: &str) -> Result<String, TeamsError> {
    let endpoint = format!("/users/{}", path_segment("user_emails", email)?);
    let user = client
        .get_with_query(&endpoint, &[("$select", "id".to_string())])
        .await
        .map_err(|e| match e {
            TeamsError::Graph { status: 404, .. } => {
                TeamsError::InvalidInput(format!("could not find user {}", email))
            }
            other => other,
        })?;
    str_field(&user, "/id")
        .map(str::to_string)
        .ok_or_else(|| TeamsError::InvalidInput(format!("could not find user {}", email)))
}

/// One-on-one and group chats.
#[derive(Debug, Clone, Default)]
pub struct ChatsConnector;

impl ChatsConnector {
    pub fn new() -> Self {
        Self
    }

    async fn list_chats(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: ListChatsInput,
    ) -> Result<CallToolResult, TeamsError> {
        let top = clamp_limit(input.limit, DEFAULT_PAGE, MAX_PAGE);
        let request = ServiceRequest {
            tool: "list_chats",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: CHAT_SCOPES,
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client
                    .get_with_query(
                        "/me/chats",
                        &[("$expand", "members".to_string()), ("$top", top.to_string())],
                    )
                    .await
            })
            .await?;

        let chats: Vec<Value> = collection(&resp)
            .iter()
            .map(|c| {
                let members: Vec<&str> = c
                    .get("members")
                    .and_then(Value::as_array)
                    .map(|m| {
                        m.iter()
                            .filter_map(|m| m.get("displayName").and_then(Value::as_str))
                            .collect()
                    })
                    .unwrap_or_default();
                json!({
                    "id": c.get("id"),
                    "topic": c.get("topic"),
                    "chat_type": c.get("chatType"),
                    "created_at": c.get("createdDateTime"),
                    "last_updated_at": c.get("lastUpdatedDateTime"),
                    "members": members,
                    "web_url": c.get("webUrl"),
                })
            })
            .collect();
        structured_result_with_text(
            &json!({ "count": chats.len(), "has_more": has_more(&resp), "chats": chats }),
            None,
        )
    }

    async fn get_chat_messages(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: ChatMessagesInput,
    ) -> Result<CallToolResult, TeamsError> {
        let endpoint = format!("/chats/{}/messages", path_segment("chat_id", &input.chat_id)?);
        let top = clamp_limit(input.limit, DEFAULT_PAGE, MAX_PAGE);
        let request = ServiceRequest {
            tool: "get_chat_messages",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: CHAT_SCOPES,
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client
                    .get_with_query(&endpoint, &[("$top", top.to_string())])
                    .await
            })
            .await?;

        let (messages, has_more) = message_page(&resp);
        structured_result_with_text(
            &json!({
                "chat_id": input.chat_id,
                "count": messages.len(),
                "has_more": has_more,
                "messages": messages,
            }),
            None,
        )
    }

    async fn send_chat_message(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: SendChatMessageInput,
    ) -> Result<CallToolResult, TeamsError> {
        require_text("message", &input.message)?;
        let endpoint = format!("/chats/{}/messages", path_segment("chat_id", &input.chat_id)?);
        let body = build_message_body(&input.message, input.format, &input.mentions);
        let mut payload = body.to_payload();
        payload["importance"] = json!(input.importance.as_str());

        let request = ServiceRequest {
            tool: "send_chat_message",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: CHAT_SCOPES,
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client.post(&endpoint, &payload).await
            })
            .await?;

        let message_id = str_field(&resp, "/id").ok_or_else(|| {
            TeamsError::InternalError("Graph returned no id for the sent message".into())
        })?;
        info!(chat_id = %input.chat_id, message_id, "Chat message sent");
        let mentions = body.mention_names();
        structured_result_with_text(
            &json!({
                "message_id": message_id,
                "chat_id": input.chat_id,
                "created_at": resp.get("createdDateTime"),
                "mentions": mentions,
            }),
            Some(sent_text(message_id, &mentions)),
        )
    }

    async fn create_chat(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: CreateChatInput,
    ) -> Result<CallToolResult, TeamsError> {
        let plan = plan_chat(&input)?;
        let request = ServiceRequest {
            tool: "create_chat",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["teams_chat", "user_read"],
        };
        let created = services
            .with_client(ctx, request, |auth| {
                let plan = plan.clone();
                async move {
                    let client = &auth.client;
                    let me = client
                        .get_with_query("/me", &[("$select", "id".to_string())])
                        .await?;
                    let my_id = str_field(&me, "/id").ok_or_else(|| {
                        TeamsError::InternalError("could not determine the current user id".into())
                    })?;

                    let mut members = vec![member(client, my_id, "owner")];
                    for email in &plan.participants {
                        let id = user_id(client, email).await?;
                        members.push(member(client, &id, "owner"));
                    }

                    let mut payload = json!({
                        "chatType": plan.chat_type.as_str(),
                        "members": members,
                    });
                    if let Some(topic) = &plan.topic {
                        payload["topic"] = json!(topic);
                    }
                    client.post("/chats", &payload).await
                }
            })
            .await?;

        let chat_id = str_field(&created, "/id").ok_or_else(|| {
            TeamsError::InternalError("Graph returned no id for the new chat".into())
        })?;
        info!(chat_id, chat_type = plan.chat_type.as_str(), "Chat created");
        structured_result_with_text(
            &json!({
                "chat_id": chat_id,
                "chat_type": plan.chat_type.as_str(),
                "topic": plan.topic,
                "participants": plan.participants,
                "web_url": created.get("webUrl"),
            }),
            Some(format!("Chat created. Chat ID: {}", chat_id)),
        )
    }
}

#[async_trait]
impl Connector for ChatsConnector {
    fn name(&self) -> &'static str {
        "chats"
    }

    fn description(&self) -> &'static str {
        "One-on-one and group chats: list, read, send and create."
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Chats
    }

    fn list_tools(&self) -> Result<Vec<Tool>, TeamsError> {
        Ok(vec![
            tool::<ListChatsInput>(
                "list_chats",
                "List the user's chats with their members.",
            )?,
            tool::<ChatMessagesInput>(
                "get_chat_messages",
                "Get recent messages from a chat, newest first. has_more is true when older messages exist.",
            )?,
            tool::<SendChatMessageInput>(
                "send_chat_message",
                "Send a message to a chat. Supports text, markdown or html bodies, @mentions and importance.",
            )?,
            tool::<CreateChatInput>(
                "create_chat",
                "Create a oneOnOne chat with exactly one other user or a group chat with two or more. The signed-in user is added automatically.",
            )?,
        ])
    }

    async fn call_tool(
        &self,
        name: &str,
        args: JsonObject,
        services: &GraphServices,
        ctx: &ToolContext,
    ) -> Result<CallToolResult, TeamsError> {
        match name {
            "list_chats" => self.list_chats(services, ctx, parse_args(args)?).await,
            "get_chat_messages" => self.get_chat_messages(services, ctx, parse_args(args)?).await,
            "send_chat_message" => self.send_chat_message(services, ctx, parse_args(args)?).await,
            "create_chat" => self.create_chat(services, ctx, parse_args(args)?).await,
            _ => Err(TeamsError::ToolNotFound),
        }
    }
}

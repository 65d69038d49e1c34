use async_trait::async_trait;
use rmcp::model::{CallToolResult, JsonObject, Tool};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{
    clamp_limit, collection, message_page, parse_args, path_segment, require_text, str_field,
    tool, DEFAULT_PAGE, MAX_PAGE,
};
use crate::context::{GraphServices, ServiceRequest, ToolContext};
use crate::error::TeamsError;
use crate::format::{build_message_body, Importance, Mention, MessageFormat};
use crate::scopes::ToolGroup;
use crate::utils::structured_result_with_text;
use crate::Connector;

const SERVICE: &str = "teams";

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListTeamsInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TeamInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    /// Team id (from list_teams)
    pub team_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ChannelMessagesInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    pub team_id: String,
    /// Channel id (from list_channels)
    pub channel_id: String,
    /// Number of messages to return (1-50, default 20)
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SendChannelMessageInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    pub team_id: String,
    pub channel_id: String,
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

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MessageRepliesInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    pub team_id: String,
    pub channel_id: String,
    /// Id of the root message
    pub message_id: String,
    /// Number of replies to return (1-50, default 20)
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ReplyInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    pub team_id: String,
    pub channel_id: String,
    /// Id of the message being replied to
    pub message_id: String,
    pub message: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

/// Teams, channels, channel messages and team membership.
#[derive(Debug, Clone, Default)]
pub struct ChannelsConnector;

impl ChannelsConnector {
    pub fn new() -> Self {
        Self
    }

    async fn list_teams(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: ListTeamsInput,
    ) -> Result<CallToolResult, TeamsError> {
        let request = ServiceRequest {
            tool: "list_teams",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["teams_read"],
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client.get("/me/joinedTeams").await
            })
            .await?;

        let teams: Vec<Value> = collection(&resp)
            .iter()
            .map(|t| {
                json!({
                    "id": t.get("id"),
                    "display_name": t.get("displayName"),
                    "description": t.get("description"),
                    "visibility": t.get("visibility"),
                    "is_archived": t.get("isArchived"),
                })
            })
            .collect();
        structured_result_with_text(&json!({ "count": teams.len(), "teams": teams }), None)
    }

    async fn list_channels(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: TeamInput,
    ) -> Result<CallToolResult, TeamsError> {
        let team = path_segment("team_id", &input.team_id)?;
        let request = ServiceRequest {
            tool: "list_channels",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["teams_read", "teams_channels"],
        };
        let endpoint = format!("/teams/{}/channels", team);
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client.get(&endpoint).await
            })
            .await?;

        let channels: Vec<Value> = collection(&resp)
            .iter()
            .map(|c| {
                json!({
                    "id": c.get("id"),
                    "display_name": c.get("displayName"),
                    "description": c.get("description"),
                    "membership_type": c.get("membershipType"),
                    "web_url": c.get("webUrl"),
                })
            })
            .collect();
        structured_result_with_text(
            &json!({ "team_id": input.team_id, "count": channels.len(), "channels": channels }),
            None,
        )
    }

    async fn get_channel_messages(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: ChannelMessagesInput,
    ) -> Result<CallToolResult, TeamsError> {
        let endpoint = format!(
            "/teams/{}/channels/{}/messages",
            path_segment("team_id", &input.team_id)?,
            path_segment("channel_id", &input.channel_id)?
        );
        let top = clamp_limit(input.limit, DEFAULT_PAGE, MAX_PAGE);
        let request = ServiceRequest {
            tool: "get_channel_messages",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["teams_messages"],
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
                "team_id": input.team_id,
                "channel_id": input.channel_id,
                "count": messages.len(),
                "has_more": has_more,
                "messages": messages,
            }),
            None,
        )
    }

    async fn send_channel_message(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: SendChannelMessageInput,
    ) -> Result<CallToolResult, TeamsError> {
        require_text("message", &input.message)?;
        let endpoint = format!(
            "/teams/{}/channels/{}/messages",
            path_segment("team_id", &input.team_id)?,
            path_segment("channel_id", &input.channel_id)?
        );
        let body = build_message_body(&input.message, input.format, &input.mentions);
        let mut payload = body.to_payload();
        payload["importance"] = json!(input.importance.as_str());

        let request = ServiceRequest {
            tool: "send_channel_message",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["teams_messages"],
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client.post(&endpoint, &payload).await
            })
            .await?;

        let message_id = str_field(&resp, "/id").ok_or_else(|| {
            TeamsError::InternalError("Graph returned no id for the sent message".into())
        })?;
        info!(team_id = %input.team_id, channel_id = %input.channel_id, message_id, "Channel message sent");
        let mentions = body.mention_names();
        structured_result_with_text(
            &json!({
                "message_id": message_id,
                "created_at": resp.get("createdDateTime"),
                "content_type": body.content_type,
                "mentions": mentions,
            }),
            Some(sent_text(message_id, &mentions)),
        )
    }

    async fn get_channel_message_replies(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: MessageRepliesInput,
    ) -> Result<CallToolResult, TeamsError> {
        let endpoint = format!(
            "/teams/{}/channels/{}/messages/{}/replies",
            path_segment("team_id", &input.team_id)?,
            path_segment("channel_id", &input.channel_id)?,
            path_segment("message_id", &input.message_id)?
        );
        let top = clamp_limit(input.limit, DEFAULT_PAGE, MAX_PAGE);
        let request = ServiceRequest {
            tool: "get_channel_message_replies",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["teams_messages"],
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client
                    .get_with_query(&endpoint, &[("$top", top.to_string())])
                    .await
            })
            .await?;

        let (replies, has_more) = message_page(&resp);
        structured_result_with_text(
            &json!({
                "message_id": input.message_id,
                "count": replies.len(),
                "has_more": has_more,
                "replies": replies,
            }),
            None,
        )
    }

    async fn reply_to_channel_message(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: ReplyInput,
    ) -> Result<CallToolResult, TeamsError> {
        require_text("message", &input.message)?;
        let endpoint = format!(
            "/teams/{}/channels/{}/messages/{}/replies",
            path_segment("team_id", &input.team_id)?,
            path_segment("channel_id", &input.channel_id)?,
            path_segment("message_id", &input.message_id)?
        );
        let body = build_message_body(&input.message, input.format, &input.mentions);
        let mut payload = body.to_payload();
        payload["importance"] = json!(input.importance.as_str());

        let request = ServiceRequest {
            tool: "reply_to_channel_message",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["teams_messages"],
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client.post(&endpoint, &payload).await
            })
            .await?;

        let reply_id = str_field(&resp, "/id").ok_or_else(|| {
            TeamsError::InternalError("Graph returned no id for the reply".into())
        })?;
        info!(message_id = %input.message_id, reply_id, "Channel reply sent");
        let mentions = body.mention_names();
        structured_result_with_text(
            &json!({
                "reply_id": reply_id,
                "message_id": input.message_id,
                "created_at": resp.get("createdDateTime"),
                "mentions": mentions,
            }),
            Some(sent_text(reply_id, &mentions)),
        )
    }

    async fn list_team_members(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: TeamInput,
    ) -> Result<CallToolResult, TeamsError> {
        let endpoint = format!("/teams/{}/members", path_segment("team_id", &input.team_id)?);
        let request = ServiceRequest {
            tool: "list_team_members",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["teams_members"],
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client.get(&endpoint).await
            })
            .await?;

        let members: Vec<Value> = collection(&resp)
            .iter()
            .map(|m| {
                json!({
                    "id": m.get("id"),
                    "user_id": m.get("userId"),
                    "display_name": m.get("displayName"),
                    "email": m.get("email"),
                    "roles": m.get("roles").cloned().unwrap_or_else(|| json!([])),
                })
            })
            .collect();
        structured_result_with_text(
            &json!({ "team_id": input.team_id, "count": members.len(), "members": members }),
            None,
        )
    }
}

pub(crate) fn sent_text(id: &str, mentions: &[String]) -> String {
    if mentions.is_empty() {
        format!("Message sent. Message ID: {}", id)
    } else {
        format!("Message sent. Message ID: {}. Mentions: {}", id, mentions.join(", "))
    }
}

#[async_trait]
impl Connector for ChannelsConnector {
    fn name(&self) -> &'static str {
        "teams"
    }

    fn description(&self) -> &'static str {
        "Teams, channels, channel messages and replies, and team membership."
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Teams
    }

    fn list_tools(&self) -> Result<Vec<Tool>, TeamsError> {
        Ok(vec![
            tool::<ListTeamsInput>(
                "list_teams",
                "List the Microsoft Teams the user has joined.",
            )?,
            tool::<TeamInput>("list_channels", "List the channels of a team.")?,
            tool::<ChannelMessagesInput>(
                "get_channel_messages",
                "Get recent messages from a channel, newest first. has_more is true when older messages exist.",
            )?,
            tool::<SendChannelMessageInput>(
                "send_channel_message",
                "Post a message to a channel. Supports text, markdown or html bodies, @mentions and importance.",
            )?,
            tool::<MessageRepliesInput>(
                "get_channel_message_replies",
                "Get the replies to a channel message, newest first.",
            )?,
            tool::<ReplyInput>(
                "reply_to_channel_message",
                "Reply to a channel message. Supports the same formatting and @mentions as send_channel_message.",
            )?,
            tool::<TeamInput>(
                "list_team_members",
                "List the members of a team with their roles.",
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
            "list_teams" => self.list_teams(services, ctx, parse_args(args)?).await,
            "list_channels" => self.list_channels(services, ctx, parse_args(args)?).await,
            "get_channel_messages" => {
                self.get_channel_messages(services, ctx, parse_args(args)?)
                    .await
            }
            "send_channel_message" => {
                self.send_channel_message(services, ctx, parse_args(args)?)
                    .await
            }
            "get_channel_message_replies" => {
                self.get_channel_message_replies(services, ctx, parse_args(args)?)
                    .await
            }
            "reply_to_channel_message" => {
                self.reply_to_channel_message(services, ctx, parse_args(args)?)
                    .await
            }
            "list_team_members" => self.list_team_members(services, ctx, parse_args(args)?).await,
            _ => Err(TeamsError::ToolNotFound),
        }
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rmcp::model::{CallToolResult, JsonObject, Tool};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{clamp_limit, parse_args, str_field, tool, DEFAULT_PAGE, MAX_PAGE};
use crate::context::{GraphServices, ServiceRequest, ToolContext};
use crate::error::TeamsError;
use crate::format::html_to_plain;
use crate::scopes::ToolGroup;
use crate::utils::{structured_result_with_text, truncate_chars};
use crate::Connector;

const SERVICE: &str = "search";
const SEARCH_SCOPES: &[&str] = &["search"];
const DEFAULT_SEARCH_SIZE: u32 = 25;
const MAX_SEARCH_SIZE: u32 = 100;
const DEFAULT_MENTION_HOURS: u32 = 24;
const MAX_MENTION_HOURS: u32 = 168;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    #[default]
    All,
    Channels,
    Chats,
}

impl SearchScope {
    /// KQL narrowing appended to the user's query.
    fn kql(&self) -> Option<&'static str> {
        match self {
            SearchScope::All => None,
            SearchScope::Channels => Some("(channelIdentity/channelId:*)"),
            SearchScope::Chats => Some("(chatId:* AND NOT channelIdentity/channelId:*)"),
        }
    }

    fn admits(&self, hit: &SearchHit) -> bool {
        match self {
            SearchScope::All => true,
            SearchScope::Channels => hit.kind == "channel",
            SearchScope::Chats => hit.kind == "chat",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchMessagesInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    /// Search text; KQL such as `from:ada hasAttachment:true` is supported
    pub query: String,
    /// all, channels or chats
    #[serde(default)]
    pub scope: SearchScope,
    /// Number of results (1-100, default 25)
    #[serde(default)]
    pub limit: Option<i64>,
    /// Rank by relevance instead of date
    #[serde(default = "default_top_results")]
    pub enable_top_results: bool,
}

fn default_top_results() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MentionsInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    /// Look back this many hours (1-168, default 24)
    #[serde(default)]
    pub hours: Option<i64>,
    /// Number of mentions to return (1-50, default 20)
    #[serde(default)]
    pub limit: Option<i64>,
    /// all, channels or chats
    #[serde(default)]
    pub scope: SearchScope,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: Option<String>,
    pub summary: Option<String>,
    pub content: String,
    pub from: String,
    pub from_user_id: Option<String>,
    pub created_at: Option<String>,
    pub chat_id: Option<String>,
    pub team_id: Option<String>,
    pub channel_id: Option<String>,
    /// `channel` or `chat`
    pub kind: &'static str,
    pub web_url: Option<String>,
}

/// Search request body for chat messages.
pub fn search_request(query_string: &str, size: u32, enable_top_results: bool) -> Value {
    json!({
        "requests": [{
            "entityTypes": ["chatMessage"],
            "query": { "queryString": query_string },
            "from": 0,
            "size": size,
            "enableTopResults": enable_top_results,
        }]
    })
}

fn scoped_query(query: &str, scope: SearchScope) -> String {
    match scope.kql() {
        Some(kql) => format!("{} AND {}", query.trim(), kql),
        None => query.trim().to_string(),
    }
}

fn owned(value: &Value, pointer: &str) -> Option<String> {
    str_field(value, pointer).map(str::to_string)
}

/// Flattens the hits of a `/search/query` response. Returns `(hits, total, more_available)`.
pub fn parse_hits(resp: &Value) -> (Vec<SearchHit>, u64, bool) {
    let Some(container) = resp.pointer("/value/0/hitsContainers/0") else {
        return (Vec::new(), 0, false);
    };
    let hits: Vec<SearchHit> = container
        .get("hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .map(|hit| {
                    let resource = hit.get("resource").unwrap_or(&Value::Null);
                    let channel_id = owned(resource, "/channelIdentity/channelId");
                    let kind = if channel_id.is_some() { "channel" } else { "chat" };
                    let content = str_field(resource, "/body/content").unwrap_or_default();
                    SearchHit {
                        id: owned(resource, "/id").or_else(|| owned(hit, "/hitId")),
                        summary: owned(hit, "/summary"),
                        content: truncate_chars(&html_to_plain(content), 2000),
                        from: owned(resource, "/from/user/displayName")
                            .or_else(|| owned(resource, "/from/emailAddress/name"))
                            .unwrap_or_else(|| "Unknown".to_string()),
                        from_user_id: owned(resource, "/from/user/id"),
                        created_at: owned(resource, "/createdDateTime"),
                        chat_id: owned(resource, "/chatId"),
                        team_id: owned(resource, "/channelIdentity/teamId"),
                        channel_id,
                        kind,
                        web_url: owned(resource, "/webUrl"),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    let total = container
        .get("total")
        .and_then(Value::as_u64)
        .unwrap_or(hits.len() as u64);
    let more = container
        .get("moreResultsAvailable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    (hits, total, more)
}

/// KQL for messages mentioning `user_id` since `since` (date precision).
pub fn mentions_query(user_id: &str, since: DateTime<Utc>) -> String {
    format!("mentions:{} AND sent>={}", user_id, since.format("%Y-%m-%d"))
}

/// Message search across channels and chats.
#[derive(Debug, Clone, Default)]
pub struct SearchConnector;

impl SearchConnector {
    pub fn new() -> Self {
        Self
    }

    async fn search_messages(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: SearchMessagesInput,
    ) -> Result<CallToolResult, TeamsError> {
        if input.query.trim().is_empty() {
            return Err(TeamsError::InvalidInput("query must not be empty".into()));
        }
        let size = clamp_limit(input.limit, DEFAULT_SEARCH_SIZE, MAX_SEARCH_SIZE);
        let body = search_request(
            &scoped_query(&input.query, input.scope),
            size,
            input.enable_top_results,
        );
        let request = ServiceRequest {
            tool: "search_messages",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: SEARCH_SCOPES,
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client.post("/search/query", &body).await
            })
            .await?;

        let (hits, total, more) = parse_hits(&resp);
        structured_result_with_text(
            &json!({
                "query": input.query,
                "scope": input.scope,
                "total": total,
                "count": hits.len(),
                "has_more": more,
                "results": hits,
            }),
            None,
        )
    }

    async fn get_my_mentions(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: MentionsInput,
    ) -> Result<CallToolResult, TeamsError> {
        let hours = clamp_limit(input.hours, DEFAULT_MENTION_HOURS, MAX_MENTION_HOURS);
        let size = clamp_limit(input.limit, DEFAULT_PAGE, MAX_PAGE);
        let since = Utc::now() - Duration::hours(i64::from(hours));
        let request = ServiceRequest {
            tool: "get_my_mentions",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["search", "user_read"],
        };
        let (me, resp) = services
            .with_client(ctx, request, |auth| async move {
                let me = auth
                    .client
                    .get_with_query("/me", &[("$select", "id,displayName".to_string())])
                    .await?;
                let user_id = str_field(&me, "/id").ok_or_else(|| {
                    TeamsError::InternalError("could not determine the current user id".into())
                })?;
                let body = search_request(&mentions_query(user_id, since), size, false);
                let resp = auth.client.post("/search/query", &body).await?;
                Ok::<_, TeamsError>((me, resp))
            })
            .await?;

        let (hits, _, more) = parse_hits(&resp);
        let mentions: Vec<SearchHit> = hits
            .into_iter()
            .filter(|h| input.scope.admits(h))
            .collect();
        structured_result_with_text(
            &json!({
                "time_range_hours": hours,
                "mentioned_user": str_field(&me, "/displayName").unwrap_or("Current user"),
                "scope": input.scope,
                "count": mentions.len(),
                "has_more": more,
                "mentions": mentions,
            }),
            None,
        )
    }
}

#[async_trait]
impl Connector for SearchConnector {
    fn name(&self) -> &'static str {
        "search"
    }

    fn description(&self) -> &'static str {
        "Microsoft Search over Teams channel and chat messages."
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Search
    }

    fn list_tools(&self) -> Result<Vec<Tool>, TeamsError> {
        Ok(vec![
            tool::<SearchMessagesInput>(
                "search_messages",
                "Search Teams channel and chat messages. Supports KQL such as from:, mentions: and hasAttachment:.",
            )?,
            tool::<MentionsInput>(
                "get_my_mentions",
                "Find recent messages in which the signed-in user was @mentioned.",
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
            "search_messages" => self.search_messages(services, ctx, parse_args(args)?).await,
            "get_my_mentions" => self.get_my_mentions(services, ctx, parse_args(args)?).await,
            _ => Err(TeamsError::ToolNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scoped_query() {
        assert_eq!(scoped_query(" budget ", SearchScope::All), "budget");
        assert_eq!(
            scoped_query("budget", SearchScope::Channels),
            "budget AND (channelIdentity/channelId:*)"
        );
    }

    #[test]
    fn test_parse_hits() {
        let resp = json!({
            "value": [{
                "hitsContainers": [{
                    "total": 7,
                    "moreResultsAvailable": true,
                    "hits": [
                        {
                            "hitId": "h1",
                            "summary": "the <c0>budget</c0>",
                            "resource": {
                                "id": "m1",
                                "body": {"content": "<p>budget is final</p>"},
                                "from": {"user": {"id": "u1", "displayName": "Ada"}},
                                "createdDateTime": "2024-03-01T10:00:00Z",
                                "channelIdentity": {"teamId": "t1", "channelId": "c1"}
                            }
                        },
                        {"hitId": "h2", "resource": {"chatId": "19:x", "from": {}}}
                    ]
                }]
            }]
        });
        let (hits, total, more) = parse_hits(&resp);
        assert_eq!(total, 7);
        assert!(more);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].kind, "channel");
        assert_eq!(hits[0].content, "budget is final");
        assert_eq!(hits[1].kind, "chat");
        assert_eq!(hits[1].id.as_deref(), Some("h2"));
        assert_eq!(hits[1].from, "Unknown");
        assert!(SearchScope::Chats.admits(&hits[1]));
        assert!(!SearchScope::Chats.admits(&hits[0]));
    }

    #[test]
    fn test_parse_hits_empty_response() {
        let (hits, total, more) = parse_hits(&json!({"value": []}));
        assert!(hits.is_empty());
        assert_eq!(total, 0);
        assert!(!more);
    }

    #[test]
    fn test_mentions_query() {
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 15, 30, 0).unwrap();
        assert_eq!(mentions_query("u1", since), "mentions:u1 AND sent>=2024-03-01");
    }
}

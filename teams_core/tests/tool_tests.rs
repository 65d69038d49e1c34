mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use teams_core::mcp_server::McpServer;
use teams_core::session_store::NewSession;
use teams_core::{AppContext, CallToolRequestParam, CallToolResult, ToolContext};

use common::{app, configured, valid_record, FakeProvider};

struct Harness {
    server: MockServer,
    mcp: McpServer,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let mut config = configured(dir.path());
        config.graph.endpoint = format!("{}/v1.0", server.uri());
        let ctx: AppContext = app(config, Arc::new(FakeProvider::default()));
        ctx.sessions
            .store_session(
                NewSession::new("alice@example.com", valid_record("alice-token"))
                    .with_mcp_session_id("mcp-1"),
            )
            .unwrap();
        let mcp = McpServer::new(Arc::new(ctx)).unwrap();
        Self {
            server,
            mcp,
            _dir: dir,
        }
    }

    async fn call(&self, session: &str, name: &str, arguments: Value) -> CallToolResult {
        let request: CallToolRequestParam =
            serde_json::from_value(json!({ "name": name, "arguments": arguments })).unwrap();
        self.mcp
            .handle_call_tool(request, &ToolContext::for_session(session))
            .await
            .unwrap()
    }
}

fn structured(result: &CallToolResult) -> Value {
    result.structured_content.clone().unwrap_or(Value::Null)
}

#[tokio::test]
async fn test_list_chats_uses_bound_credential() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/chats"))
        .and(header("authorization", "Bearer alice-token"))
        .and(query_param("$expand", "members"))
        .and(query_param("$top", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "id": "chat-1",
                    "topic": null,
                    "chatType": "oneOnOne",
                    "members": [{"displayName": "Alice"}, {"displayName": "Bob"}]
                },
                {
                    "id": "chat-2",
                    "topic": "Launch",
                    "chatType": "group",
                    "members": []
                }
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/chats?$skiptoken=x"
        })))
        .expect(2)
        .mount(&h.server)
        .await;

    let args = json!({ "user_email": "alice@example.com" });
    let first = h.call("mcp-1", "list_chats", args.clone()).await;
    assert_eq!(first.is_error, Some(false));
    let data = structured(&first);
    assert_eq!(data["count"], json!(2));
    assert_eq!(data["has_more"], json!(true));
    assert_eq!(data["chats"][0]["members"], json!(["Alice", "Bob"]));
    assert_eq!(data["chats"][1]["topic"], json!("Launch"));

    // Served from the cached client the second time; Graph is still called.
    let second = h.call("mcp-1", "list_chats", args).await;
    assert_eq!(second.is_error, Some(false));
}

#[tokio::test]
async fn test_foreign_session_gets_error_result_without_graph_call() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(0)
        .mount(&h.server)
        .await;

    let result = h
        .call("mcp-2", "list_chats", json!({ "user_email": "alice@example.com" }))
        .await;
    assert_eq!(result.is_error, Some(true));
    assert_eq!(structured(&result)["error"], json!("auth_failed"));
}

#[tokio::test]
async fn test_send_chat_message_renders_markdown_and_mentions() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/v1.0/chats/chat-1/messages"))
        .and(body_partial_json(json!({
            "body": { "contentType": "html" },
            "importance": "high"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "msg-1",
            "createdDateTime": "2026-01-05T10:00:00Z"
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h
        .call(
            "mcp-1",
            "send_chat_message",
            json!({
                "user_email": "alice@example.com",
                "chat_id": "chat-1",
                "message": "Ping @Bob about **launch**",
                "format": "markdown",
                "importance": "high",
                "mentions": [{ "name": "Bob", "user_id": "bob-id" }]
            }),
        )
        .await;
    assert_eq!(result.is_error, Some(false));
    let data = structured(&result);
    assert_eq!(data["message_id"], json!("msg-1"));
    assert_eq!(data["mentions"], json!(["Bob"]));

    let requests = h.server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let content = sent["body"]["content"].as_str().unwrap();
    assert!(content.contains("<at id=\"0\">Bob</at>"));
    assert_eq!(sent["mentions"][0]["mentioned"]["user"]["id"], json!("bob-id"));
}

#[tokio::test]
async fn test_empty_message_is_rejected_before_graph() {
    let h = Harness::new().await;
    let result = h
        .call(
            "mcp-1",
            "send_chat_message",
            json!({ "user_email": "alice@example.com", "chat_id": "chat-1", "message": "   " }),
        )
        .await;
    assert_eq!(result.is_error, Some(true));
    assert_eq!(structured(&result)["error"], json!("invalid_input"));
    assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_group_chat_binds_members() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "alice-id" })))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1\.0/users/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "other-id" })))
        .expect(2)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1.0/chats"))
        .and(body_partial_json(json!({ "chatType": "group", "topic": "Launch" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "19:new@thread.v2",
            "webUrl": "https://teams.microsoft.com/l/chat/19:new"
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h
        .call(
            "mcp-1",
            "create_chat",
            json!({
                "user_email": "alice@example.com",
                "user_emails": ["Bob@example.com", "carol@example.com", "alice@example.com"],
                "topic": " Launch "
            }),
        )
        .await;
    assert_eq!(result.is_error, Some(false));
    let data = structured(&result);
    assert_eq!(data["chat_id"], json!("19:new@thread.v2"));
    assert_eq!(data["chat_type"], json!("group"));
    assert_eq!(
        data["participants"],
        json!(["bob@example.com", "carol@example.com"])
    );

    let requests = h.server.received_requests().await.unwrap();
    let post = requests
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .unwrap();
    let body: Value = serde_json::from_slice(&post.body).unwrap();
    let members = body["members"].as_array().unwrap();
    assert_eq!(members.len(), 3);
    assert_eq!(
        members[0]["user@odata.bind"],
        json!(format!("{}/v1.0/users('alice-id')", h.server.uri()))
    );
}

#[tokio::test]
async fn test_create_chat_with_unknown_user_is_tool_error() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "alice-id" })))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1\.0/users/"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "Request_ResourceNotFound", "message": "not found" }
        })))
        .mount(&h.server)
        .await;

    let result = h
        .call(
            "mcp-1",
            "create_chat",
            json!({ "user_email": "alice@example.com", "user_emails": ["ghost@example.com"] }),
        )
        .await;
    assert_eq!(result.is_error, Some(true));
    assert_eq!(structured(&result)["error"], json!("invalid_input"));
}

#[tokio::test]
async fn test_search_messages_reports_hits() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/v1.0/search/query"))
        .and(body_partial_json(json!({
            "requests": [{ "entityTypes": ["chatMessage"], "size": 5 }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "hitsContainers": [{
                    "total": 7,
                    "moreResultsAvailable": true,
                    "hits": [{
                        "hitId": "hit-1",
                        "summary": "the <c0>launch</c0> plan",
                        "resource": {
                            "id": "m-1",
                            "body": { "content": "<p>The launch plan</p>" },
                            "from": { "emailAddress": { "name": "Bob" } },
                            "channelIdentity": { "teamId": "t-1", "channelId": "c-1" }
                        }
                    }]
                }]
            }]
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h
        .call(
            "mcp-1",
            "search_messages",
            json!({ "user_email": "alice@example.com", "query": "launch", "limit": 5 }),
        )
        .await;
    assert_eq!(result.is_error, Some(false));
    let data = structured(&result);
    assert_eq!(data["total"], json!(7));
    assert_eq!(data["has_more"], json!(true));
    assert_eq!(data["results"][0]["kind"], json!("channel"));
    assert_eq!(data["results"][0]["from"], json!("Bob"));
    assert_eq!(data["results"][0]["content"], json!("The launch plan"));
}

#[tokio::test]
async fn test_graph_throttling_is_retryable_tool_error() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "code": "TooManyRequests", "message": "slow down" }
        })))
        .mount(&h.server)
        .await;

    let result = h
        .call("mcp-1", "get_current_user", json!({ "user_email": "alice@example.com" }))
        .await;
    assert_eq!(result.is_error, Some(true));
    let data = structured(&result);
    assert_eq!(data["error"], json!("upstream_error"));
    assert_eq!(data["retryable"], json!(true));
}

#[tokio::test]
async fn test_auth_tools_report_session_state() {
    let h = Harness::new().await;

    let status = h
        .call("mcp-1", "get_teams_auth_status", json!({ "user_email": "alice@example.com" }))
        .await;
    assert_eq!(structured(&status)["status"]["state"], json!("authenticated"));

    let other = h
        .call("mcp-2", "get_teams_auth_status", json!({ "user_email": "alice@example.com" }))
        .await;
    assert_eq!(structured(&other)["status"]["state"], json!("unauthenticated"));

    let started = h
        .call("mcp-2", "start_teams_auth", json!({ "user_email": "bob@example.com" }))
        .await;
    let data = structured(&started);
    assert!(data["auth_url"]
        .as_str()
        .unwrap()
        .contains("/oauth2/v2.0/authorize?"));
    assert_eq!(
        data["redirect_uri"],
        json!("http://localhost:8000/oauth2callback")
    );

    let denied = h
        .call("mcp-2", "teams_logout", json!({ "user_email": "alice@example.com" }))
        .await;
    assert_eq!(denied.is_error, Some(true));

    let signed_out = h
        .call("mcp-1", "teams_logout", json!({ "user_email": "alice@example.com" }))
        .await;
    assert_eq!(structured(&signed_out)["signed_out"], json!(true));
}

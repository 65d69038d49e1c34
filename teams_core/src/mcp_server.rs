use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth_flow::AuthStatus;
use crate::connectors::teams::{parse_args, tool};
use crate::context::{AppContext, ToolContext};
use crate::error::TeamsError;
use crate::scopes;
use crate::utils::{error_result, structured_result_with_text};
use crate::{build_registry, ConnectorRegistry};
use rmcp::model::*;

const SERVER_NAME: &str = "microsoft-teams-mcp";

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UserEmailInput {
    /// Email of the Microsoft account
    pub user_email: String,
}

/// MCP server over the enabled Teams connectors plus the always-on auth tools.
pub struct McpServer {
    ctx: Arc<AppContext>,
    registry: ConnectorRegistry,
}

impl McpServer {
    pub fn new(ctx: Arc<AppContext>) -> Result<Self, TeamsError> {
        let registry = build_registry(&ctx.enabled_tools)?;
        Ok(Self { ctx, registry })
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(Default::default()),
            ..Default::default()
        }
    }

    pub async fn handle_initialize(
        &self,
        request: InitializeRequestParam,
    ) -> Result<InitializeResult, TeamsError> {
        info!(client = %request.client_info.name, "MCP Server initializing");

        let groups = self
            .registry
            .list_connectors()
            .into_iter()
            .map(|c| format!("{} ({})", c.name, c.description))
            .collect::<Vec<_>>()
            .join("; ");

        Ok(InitializeResult {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: self.capabilities(),
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                title: Some("Microsoft Teams".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Microsoft Teams via Microsoft Graph. Every tool takes user_email. If a tool reports that authentication is required, call start_teams_auth with the same user_email and open the returned URL. Enabled tool groups: {}.",
                groups
            )),
        })
    }

    fn auth_tools(&self) -> Result<Vec<Tool>, TeamsError> {
        Ok(vec![
            tool::<UserEmailInput>(
                "start_teams_auth",
                "Start Microsoft sign-in for user_email. Returns a URL to open in a browser; the session is bound once the redirect completes.",
            )?,
            tool::<UserEmailInput>(
                "get_teams_auth_status",
                "Report whether user_email is signed in for this session, awaiting the browser callback, or expired.",
            )?,
            tool::<UserEmailInput>(
                "teams_logout",
                "Sign user_email out: removes the session and the stored credentials.",
            )?,
        ])
    }

    pub fn handle_list_tools(&self) -> Result<ListToolsResult, TeamsError> {
        let mut tools = self.auth_tools()?;
        tools.extend(self.registry.tools().iter().cloned());
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    /// Dispatches a tool call. Failures other than protocol errors come back as
    /// `is_error` results the agent can read.
    pub async fn handle_call_tool(
        &self,
        request: CallToolRequestParam,
        ctx: &ToolContext,
    ) -> Result<CallToolResult, TeamsError> {
        let name = request.name.as_ref();
        let args = request.arguments.unwrap_or_default();
        debug!(tool = name, mcp_session_id = ?ctx.mcp_session_id, "Calling tool");

        let outcome = match name {
            "start_teams_auth" => parse_args(args).and_then(|i| self.start_auth(i, ctx)),
            "get_teams_auth_status" => parse_args(args).and_then(|i| self.auth_status(i, ctx)),
            "teams_logout" => parse_args(args).and_then(|i| self.logout(i, ctx)),
            other => match self.registry.connector_for(other) {
                Some(connector) => {
                    connector
                        .call_tool(other, args, &self.ctx.services, ctx)
                        .await
                }
                None => Err(TeamsError::ToolNotFound),
            },
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(e) if e.is_protocol_error() => Err(e),
            Err(e) => {
                warn!(tool = name, kind = e.code_str(), "Tool returned an error: {}", e);
                Ok(error_result(&e))
            }
        }
    }

    fn start_auth(
        &self,
        input: UserEmailInput,
        ctx: &ToolContext,
    ) -> Result<CallToolResult, TeamsError> {
        let request = self
            .ctx
            .auth
            .start_authorization(Some(&input.user_email), ctx.mcp_session_id.as_deref())?;
        let scopes: Vec<&str> = request.scopes.iter().map(|s| scopes::simplify(s)).collect();
        let text = format!(
            "Microsoft Teams authentication required.\n\nOpen this URL in a browser and sign in as {}:\n\n{}\n\nAfter signing in you are redirected to {} and can retry your request.",
            input.user_email, request.url, request.redirect_uri
        );
        structured_result_with_text(
            &json!({
                "user_email": input.user_email,
                "auth_url": request.url,
                "state": request.state,
                "redirect_uri": request.redirect_uri,
                "scopes": scopes,
            }),
            Some(text),
        )
    }

    fn auth_status(
        &self,
        input: UserEmailInput,
        ctx: &ToolContext,
    ) -> Result<CallToolResult, TeamsError> {
        let status = self
            .ctx
            .auth
            .status(&input.user_email, ctx.mcp_session_id.as_deref());
        let text = match &status {
            AuthStatus::Unauthenticated => format!(
                "{} is not signed in for this session. Call start_teams_auth to sign in.",
                input.user_email
            ),
            AuthStatus::AwaitingCallback => format!(
                "Sign-in for {} has started; waiting for the browser redirect.",
                input.user_email
            ),
            AuthStatus::Authenticated { expires_at } => match expires_at {
                Some(at) => format!("{} is signed in until {}.", input.user_email, at.to_rfc3339()),
                None => format!("{} is signed in.", input.user_email),
            },
            AuthStatus::Expired { refreshable: true } => format!(
                "The token for {} has expired and will be refreshed on the next call.",
                input.user_email
            ),
            AuthStatus::Expired { refreshable: false } => format!(
                "The token for {} has expired. Call start_teams_auth to sign in again.",
                input.user_email
            ),
        };
        structured_result_with_text(
            &json!({
                "user_email": input.user_email,
                "status": status,
                "single_user": self.ctx.auth.is_single_user(),
            }),
            Some(text),
        )
    }

    fn logout(&self, input: UserEmailInput, ctx: &ToolContext) -> Result<CallToolResult, TeamsError> {
        let removed = self
            .ctx
            .auth
            .logout(ctx.credential_request(&input.user_email))?;
        let text = if removed {
            format!("Signed out {}.", input.user_email)
        } else {
            format!("{} had no active session.", input.user_email)
        };
        structured_result_with_text(
            &json!({ "user_email": input.user_email, "signed_out": removed }),
            Some(text),
        )
    }
}

/// JSON-RPC message handler for the MCP server
pub struct JsonRpcHandler {
    server: McpServer,
}

impl JsonRpcHandler {
    pub fn new(server: McpServer) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &McpServer {
        &self.server
    }

    /// Requests carry an `id`; notifications do not and get no response.
    pub fn is_notification(request: &Value) -> bool {
        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
        request.get("id").is_none() || method.starts_with("notifications/")
    }

    /// Process a JSON-RPC message; `None` for notifications.
    pub async fn handle_request(&self, request: Value, ctx: &ToolContext) -> Option<Value> {
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        if Self::is_notification(&request) {
            debug!(method = %method, "Notification received");
            return None;
        }
        debug!(method = %method, "Handling JSON-RPC request");

        let id = request.get("id").cloned();
        let params = request.get("params").cloned().unwrap_or(json!({}));

        let result = match method.as_str() {
            "initialize" => match serde_json::from_value::<InitializeRequestParam>(params) {
                Ok(req) => self
                    .server
                    .handle_initialize(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(TeamsError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(TeamsError::SerdeJson(e).to_jsonrpc_error()),
            },
            "ping" => Ok(json!({})),
            "tools/list" => self
                .server
                .handle_list_tools()
                .and_then(|r| serde_json::to_value(r).map_err(TeamsError::SerdeJson))
                .map_err(|e| e.to_jsonrpc_error()),
            "tools/call" => match serde_json::from_value::<CallToolRequestParam>(params) {
                Ok(req) => self
                    .server
                    .handle_call_tool(req, ctx)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(TeamsError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(TeamsError::SerdeJson(e).to_jsonrpc_error()),
            },
            _ => Err(TeamsError::MethodNotFound.to_jsonrpc_error()),
        };

        Some(match result {
            Ok(result) => json!({
                "jsonrpc": "2.0",
                "result": result,
                "id": id,
            }),
            Err(error) => json!({
                "jsonrpc": "2.0",
                "error": error,
                "id": id,
            }),
        })
    }
}

use async_trait::async_trait;
use rmcp::model::{CallToolResult, JsonObject, Tool};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{clamp_limit, collection, parse_args, tool, MAX_PAGE};
use crate::context::{GraphServices, ServiceRequest, ToolContext};
use crate::error::TeamsError;
use crate::scopes::ToolGroup;
use crate::utils::structured_result_with_text;
use crate::Connector;

const SERVICE: &str = "user";
const USER_FIELDS: &str =
    "id,displayName,mail,userPrincipalName,jobTitle,department,officeLocation";
const DEFAULT_USER_LIMIT: u32 = 10;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CurrentUserInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchUsersInput {
    /// Email of the signed-in user to act as
    pub user_email: String,
    /// Prefix of a display name, email address or user principal name
    pub query: String,
    /// Number of users to return (1-50, default 10)
    #[serde(default)]
    pub limit: Option<i64>,
}

/// OData `$filter` matching users whose name, mail or UPN starts with `query`.
pub fn user_search_filter(query: &str) -> String {
    let q = query.trim().replace('\'', "''");
    format!(
        "startswith(displayName,'{q}') or startswith(mail,'{q}') or startswith(userPrincipalName,'{q}')"
    )
}

fn user_view(u: &Value) -> Value {
    json!({
        "id": u.get("id"),
        "display_name": u.get("displayName"),
        "email": u.get("mail").filter(|m| !m.is_null()).or_else(|| u.get("userPrincipalName")),
        "user_principal_name": u.get("userPrincipalName"),
        "job_title": u.get("jobTitle"),
        "department": u.get("department"),
        "office_location": u.get("officeLocation"),
    })
}

/// Directory lookups.
#[derive(Debug, Clone, Default)]
pub struct UsersConnector;

impl UsersConnector {
    pub fn new() -> Self {
        Self
    }

    async fn get_current_user(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: CurrentUserInput,
    ) -> Result<CallToolResult, TeamsError> {
        let request = ServiceRequest {
            tool: "get_current_user",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["user_read"],
        };
        let me = services
            .with_client(ctx, request, |auth| async move {
                auth.client
                    .get_with_query("/me", &[("$select", USER_FIELDS.to_string())])
                    .await
            })
            .await?;
        structured_result_with_text(&user_view(&me), None)
    }

    async fn search_users(
        &self,
        services: &GraphServices,
        ctx: &ToolContext,
        input: SearchUsersInput,
    ) -> Result<CallToolResult, TeamsError> {
        if input.query.trim().is_empty() {
            return Err(TeamsError::InvalidInput("query must not be empty".into()));
        }
        let filter = user_search_filter(&input.query);
        let top = clamp_limit(input.limit, DEFAULT_USER_LIMIT, MAX_PAGE);
        let request = ServiceRequest {
            tool: "search_users",
            user_email: &input.user_email,
            service_type: SERVICE,
            scope_groups: &["user_read"],
        };
        let resp = services
            .with_client(ctx, request, |auth| async move {
                auth.client
                    .get_with_query(
                        "/users",
                        &[
                            ("$filter", filter),
                            ("$top", top.to_string()),
                            ("$select", USER_FIELDS.to_string()),
                        ],
                    )
                    .await
            })
            .await?;

        let users: Vec<Value> = collection(&resp).iter().map(user_view).collect();
        structured_result_with_text(
            &json!({ "query": input.query, "count": users.len(), "users": users }),
            None,
        )
    }
}

#[async_trait]
impl Connector for UsersConnector {
    fn name(&self) -> &'static str {
        "users"
    }

    fn description(&self) -> &'static str {
        "The signed-in user's profile and directory search."
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Users
    }

    fn list_tools(&self) -> Result<Vec<Tool>, TeamsError> {
        Ok(vec![
            tool::<CurrentUserInput>(
                "get_current_user",
                "Get the profile of the signed-in user.",
            )?,
            tool::<SearchUsersInput>(
                "search_users",
                "Find users whose display name, email or user principal name starts with the query.",
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
            "get_current_user" => self.get_current_user(services, ctx, parse_args(args)?).await,
            "search_users" => self.search_users(services, ctx, parse_args(args)?).await,
            _ => Err(TeamsError::ToolNotFound),
        }
    }
}

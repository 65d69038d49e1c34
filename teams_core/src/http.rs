//! HTTP surface: OAuth redirect target, health check and the streamable-HTTP MCP endpoint.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth_flow::CallbackParams;
use crate::context::{AppContext, ToolContext};
use crate::error::TeamsError;
use crate::mcp_server::JsonRpcHandler;

pub const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

/// Application error for the JSON endpoints
pub enum AppError {
    BadRequest(TeamsError),
    Unauthorized(TeamsError),
    BadGateway(TeamsError),
    ServerError(TeamsError),
}

impl From<TeamsError> for AppError {
    fn from(err: TeamsError) -> Self {
        match err {
            TeamsError::InvalidInput(_) | TeamsError::InvalidParams(_) | TeamsError::SerdeJson(_) => {
                AppError::BadRequest(err)
            }
            TeamsError::Authentication(_) | TeamsError::TokenRefresh { .. } => {
                AppError::Unauthorized(err)
            }
            TeamsError::TransientNetwork { .. } | TeamsError::Graph { .. } => {
                AppError::BadGateway(err)
            }
            _ => AppError::ServerError(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, err) = match self {
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            AppError::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e),
            AppError::BadGateway(e) => (StatusCode::BAD_GATEWAY, e),
            AppError::ServerError(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
        };
        let body = Json(ErrorResponse {
            error: err.to_string(),
            kind: err.code_str(),
        });
        (status, body).into_response()
    }
}

#[derive(Clone)]
pub struct HttpState {
    handler: Arc<JsonRpcHandler>,
    transport: &'static str,
}

impl HttpState {
    fn app(&self) -> &Arc<AppContext> {
        self.handler.server().context()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartAuthRequest {
    pub user_email: String,
}

#[derive(Debug, Serialize)]
pub struct StartAuthResponse {
    pub auth_url: String,
    pub state: String,
    pub message: String,
}

/// Routes for `transport`; `/mcp` is mounted only when MCP is served over HTTP.
pub fn router(handler: Arc<JsonRpcHandler>, transport: &'static str, include_mcp: bool) -> Router {
    let state = HttpState { handler, transport };
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/oauth2callback", get(oauth_callback))
        .route("/start_auth", post(start_auth));
    if include_mcp {
        router = router.route("/mcp", post(mcp));
    }
    router.with_state(state)
}

/// Binds `host:port` and serves `router` until the listener fails.
pub async fn serve(router: Router, host: &str, port: u16) -> Result<(), TeamsError> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|e| TeamsError::Configuration(format!("cannot bind {}:{}: {}", host, port, e)))?;
    info!(address = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// GET /health
async fn health(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "microsoft-teams-mcp",
        "version": env!("CARGO_PKG_VERSION"),
        "transport": state.transport,
    }))
}

/// GET /oauth2callback
///
/// Browser redirect target. Completes the flow and renders a page the user can close.
async fn oauth_callback(
    State(state): State<HttpState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    debug!(has_code = params.code.is_some(), "OAuth callback received");

    match state.app().auth.handle_callback(params).await {
        Ok(user) => {
            let body = format!(
                "<p>Signed in as <strong>{}</strong>.</p><p>You can close this window and return to your assistant.</p>",
                html_escape::encode_text(&user.user_email)
            );
            (StatusCode::OK, Html(page("Authentication successful", &body))).into_response()
        }
        Err(e) => {
            warn!(kind = e.code_str(), "OAuth callback failed: {}", e);
            let status = match e {
                TeamsError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
                TeamsError::TransientNetwork { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::BAD_REQUEST,
            };
            let body = format!(
                "<p>{}</p><p>Start the sign-in again from your assistant.</p>",
                html_escape::encode_text(&e.to_string())
            );
            (status, Html(page("Authentication failed", &body))).into_response()
        }
    }
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head><body><h1>{title}</h1>{body}</body></html>"
    )
}

/// POST /start_auth
async fn start_auth(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(request): Json<StartAuthRequest>,
) -> Result<Json<StartAuthResponse>, AppError> {
    let mcp_session_id = session_header(&headers);
    let auth = state
        .app()
        .auth
        .start_authorization(Some(&request.user_email), mcp_session_id.as_deref())?;
    Ok(Json(StartAuthResponse {
        message: format!(
            "Open the URL in a browser and sign in as {}.",
            request.user_email
        ),
        auth_url: auth.url,
        state: auth.state,
    }))
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// POST /mcp
///
/// One JSON-RPC message per request. `initialize` mints the session id returned in
/// `Mcp-Session-Id`; later requests carry it back.
async fn mcp(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let parse_error = json!({
                "jsonrpc": "2.0",
                "error": { "code": -32700, "message": "Parse error", "data": e.to_string() },
                "id": null
            });
            return (StatusCode::BAD_REQUEST, Json(parse_error)).into_response();
        }
    };

    let is_initialize = request.get("method").and_then(Value::as_str) == Some("initialize");
    let session_id = if is_initialize {
        let minted = Uuid::new_v4().to_string();
        info!(mcp_session_id = %minted, "New MCP session");
        Some(minted)
    } else {
        session_header(&headers)
    };
    let ctx = ToolContext {
        mcp_session_id: session_id.clone(),
        auth_token_email: None,
    };

    let Some(response) = state.handler.handle_request(request, &ctx).await else {
        return StatusCode::ACCEPTED.into_response();
    };

    let mut resp = Json(response).into_response();
    if let Some(id) = session_id.filter(|_| is_initialize) {
        if let Ok(value) = HeaderValue::from_str(&id) {
            resp.headers_mut().insert(MCP_SESSION_HEADER, value);
        }
    }
    resp
}

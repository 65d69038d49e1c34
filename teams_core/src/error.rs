// src/error.rs
use serde_json::json;

use crate::auth_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum TeamsError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Re-authentication required for {user_email}: {reason}")]
    TokenRefresh { user_email: String, reason: String },

    #[error("Network error during {operation}: {message}")]
    TransientNetwork {
        operation: &'static str,
        message: String,
    },

    #[error("Credential persistence error: {0}")]
    Persistence(String),

    #[error("Microsoft Graph error ({status}): {message}")]
    Graph { status: u16, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Tool not found")]
    ToolNotFound,

    #[error("Method not found")]
    MethodNotFound,

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TeamsError {
    pub fn code_str(&self) -> &'static str {
        match self {
            TeamsError::Configuration(_) => "not_configured",
            TeamsError::Authentication(_) => "auth_failed",
            TeamsError::TokenRefresh { .. } => "reauth_required",
            TeamsError::TransientNetwork { .. } => "network_error",
            TeamsError::Persistence(_) => "persistence_error",
            TeamsError::Graph { .. } => "upstream_error",
            TeamsError::InvalidInput(_) => "invalid_input",
            TeamsError::InvalidParams(_) => "invalid_params",
            TeamsError::ToolNotFound => "tool_not_found",
            TeamsError::MethodNotFound => "method_not_found",
            TeamsError::SerdeJson(_) => "parse_error",
            TeamsError::Io(_) | TeamsError::InternalError(_) => "internal_error",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            TeamsError::TransientNetwork { .. } => true,
            TeamsError::Graph { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Errors that belong in a JSON-RPC error object rather than a tool result.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TeamsError::InvalidParams(_)
                | TeamsError::ToolNotFound
                | TeamsError::MethodNotFound
                | TeamsError::SerdeJson(_)
        )
    }

    /// Classifies a transport-level `reqwest` failure for `operation`.
    pub fn from_reqwest(operation: &'static str, err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "request timed out".to_string()
        } else if err.is_connect() {
            "connection failed".to_string()
        } else if err.is_decode() {
            return TeamsError::InternalError(format!(
                "{}: could not decode response body",
                operation
            ));
        } else {
            // Drop the URL: query strings may carry search terms or codes.
            err.without_url().to_string()
        };
        TeamsError::TransientNetwork { operation, message }
    }

    pub fn to_jsonrpc_error(&self) -> serde_json::Value {
        let (code, message) = match self {
            TeamsError::ToolNotFound => (-32602, "Tool not found".to_string()),
            TeamsError::InvalidParams(msg) => (-32602, msg.to_string()),
            TeamsError::InvalidInput(msg) => (-32602, msg.to_string()),
            TeamsError::MethodNotFound => (-32601, "Method not found".to_string()),
            TeamsError::SerdeJson(e) => (-32602, format!("Invalid params: {}", e)),
            err => (-32603, err.to_string()),
        };

        json!({
            "code": code,
            "message": message,
            "data": { "kind": self.code_str(), "retryable": self.is_retryable() },
        })
    }
}

impl From<StoreError> for TeamsError {
    fn from(err: StoreError) -> Self {
        TeamsError::Persistence(err.to_string())
    }
}

use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::fmt;
use tracing::debug;

use crate::error::TeamsError;

const ERROR_BODY_LIMIT: usize = 300;

/// Bearer-authenticated Microsoft Graph client for one access token.
#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphClient")
            .field("base_url", &self.base_url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl GraphClient {
    pub fn new(http: reqwest::Client, base_url: &str, access_token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    pub(crate) fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `endpoint`. Absolute inputs such as `@odata.nextLink` pass through.
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    pub async fn get(&self, endpoint: &str) -> Result<Value, TeamsError> {
        self.send("graph_get", self.http.get(self.url(endpoint))).await
    }

    pub async fn get_with_query(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Value, TeamsError> {
        self.send("graph_get", self.http.get(self.url(endpoint)).query(query))
            .await
    }

    pub async fn post(&self, endpoint: &str, body: &Value) -> Result<Value, TeamsError> {
        self.send("graph_post", self.http.post(self.url(endpoint)).json(body))
            .await
    }

    pub async fn put(&self, endpoint: &str, body: &Value) -> Result<Value, TeamsError> {
        self.send("graph_put", self.http.put(self.url(endpoint)).json(body))
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value, TeamsError> {
        self.send("graph_delete", self.http.delete(self.url(endpoint)))
            .await
    }

    async fn send(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<Value, TeamsError> {
        let resp = builder
            .bearer_auth(&self.access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| TeamsError::from_reqwest(operation, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TeamsError::from_reqwest(operation, e))?;
        debug!(operation, status = status.as_u16(), "Graph response");

        if !status.is_success() {
            return Err(graph_error(status, &body));
        }
        if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&body).map_err(|e| {
            TeamsError::InternalError(format!("{}: invalid JSON from Graph: {}", operation, e))
        })
    }
}

fn graph_error(status: StatusCode, body: &str) -> TeamsError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let err = v.get("error")?;
            let code = err.get("code").and_then(|c| c.as_str()).unwrap_or("error");
            let msg = err.get("message").and_then(|m| m.as_str()).unwrap_or("");
            Some(format!("{}: {}", code, msg))
        })
        .unwrap_or_else(|| {
            let mut s: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            if s.is_empty() {
                s = status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string();
            }
            s
        });
    TeamsError::Graph {
        status: status.as_u16(),
        message,
    }
}

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::OAuthConfig;
use crate::credentials::CredentialRecord;
use crate::error::TeamsError;
use crate::graph::GraphClient;
use crate::scopes;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub email: String,
    pub display_name: Option<String>,
    pub id: Option<String>,
}

/// Token endpoint and identity lookup used by the authorization flow.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchanges an authorization code for a complete credential.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<CredentialRecord, TeamsError>;

    /// Returns `record` with a fresh access token. A rejected refresh is `TokenRefresh`.
    async fn refresh(
        &self,
        user_email: &str,
        record: &CredentialRecord,
    ) -> Result<CredentialRecord, TeamsError>;

    /// Canonical email of the token's owner, from Graph `/me`.
    async fn fetch_identity(&self, access_token: &str) -> Result<UserIdentity, TeamsError>;
}

pub struct MicrosoftIdentityProvider {
    http: reqwest::Client,
    oauth: OAuthConfig,
    graph_endpoint: String,
}

impl MicrosoftIdentityProvider {
    pub fn new(http: reqwest::Client, oauth: OAuthConfig, graph_endpoint: impl Into<String>) -> Self {
        Self {
            http,
            oauth,
            graph_endpoint: graph_endpoint.into(),
        }
    }

    /// Token endpoint for a stored record. Only endpoints on the configured authority host are
    /// honored so a tampered file cannot redirect the client secret elsewhere.
    fn token_endpoint_for(&self, record: &CredentialRecord) -> String {
        let host = self.oauth.authority_host.trim_end_matches('/');
        match record.token_endpoint.as_deref() {
            Some(uri) if uri.starts_with(&format!("{}/", host)) => uri.to_string(),
            Some(uri) => {
                warn!(token_uri = %uri, "Ignoring stored token endpoint outside the configured authority");
                self.oauth.token_endpoint()
            }
            None => self.oauth.token_endpoint(),
        }
    }

    async fn post_token_form(
        &self,
        operation: &'static str,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<Result<OAuthTokens, ProviderError>, TeamsError> {
        let resp = self
            .http
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| TeamsError::from_reqwest(operation, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TeamsError::from_reqwest(operation, e))?;

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(TeamsError::TransientNetwork {
                operation,
                message: format!("identity provider returned {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Ok(Err(ProviderError::parse(status.as_u16(), &body)));
        }
        serde_json::from_str::<OAuthTokens>(&body)
            .map(Ok)
            .map_err(|e| TeamsError::InternalError(format!("{}: unexpected token response: {}", operation, e)))
    }
}

/// `error` / `error_description` from a rejected token request.
#[derive(Debug, Clone)]
struct ProviderError {
    status: u16,
    error: String,
    description: Option<String>,
}

impl ProviderError {
    fn parse(status: u16, body: &str) -> Self {
        let v: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        let error = v
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown_error")
            .to_string();
        // Azure AD descriptions append trace ids on later lines.
        let description = v
            .get("error_description")
            .and_then(|d| d.as_str())
            .and_then(|d| d.lines().next())
            .map(|d| d.trim().to_string());
        Self {
            status,
            error,
            description,
        }
    }

    fn summary(&self) -> String {
        match &self.description {
            Some(d) => format!("{} ({}): {}", self.error, self.status, d),
            None => format!("{} ({})", self.error, self.status),
        }
    }
}

fn scope_set(raw: Option<&str>, fallback: impl IntoIterator<Item = String>) -> std::collections::BTreeSet<String> {
    match raw {
        Some(s) if !s.trim().is_empty() => s.split_whitespace().map(str::to_string).collect(),
        _ => fallback.into_iter().collect(),
    }
}

#[async_trait]
impl IdentityProvider for MicrosoftIdentityProvider {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<CredentialRecord, TeamsError> {
        let client = self.oauth.client_credentials()?;
        let endpoint = self.oauth.token_endpoint();
        let form = [
            ("client_id", client.client_id.clone()),
            ("client_secret", client.client_secret.clone()),
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("scope", scopes::scope_param(scopes)),
        ];

        let tokens = self
            .post_token_form("token_exchange", &endpoint, &form)
            .await?
            .map_err(|e| {
                TeamsError::Authentication(format!("authorization code exchange failed: {}", e.summary()))
            })?;

        let mut record = CredentialRecord {
            access_token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token,
            token_endpoint: Some(endpoint),
            client_id: Some(client.client_id),
            client_secret: Some(client.client_secret),
            scopes: scope_set(tokens.scope.as_deref(), scopes.iter().cloned()),
            expiry: None,
            tenant_id: Some(self.oauth.tenant_id.clone()),
        };
        record.apply_expires_in(tokens.expires_in.unwrap_or(DEFAULT_EXPIRES_IN), Utc::now());
        if record.refresh_token.is_none() {
            warn!("Token response carried no refresh token; silent refresh will be unavailable");
        }
        Ok(record)
    }

    async fn refresh(
        &self,
        user_email: &str,
        record: &CredentialRecord,
    ) -> Result<CredentialRecord, TeamsError> {
        let refresh_token = record
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TeamsError::TokenRefresh {
                user_email: user_email.to_string(),
                reason: "no refresh token stored".into(),
            })?;

        let configured = self.oauth.client_credentials().ok();
        let client_id = record
            .client_id
            .clone()
            .or_else(|| configured.as_ref().map(|c| c.client_id.clone()))
            .ok_or_else(|| TeamsError::Configuration("no client id available for token refresh".into()))?;
        let client_secret = record
            .client_secret
            .clone()
            .or_else(|| configured.as_ref().map(|c| c.client_secret.clone()))
            .ok_or_else(|| {
                TeamsError::Configuration("no client secret available for token refresh".into())
            })?;

        let endpoint = self.token_endpoint_for(record);
        let scope_list: Vec<String> = record.scopes.iter().cloned().collect();
        let mut form = vec![
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        if !scope_list.is_empty() {
            form.push(("scope", scopes::scope_param(&scope_list)));
        }

        debug!(user_email = %user_email, "Refreshing access token");
        let tokens = self
            .post_token_form("token_refresh", &endpoint, &form)
            .await?
            .map_err(|e| TeamsError::TokenRefresh {
                user_email: user_email.to_string(),
                reason: e.summary(),
            })?;

        let mut refreshed = record.clone();
        refreshed.access_token = Some(tokens.access_token);
        if let Some(rt) = tokens.refresh_token.filter(|t| !t.is_empty()) {
            refreshed.refresh_token = Some(rt);
        }
        if let Some(scope) = tokens.scope.as_deref().filter(|s| !s.trim().is_empty()) {
            refreshed.scopes = scope_set(Some(scope), Vec::new());
        }
        refreshed.apply_expires_in(tokens.expires_in.unwrap_or(DEFAULT_EXPIRES_IN), Utc::now());
        info!(user_email = %user_email, expiry = ?refreshed.expiry, "Access token refreshed");
        Ok(refreshed)
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<UserIdentity, TeamsError> {
        let client = GraphClient::new(self.http.clone(), &self.graph_endpoint, access_token);
        let me = client
            .get_with_query(
                "/me",
                &[("$select", "id,displayName,mail,userPrincipalName".to_string())],
            )
            .await
            .map_err(|e| match e {
                TeamsError::Graph { status, message } => TeamsError::Authentication(format!(
                    "could not resolve signed-in user ({}): {}",
                    status, message
                )),
                other => other,
            })?;
        identity_from_me(&me)
    }
}

/// `mail`, falling back to `userPrincipalName`. An identity without either is rejected.
pub fn identity_from_me(me: &Value) -> Result<UserIdentity, TeamsError> {
    let non_empty = |key: &str| {
        me.get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let email = non_empty("mail")
        .or_else(|| non_empty("userPrincipalName"))
        .ok_or_else(|| {
            TeamsError::Authentication(
                "Microsoft Graph /me returned neither mail nor userPrincipalName".into(),
            )
        })?;
    Ok(UserIdentity {
        email,
        display_name: non_empty("displayName"),
        id: non_empty("id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_prefers_mail() {
        let me = json!({"mail": "alice@example.com", "userPrincipalName": "alice@contoso.onmicrosoft.com"});
        assert_eq!(identity_from_me(&me).unwrap().email, "alice@example.com");
    }

    #[test]
    fn test_identity_falls_back_to_upn() {
        let me = json!({"mail": null, "userPrincipalName": "bob@contoso.onmicrosoft.com", "displayName": "Bob"});
        let id = identity_from_me(&me).unwrap();
        assert_eq!(id.email, "bob@contoso.onmicrosoft.com");
        assert_eq!(id.display_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_identity_without_email_is_hard_failure() {
        let me = json!({"mail": "", "displayName": "Ghost"});
        assert!(matches!(
            identity_from_me(&me),
            Err(TeamsError::Authentication(_))
        ));
    }

    #[test]
    fn test_provider_error_keeps_first_line_only() {
        let err = ProviderError::parse(
            400,
            r#"{"error":"invalid_grant","error_description":"AADSTS70008: The refresh token has expired.\r\nTrace ID: abc"}"#,
        );
        assert_eq!(
            err.summary(),
            "invalid_grant (400): AADSTS70008: The refresh token has expired."
        );
    }

    #[test]
    fn test_stored_token_endpoint_must_match_authority() {
        let provider = MicrosoftIdentityProvider::new(
            reqwest::Client::new(),
            OAuthConfig::default(),
            "https://graph.microsoft.com/v1.0",
        );
        let mut record = CredentialRecord {
            token_endpoint: Some(
                "https://login.microsoftonline.com/contoso/oauth2/v2.0/token".into(),
            ),
            ..Default::default()
        };
        assert_eq!(
            provider.token_endpoint_for(&record),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        record.token_endpoint = Some("https://evil.example/token".into());
        assert_eq!(
            provider.token_endpoint_for(&record),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
    }
}

//! OAuth authorization-code flow and the authenticated-access path.
//!
//! `start_authorization` moves a user to awaiting-callback, `handle_callback`
//! establishes an authenticated session bound to the external session that
//! started the flow, and `resolve_credentials` hands out a valid credential
//! (refreshing it when needed) only to a caller that owns it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth_store::CredentialStore;
use crate::config::TeamsConfig;
use crate::credentials::{normalize_email, CredentialRecord};
use crate::error::TeamsError;
use crate::oauth::IdentityProvider;
use crate::oauth_state::OAuthStateManager;
use crate::scopes;
use crate::service_cache::ServiceCache;
use crate::session_store::{NewSession, SessionStore};

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Query parameters delivered to the redirect URI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub user_email: String,
    pub display_name: Option<String>,
    pub mcp_session_id: Option<String>,
}

/// Who is asking for which identity's credentials.
#[derive(Debug, Clone, Copy)]
pub struct CredentialRequest<'a> {
    pub user_email: &'a str,
    pub mcp_session_id: Option<&'a str>,
    pub auth_token_email: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub user_email: String,
    pub record: CredentialRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthStatus {
    Unauthenticated,
    AwaitingCallback,
    Authenticated {
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    Expired {
        refreshable: bool,
    },
}

pub struct AuthFlow {
    config: Arc<TeamsConfig>,
    provider: Arc<dyn IdentityProvider>,
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<SessionStore>,
    cache: Arc<ServiceCache>,
    states: OAuthStateManager,
    scopes: Vec<String>,
}

impl AuthFlow {
    pub fn new(
        config: Arc<TeamsConfig>,
        provider: Arc<dyn IdentityProvider>,
        credentials: Arc<dyn CredentialStore>,
        sessions: Arc<SessionStore>,
        cache: Arc<ServiceCache>,
        scopes: Vec<String>,
    ) -> Self {
        let states = OAuthStateManager::new(config.session.oauth_state_ttl_secs);
        Self {
            config,
            provider,
            credentials,
            sessions,
            cache,
            states,
            scopes,
        }
    }

    pub fn is_single_user(&self) -> bool {
        self.config.single_user
    }

    /// Builds the provider authorization URL and records a pending state.
    pub fn start_authorization(
        &self,
        login_hint: Option<&str>,
        mcp_session_id: Option<&str>,
    ) -> Result<AuthorizationRequest, TeamsError> {
        let client = self.config.oauth.client_credentials()?;
        let redirect_uri = self.config.redirect_uri();
        let login_hint = login_hint.map(normalize_email).filter(|h| !h.is_empty());

        let mut url = Url::parse(&self.config.oauth.authorize_endpoint()).map_err(|e| {
            TeamsError::Configuration(format!("invalid authority host: {}", e))
        })?;
        let state = self
            .states
            .create_state(login_hint.as_deref(), mcp_session_id);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &client.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", &redirect_uri)
                .append_pair("scope", &scopes::scope_param(&self.scopes))
                .append_pair("state", &state)
                .append_pair("response_mode", "query");
            if let Some(hint) = &login_hint {
                query.append_pair("login_hint", hint);
            }
        }

        info!(
            login_hint = ?login_hint,
            mcp_session_id = ?mcp_session_id,
            "Started Microsoft authorization"
        );
        Ok(AuthorizationRequest {
            url: url.into(),
            state,
            redirect_uri,
            scopes: self.scopes.clone(),
        })
    }

    /// Completes the flow: exchanges the code, resolves the identity through `/me`,
    /// persists the credential and binds the originating session.
    pub async fn handle_callback(
        &self,
        params: CallbackParams,
    ) -> Result<AuthenticatedUser, TeamsError> {
        if let Some(err) = params.error.as_deref().filter(|e| !e.is_empty()) {
            let description = params
                .error_description
                .as_deref()
                .unwrap_or("no description");
            warn!(error = %err, description = %description, "Authorization failed at provider");
            return Err(TeamsError::Authentication(format!(
                "authorization failed: {} - {}",
                err, description
            )));
        }

        self.config.oauth.client_credentials()?;

        let state = params
            .state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TeamsError::InvalidInput("missing state parameter".into()))?;
        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| TeamsError::InvalidInput("missing authorization code".into()))?;
        let pending = self.states.validate_and_consume(&state).ok_or_else(|| {
            TeamsError::Authentication(
                "invalid or expired OAuth state; start the sign-in again".into(),
            )
        })?;

        let record = self
            .provider
            .exchange_code(&code, &self.config.redirect_uri(), &self.scopes)
            .await?;
        let access_token = record
            .access_token
            .clone()
            .ok_or_else(|| TeamsError::Authentication("token response had no access token".into()))?;
        let identity = self.provider.fetch_identity(&access_token).await?;
        let user_email = normalize_email(&identity.email);

        if let Some(hint) = &pending.login_hint {
            if *hint != user_email {
                warn!(
                    requested = %hint,
                    signed_in_as = %user_email,
                    "Signed in with a different account than requested"
                );
            }
        }

        if let Err(e) = self.credentials.save(&user_email, &record) {
            error!(user_email = %user_email, "Failed to persist credentials: {}", e);
        }

        let mut session = NewSession::new(&user_email, record)
            .with_session_id(&state)
            .with_issuer(self.config.oauth.issuer());
        if let Some(mcp) = &pending.mcp_session_id {
            session = session.with_mcp_session_id(mcp);
        }
        self.sessions.store_session(session)?;
        self.cache.invalidate_user(&user_email);

        info!(
            user_email = %user_email,
            mcp_session_id = ?pending.mcp_session_id,
            "Authentication completed"
        );
        Ok(AuthenticatedUser {
            user_email,
            display_name: identity.display_name,
            mcp_session_id: pending.mcp_session_id,
        })
    }

    /// The authenticated-access path: a valid credential for the requested identity,
    /// refreshed if expired, or a typed error.
    pub async fn resolve_credentials(
        &self,
        request: CredentialRequest<'_>,
    ) -> Result<ResolvedCredential, TeamsError> {
        if self.config.single_user {
            return self.resolve_single_user(request).await;
        }

        let user_email = normalize_email(request.user_email);
        if user_email.is_empty() {
            return Err(TeamsError::InvalidInput("user_email is required".into()));
        }
        let record = self
            .sessions
            .get_credentials_with_validation(
                &user_email,
                request.mcp_session_id,
                request.auth_token_email,
                self.config.session.allow_recent_auth,
            )
            .ok_or_else(|| {
                TeamsError::Authentication(format!(
                    "access denied: no credentials for {} are available to this session; call start_teams_auth to sign in",
                    user_email
                ))
            })?;

        if record.is_valid() {
            return Ok(ResolvedCredential { user_email, record });
        }
        self.ensure_refreshable(&user_email, &record)?;

        let refreshed = self.provider.refresh(&user_email, &record).await?;
        let store = Arc::clone(&self.credentials);
        let committed = self
            .sessions
            .commit_refresh(&user_email, refreshed.clone(), |r| store.save(&user_email, r))?;
        if !committed {
            return Err(TeamsError::Authentication(format!(
                "{} signed out while the token was being refreshed",
                user_email
            )));
        }
        self.cache.invalidate_user(&user_email);
        Ok(ResolvedCredential {
            user_email,
            record: refreshed,
        })
    }

    async fn resolve_single_user(
        &self,
        request: CredentialRequest<'_>,
    ) -> Result<ResolvedCredential, TeamsError> {
        let (user_email, record) = self.credentials.find_any().ok_or_else(|| {
            TeamsError::Authentication(
                "no stored credentials found; call start_teams_auth to sign in".into(),
            )
        })?;
        if !request.user_email.is_empty() && normalize_email(request.user_email) != user_email {
            debug!(
                requested = %request.user_email,
                using = %user_email,
                "Single-user mode ignores the requested identity"
            );
        }

        if record.is_valid() {
            return Ok(ResolvedCredential { user_email, record });
        }
        self.ensure_refreshable(&user_email, &record)?;

        let refreshed = self.provider.refresh(&user_email, &record).await?;
        if let Err(e) = self.credentials.save(&user_email, &refreshed) {
            warn!(user_email = %user_email, "Refreshed credential not persisted: {}", e);
        }
        self.cache.invalidate_user(&user_email);
        Ok(ResolvedCredential {
            user_email,
            record: refreshed,
        })
    }

    fn ensure_refreshable(
        &self,
        user_email: &str,
        record: &CredentialRecord,
    ) -> Result<(), TeamsError> {
        if record.can_refresh() {
            return Ok(());
        }
        info!(user_email = %user_email, "Credential expired with no refresh token");
        Err(TeamsError::Authentication(format!(
            "credentials for {} have expired and cannot be refreshed; re-authentication required",
            user_email
        )))
    }

    /// Signs the caller out after checking it owns the identity.
    pub fn logout(&self, request: CredentialRequest<'_>) -> Result<bool, TeamsError> {
        let user_email = normalize_email(request.user_email);
        let owns = self.config.single_user
            || self
                .sessions
                .get_credentials_with_validation(
                    &user_email,
                    request.mcp_session_id,
                    request.auth_token_email,
                    false,
                )
                .is_some();
        if !owns {
            return Err(TeamsError::Authentication(format!(
                "access denied: this session is not signed in as {}",
                user_email
            )));
        }
        self.logout_user(&user_email)
    }

    /// Removes every trace of `user_email`: session entry, bindings, credential file and
    /// cached clients. The first three change inside one session-store critical section.
    pub fn logout_user(&self, user_email: &str) -> Result<bool, TeamsError> {
        let store = Arc::clone(&self.credentials);
        let removed = self.sessions.logout(user_email, |email| store.delete(email))?;
        self.cache.invalidate_user(user_email);
        Ok(removed)
    }

    pub fn status(&self, user_email: &str, mcp_session_id: Option<&str>) -> AuthStatus {
        let email = normalize_email(user_email);
        let record = if self.config.single_user {
            self.credentials
                .find_any()
                .filter(|(found, _)| *found == email)
                .map(|(_, record)| record)
        } else {
            self.sessions
                .get_credentials_with_validation(&email, mcp_session_id, None, false)
        };

        match record {
            Some(record) if record.is_valid() => AuthStatus::Authenticated {
                expires_at: record.expiry,
            },
            Some(record) => AuthStatus::Expired {
                refreshable: record.can_refresh(),
            },
            None if self.states.is_pending_for(&email, mcp_session_id) => {
                AuthStatus::AwaitingCallback
            }
            None => AuthStatus::Unauthenticated,
        }
    }
}

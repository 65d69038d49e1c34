//! Process-wide state, built once by the entry point and passed down explicitly.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth_flow::{AuthFlow, CredentialRequest};
use crate::auth_store::{CredentialStore, FileCredentialStore};
use crate::config::TeamsConfig;
use crate::credentials::bounded_seconds;
use crate::error::TeamsError;
use crate::graph::GraphClient;
use crate::oauth::{IdentityProvider, MicrosoftIdentityProvider};
use crate::scopes::{self, ToolGroup};
use crate::service_cache::{ServiceCache, ServiceKey};
use crate::session_store::SessionStore;

/// Caller identity as seen by the transport for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    pub mcp_session_id: Option<String>,
    /// Email proven by a request-level auth token, when the transport has one.
    pub auth_token_email: Option<String>,
}

impl ToolContext {
    pub fn for_session(mcp_session_id: impl Into<String>) -> Self {
        Self {
            mcp_session_id: Some(mcp_session_id.into()),
            auth_token_email: None,
        }
    }

    pub fn credential_request<'a>(&'a self, user_email: &'a str) -> CredentialRequest<'a> {
        CredentialRequest {
            user_email,
            mcp_session_id: self.mcp_session_id.as_deref(),
            auth_token_email: self.auth_token_email.as_deref(),
        }
    }
}

/// What a tool needs: whose client, for which service, with which scope groups.
#[derive(Debug, Clone, Copy)]
pub struct ServiceRequest<'a> {
    pub tool: &'a str,
    pub user_email: &'a str,
    pub service_type: &'a str,
    pub scope_groups: &'a [&'a str],
}

#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub user_email: String,
    pub client: GraphClient,
}

/// Hands tools an authenticated Graph client after ownership validation.
pub struct GraphServices {
    auth: Arc<AuthFlow>,
    cache: Arc<ServiceCache>,
    http: reqwest::Client,
    graph_endpoint: String,
}

impl GraphServices {
    pub fn new(
        auth: Arc<AuthFlow>,
        cache: Arc<ServiceCache>,
        http: reqwest::Client,
        graph_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            auth,
            cache,
            http,
            graph_endpoint: graph_endpoint.into(),
        }
    }

    pub async fn authenticated_client(
        &self,
        ctx: &ToolContext,
        request: ServiceRequest<'_>,
    ) -> Result<AuthenticatedClient, TeamsError> {
        let resolved = self
            .auth
            .resolve_credentials(ctx.credential_request(request.user_email))
            .await
            .map_err(|e| {
                warn!(
                    tool = request.tool,
                    user_email = %request.user_email,
                    kind = e.code_str(),
                    "Could not obtain an authenticated client"
                );
                e
            })?;

        let token = resolved.record.access_token.clone().unwrap_or_default();
        let key = ServiceKey::new(
            &resolved.user_email,
            request.service_type,
            scopes::resolve_named(request.scope_groups),
        );
        if let Some(client) = self.cache.get(&key, &token) {
            debug!(tool = request.tool, user_email = %resolved.user_email, "Service cache hit");
            return Ok(AuthenticatedClient {
                user_email: resolved.user_email,
                client,
            });
        }

        let client = GraphClient::new(self.http.clone(), &self.graph_endpoint, token);
        self.cache.insert(key, client.clone());
        Ok(AuthenticatedClient {
            user_email: resolved.user_email,
            client,
        })
    }

    /// Runs `f` with an authenticated client for `request`.
    pub async fn with_client<T, F, Fut>(
        &self,
        ctx: &ToolContext,
        request: ServiceRequest<'_>,
        f: F,
    ) -> Result<T, TeamsError>
    where
        F: FnOnce(AuthenticatedClient) -> Fut,
        Fut: Future<Output = Result<T, TeamsError>>,
    {
        let client = self.authenticated_client(ctx, request).await?;
        f(client).await.map_err(|e| {
            debug!(tool = request.tool, kind = e.code_str(), "Tool call failed: {}", e);
            e
        })
    }
}

pub struct AppContext {
    pub config: Arc<TeamsConfig>,
    pub enabled_tools: BTreeSet<ToolGroup>,
    pub sessions: Arc<SessionStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub cache: Arc<ServiceCache>,
    pub auth: Arc<AuthFlow>,
    pub services: GraphServices,
}

impl AppContext {
    /// Production wiring: file-backed credentials and the Microsoft identity platform.
    pub fn new(config: TeamsConfig, enabled_tools: BTreeSet<ToolGroup>) -> Result<Self, TeamsError> {
        let http = config.http.build_client()?;
        let provider: Arc<dyn IdentityProvider> = Arc::new(MicrosoftIdentityProvider::new(
            http.clone(),
            config.oauth.clone(),
            config.graph.endpoint.clone(),
        ));
        let credentials: Arc<dyn CredentialStore> =
            Arc::new(FileCredentialStore::new(config.storage.credentials_dir.clone()));
        Ok(Self::with_parts(config, enabled_tools, provider, credentials, http))
    }

    pub fn with_parts(
        config: TeamsConfig,
        enabled_tools: BTreeSet<ToolGroup>,
        provider: Arc<dyn IdentityProvider>,
        credentials: Arc<dyn CredentialStore>,
        http: reqwest::Client,
    ) -> Self {
        let enabled_tools = if enabled_tools.is_empty() {
            ToolGroup::ALL.into_iter().collect()
        } else {
            enabled_tools
        };
        let config = Arc::new(config);
        let sessions = Arc::new(SessionStore::new(bounded_seconds(
            config.session.recent_auth_window_secs,
        )));
        let cache = Arc::new(ServiceCache::new(bounded_seconds(
            config.session.service_cache_ttl_secs,
        )));
        let auth = Arc::new(AuthFlow::new(
            Arc::clone(&config),
            provider,
            Arc::clone(&credentials),
            Arc::clone(&sessions),
            Arc::clone(&cache),
            scopes::resolve(&enabled_tools),
        ));
        let services = GraphServices::new(
            Arc::clone(&auth),
            Arc::clone(&cache),
            http,
            config.graph.endpoint.clone(),
        );

        Self {
            config,
            enabled_tools,
            sessions,
            credentials,
            cache,
            auth,
            services,
        }
    }

    pub fn is_enabled(&self, group: ToolGroup) -> bool {
        self.enabled_tools.contains(&group)
    }
}

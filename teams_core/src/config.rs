use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth_store::default_credentials_dir;
use crate::error::TeamsError;

/// Complete server configuration: defaults, then an optional TOML file, then environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamsConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub single_user: bool,
}

#[derive(Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    /// Overrides `{base_uri}:{port}/oauth2callback`.
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
}

fn default_tenant() -> String {
    "common".to_string()
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            tenant_id: default_tenant(),
            redirect_uri: None,
            authority_host: default_authority_host(),
        }
    }
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("tenant_id", &self.tenant_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("authority_host", &self.authority_host)
            .finish()
    }
}

/// Client id and secret, present only once configuration has been checked.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl OAuthConfig {
    pub fn is_configured(&self) -> bool {
        self.client_credentials().is_ok()
    }

    pub fn client_credentials(&self) -> Result<ClientCredentials, TeamsError> {
        let client_id = self.client_id.as_deref().map(str::trim).unwrap_or("");
        let client_secret = self.client_secret.as_deref().map(str::trim).unwrap_or("");
        match (client_id.is_empty(), client_secret.is_empty()) {
            (false, false) => Ok(ClientCredentials {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            }),
            (true, true) => Err(TeamsError::Configuration(
                "Microsoft OAuth is not configured: set MICROSOFT_OAUTH_CLIENT_ID and MICROSOFT_OAUTH_CLIENT_SECRET".into(),
            )),
            (true, false) => Err(TeamsError::Configuration(
                "Microsoft OAuth is not configured: MICROSOFT_OAUTH_CLIENT_ID is missing".into(),
            )),
            (false, true) => Err(TeamsError::Configuration(
                "Microsoft OAuth is not configured: MICROSOFT_OAUTH_CLIENT_SECRET is missing".into(),
            )),
        }
    }

    /// `{authority_host}/{tenant}`
    pub fn authority(&self) -> String {
        format!(
            "{}/{}",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    pub fn authorize_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority())
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority())
    }

    pub fn issuer(&self) -> String {
        format!("{}/v2.0", self.authority())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_uri")]
    pub base_uri: String,
    /// Interface the HTTP listener binds to.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_base_uri() -> String {
    "http://localhost".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_uri: default_base_uri(),
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_dir: default_credentials_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Lets a caller without a bound session use a credential stored within
    /// `recent_auth_window_secs`. Off unless explicitly enabled.
    #[serde(default)]
    pub allow_recent_auth: bool,
    #[serde(default = "default_recent_auth_window")]
    pub recent_auth_window_secs: i64,
    #[serde(default = "default_service_cache_ttl")]
    pub service_cache_ttl_secs: i64,
    #[serde(default = "default_oauth_state_ttl")]
    pub oauth_state_ttl_secs: i64,
}

fn default_recent_auth_window() -> i64 {
    120
}

fn default_service_cache_ttl() -> i64 {
    30 * 60
}

fn default_oauth_state_ttl() -> i64 {
    600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allow_recent_auth: false,
            recent_auth_window_secs: default_recent_auth_window(),
            service_cache_ttl_secs: default_service_cache_ttl(),
            oauth_state_ttl_secs: default_oauth_state_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl HttpConfig {
    /// Shared client with bounded request and connect timeouts.
    pub fn build_client(&self) -> Result<reqwest::Client, TeamsError> {
        reqwest::Client::builder()
            .user_agent(concat!("teams-mcp/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(self.timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs.max(1)))
            .build()
            .map_err(|e| TeamsError::InternalError(format!("http client: {}", e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_endpoint")]
    pub endpoint: String,
}

fn default_graph_endpoint() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            endpoint: default_graph_endpoint(),
        }
    }
}

impl TeamsConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, TeamsError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, TeamsError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TeamsError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, TeamsError> {
        toml::from_str(contents)
            .map_err(|e| TeamsError::Configuration(format!("invalid config: {}", e)))
    }

    /// Overlays environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("MICROSOFT_OAUTH_CLIENT_ID") {
            self.oauth.client_id = Some(v);
        }
        if let Some(v) = get("MICROSOFT_OAUTH_CLIENT_SECRET") {
            self.oauth.client_secret = Some(v);
        }
        if let Some(v) = get("MICROSOFT_TENANT_ID") {
            self.oauth.tenant_id = v;
        }
        if let Some(v) = get("MICROSOFT_OAUTH_REDIRECT_URI") {
            self.oauth.redirect_uri = Some(v);
        }
        if let Some(v) = get("MICROSOFT_AUTHORITY_HOST") {
            self.oauth.authority_host = v;
        }
        if let Some(v) = get("MICROSOFT_GRAPH_ENDPOINT") {
            self.graph.endpoint = v;
        }
        if let Some(v) = get("MICROSOFT_MCP_CREDENTIALS_DIR") {
            self.storage.credentials_dir = PathBuf::from(v);
        }
        if let Some(v) = get("TEAMS_MCP_BASE_URI") {
            self.server.base_uri = v;
        }
        if let Some(v) = get("TEAMS_MCP_HOST") {
            self.server.host = v;
        }
        if let Some(port) = get("TEAMS_MCP_PORT")
            .or_else(|| get("PORT"))
            .and_then(|v| v.parse::<u16>().ok())
        {
            self.server.port = port;
        }
        if let Some(v) = get("MCP_SINGLE_USER_MODE") {
            self.single_user = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn redirect_uri(&self) -> String {
        match &self.oauth.redirect_uri {
            Some(uri) => uri.clone(),
            None => format!(
                "{}:{}/oauth2callback",
                self.server.base_uri.trim_end_matches('/'),
                self.server.port
            ),
        }
    }
}

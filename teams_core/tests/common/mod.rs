#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use teams_core::auth_store::{CredentialStore, FileCredentialStore};
use teams_core::credentials::CredentialRecord;
use teams_core::oauth::{IdentityProvider, UserIdentity};
use teams_core::{AppContext, TeamsConfig, TeamsError, ToolGroup};

const TOKEN_PREFIX: &str = "token-for:";

/// Identity provider that treats the authorization code as the signed-in email.
#[derive(Default)]
pub struct FakeProvider {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub reject_refresh: bool,
}

impl FakeProvider {
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
        scopes: &[String],
    ) -> Result<CredentialRecord, TeamsError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(CredentialRecord {
            access_token: Some(format!("{}{}", TOKEN_PREFIX, code)),
            refresh_token: Some(format!("refresh-for:{}", code)),
            scopes: scopes.iter().cloned().collect(),
            expiry: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        })
    }

    async fn refresh(
        &self,
        user_email: &str,
        record: &CredentialRecord,
    ) -> Result<CredentialRecord, TeamsError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        // Lets concurrent callers interleave the way a real token request would.
        tokio::task::yield_now().await;
        if self.reject_refresh {
            return Err(TeamsError::TokenRefresh {
                user_email: user_email.to_string(),
                reason: "invalid_grant (400)".into(),
            });
        }
        let mut refreshed = record.clone();
        refreshed.access_token = Some(format!("refreshed-{}-for:{}", n, user_email));
        refreshed.expiry = Some(Utc::now() + Duration::hours(1));
        Ok(refreshed)
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<UserIdentity, TeamsError> {
        let email = access_token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| TeamsError::Authentication("unknown token".into()))?;
        Ok(UserIdentity {
            email: email.to_string(),
            display_name: None,
            id: Some(format!("id-{}", email)),
        })
    }
}

/// Configured for OAuth, storing credentials under `dir`.
pub fn configured(dir: &Path) -> TeamsConfig {
    let mut config = TeamsConfig::default();
    config.oauth.client_id = Some("test-client".into());
    config.oauth.client_secret = Some("test-secret".into());
    config.storage.credentials_dir = dir.to_path_buf();
    config
}

pub fn app(config: TeamsConfig, provider: Arc<FakeProvider>) -> AppContext {
    app_with_groups(config, provider, BTreeSet::new())
}

pub fn app_with_groups(
    config: TeamsConfig,
    provider: Arc<FakeProvider>,
    groups: BTreeSet<ToolGroup>,
) -> AppContext {
    let credentials: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(config.storage.credentials_dir.clone()));
    AppContext::with_parts(config, groups, provider, credentials, reqwest::Client::new())
}

pub fn valid_record(token: &str) -> CredentialRecord {
    CredentialRecord {
        access_token: Some(token.to_string()),
        refresh_token: Some(format!("{}-refresh", token)),
        expiry: Some(Utc::now() + Duration::hours(1)),
        ..Default::default()
    }
}

pub fn expired_record(token: &str) -> CredentialRecord {
    CredentialRecord {
        expiry: Some(Utc::now() - Duration::seconds(1)),
        ..valid_record(token)
    }
}

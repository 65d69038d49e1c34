//! In-memory session store: which credentials a caller may use.
//!
//! Entries are keyed by normalized user email. External (MCP) session ids resolve
//! to the owning email through the binding table, which is the only session-based
//! proof of ownership. Internal OAuth session ids are recorded for cleanup only:
//! they travel through browser redirects and are not secret. All three maps live
//! behind one mutex so a reader never sees a credential without its bindings or
//! the reverse.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::auth_store::StoreError;
use crate::credentials::{normalize_email, CredentialRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub credentials: CredentialRecord,
    pub session_id: Option<String>,
    pub mcp_session_id: Option<String>,
    pub issuer: Option<String>,
    pub stored_at: DateTime<Utc>,
}

impl StoredSession {
    fn same_content(&self, other: &NewSession) -> bool {
        self.credentials == other.credentials
            && self.session_id == other.session_id
            && self.mcp_session_id == other.mcp_session_id
            && self.issuer == other.issuer
    }
}

/// Arguments to [`SessionStore::store_session`].
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_email: String,
    pub credentials: CredentialRecord,
    pub session_id: Option<String>,
    pub mcp_session_id: Option<String>,
    pub issuer: Option<String>,
}

impl NewSession {
    pub fn new(user_email: impl Into<String>, credentials: CredentialRecord) -> Self {
        Self {
            user_email: user_email.into(),
            credentials,
            session_id: None,
            mcp_session_id: None,
            issuer: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_mcp_session_id(mut self, mcp_session_id: impl Into<String>) -> Self {
        self.mcp_session_id = Some(mcp_session_id.into());
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }
}

/// Secret-free view of a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub user_email: String,
    pub expiry: Option<DateTime<Utc>>,
    pub can_refresh: bool,
    pub mcp_session_id: Option<String>,
    pub issuer: Option<String>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub users: usize,
    pub mcp_bindings: usize,
    pub internal_sessions: usize,
}

#[derive(Default)]
struct SessionState {
    sessions: HashMap<String, StoredSession>,
    mcp_bindings: HashMap<String, String>,
    internal_sessions: HashMap<String, String>,
}

pub struct SessionStore {
    state: Mutex<SessionState>,
    recent_auth_window: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::seconds(120))
    }
}

impl SessionStore {
    pub fn new(recent_auth_window: Duration) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            recent_auth_window,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("session store lock poisoned: {}", e)))
    }

    /// Upserts the credential for `session.user_email` and any session bindings it names.
    /// Storing identical content again leaves the store unchanged.
    pub fn store_session(&self, session: NewSession) -> Result<(), StoreError> {
        let email = normalize_email(&session.user_email);
        if email.is_empty() {
            return Err(StoreError::InvalidKey(session.user_email));
        }
        let mut state = self.lock()?;

        let stored_at = match state.sessions.get(&email) {
            Some(existing) if existing.same_content(&session) => existing.stored_at,
            _ => Utc::now(),
        };

        if let Some(id) = &session.session_id {
            state.internal_sessions.insert(id.clone(), email.clone());
        }
        if let Some(id) = &session.mcp_session_id {
            if let Some(previous) = state.mcp_bindings.insert(id.clone(), email.clone()) {
                if previous != email {
                    info!(
                        mcp_session_id = %id,
                        previous = %previous,
                        user_email = %email,
                        "Rebinding MCP session to a different user"
                    );
                }
            }
        }

        state.sessions.insert(
            email.clone(),
            StoredSession {
                credentials: session.credentials,
                session_id: session.session_id,
                mcp_session_id: session.mcp_session_id,
                issuer: session.issuer,
                stored_at,
            },
        );
        debug!(user_email = %email, "Stored session");
        Ok(())
    }

    /// Returns the credential for `requested_user_email` only when the caller is shown to own it:
    /// the request-level auth token names that user, or the external `session_id` is bound to that user, or
    /// `allow_recent_auth` is set and the credential was stored within the recency window.
    pub fn get_credentials_with_validation(
        &self,
        requested_user_email: &str,
        session_id: Option<&str>,
        auth_token_email: Option<&str>,
        allow_recent_auth: bool,
    ) -> Option<CredentialRecord> {
        let requested = normalize_email(requested_user_email);
        let state = self.lock().ok()?;
        let entry = state.sessions.get(&requested)?;

        if let Some(token_email) = auth_token_email {
            let token_email = normalize_email(token_email);
            if token_email == requested {
                debug!(user_email = %requested, "Credential access granted by auth token");
                return Some(entry.credentials.clone());
            }
            warn!(
                requested = %requested,
                authenticated_as = %token_email,
                "Denied cross-account credential access"
            );
            return None;
        }

        if let Some(sid) = session_id {
            if let Some(bound) = state.mcp_bindings.get(sid) {
                if *bound == requested {
                    debug!(user_email = %requested, session_id = %sid, "Credential access granted by session binding");
                    return Some(entry.credentials.clone());
                }
                warn!(
                    requested = %requested,
                    bound_to = %bound,
                    session_id = %sid,
                    "Denied cross-account credential access"
                );
                return None;
            }
        }

        if allow_recent_auth && Utc::now() - entry.stored_at < self.recent_auth_window {
            info!(user_email = %requested, "Credential access granted by recent authentication");
            return Some(entry.credentials.clone());
        }

        debug!(user_email = %requested, "No binding proves ownership of this credential");
        None
    }

    pub fn get_credentials_by_mcp_session(&self, mcp_session_id: &str) -> Option<CredentialRecord> {
        let state = self.lock().ok()?;
        let email = state.mcp_bindings.get(mcp_session_id)?;
        state.sessions.get(email).map(|s| s.credentials.clone())
    }

    pub fn get_user_by_mcp_session(&self, mcp_session_id: &str) -> Option<String> {
        let state = self.lock().ok()?;
        let email = state.mcp_bindings.get(mcp_session_id)?;
        state.sessions.contains_key(email).then(|| email.clone())
    }

    pub fn session_summary(&self, user_email: &str) -> Option<SessionSummary> {
        let email = normalize_email(user_email);
        let state = self.lock().ok()?;
        state.sessions.get(&email).map(|s| SessionSummary {
            user_email: email.clone(),
            expiry: s.credentials.expiry,
            can_refresh: s.credentials.can_refresh(),
            mcp_session_id: s.mcp_session_id.clone(),
            issuer: s.issuer.clone(),
            stored_at: s.stored_at,
        })
    }

    /// Replaces the credential after a token refresh and runs `persist` in the same
    /// critical section. Returns `false` without persisting if the user has logged out.
    pub fn commit_refresh<F>(
        &self,
        user_email: &str,
        credentials: CredentialRecord,
        persist: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(&CredentialRecord) -> Result<(), StoreError>,
    {
        let email = normalize_email(user_email);
        let mut state = self.lock()?;
        let Some(entry) = state.sessions.get_mut(&email) else {
            debug!(user_email = %email, "Dropping refreshed credential for a user no longer signed in");
            return Ok(false);
        };
        entry.credentials = credentials;
        if let Err(e) = persist(&entry.credentials) {
            warn!(user_email = %email, "Refreshed credential not persisted: {}", e);
        }
        Ok(true)
    }

    /// Removes the user's credential and every binding that points at the user, then
    /// runs `purge` before the lock is released.
    pub fn logout<F>(&self, user_email: &str, purge: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&str) -> Result<bool, StoreError>,
    {
        let email = normalize_email(user_email);
        let mut state = self.lock()?;
        let had_session = state.sessions.remove(&email).is_some();
        let bindings_before = state.mcp_bindings.len() + state.internal_sessions.len();
        state.mcp_bindings.retain(|_, owner| *owner != email);
        state.internal_sessions.retain(|_, owner| *owner != email);
        let removed_bindings =
            bindings_before - (state.mcp_bindings.len() + state.internal_sessions.len());
        let purged = purge(&email)?;
        info!(
            user_email = %email,
            removed_bindings,
            purged,
            "Logged out"
        );
        Ok(had_session || removed_bindings > 0 || purged)
    }

    pub fn has_session(&self, user_email: &str) -> bool {
        self.lock()
            .map(|s| s.sessions.contains_key(&normalize_email(user_email)))
            .unwrap_or(false)
    }

    pub fn active_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .lock()
            .map(|s| s.sessions.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn stats(&self) -> SessionStats {
        self.lock()
            .map(|s| SessionStats {
                users: s.sessions.len(),
                mcp_bindings: s.mcp_bindings.len(),
                internal_sessions: s.internal_sessions.len(),
            })
            .unwrap_or(SessionStats {
                users: 0,
                mcp_bindings: 0,
                internal_sessions: 0,
            })
    }
}

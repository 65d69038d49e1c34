//! OAuth `state` values for pending authorizations.
//!
//! A state is single-use and short-lived. It carries the external session id
//! that started the flow so the callback can bind that session to the identity
//! the provider returns.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::credentials::bounded_seconds;

#[derive(Clone, Debug)]
pub struct PendingAuth {
    pub login_hint: Option<String>,
    pub mcp_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OAuthStateManager {
    states: Arc<Mutex<HashMap<String, PendingAuth>>>,
    expiry_duration: Duration,
}

impl OAuthStateManager {
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: bounded_seconds(expiry_seconds),
        }
    }

    /// Generates and records a new state token (UUID v4).
    pub fn create_state(&self, login_hint: Option<&str>, mcp_session_id: Option<&str>) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = PendingAuth {
            login_hint: login_hint.map(str::to_string),
            mcp_session_id: mcp_session_id.map(str::to_string),
            created_at: Utc::now(),
        };

        if let Ok(mut states) = self.states.lock() {
            let now = entry.created_at;
            states.retain(|_, e| now - e.created_at <= self.expiry_duration);
            states.insert(state.clone(), entry);
        }

        state
    }

    /// Removes the state and returns its entry if it had not expired.
    pub fn validate_and_consume(&self, state: &str) -> Option<PendingAuth> {
        let entry = self.states.lock().ok()?.remove(state)?;
        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }
        Some(entry)
    }

    /// True while an unexpired authorization for `login_hint`, started by
    /// `mcp_session_id`, is outstanding. Sessions never see each other's sign-ins.
    pub fn is_pending_for(&self, login_hint: &str, mcp_session_id: Option<&str>) -> bool {
        let Some(session) = mcp_session_id else {
            return false;
        };
        let now = Utc::now();
        self.states
            .lock()
            .map(|states| {
                states.values().any(|e| {
                    now - e.created_at <= self.expiry_duration
                        && e.mcp_session_id.as_deref() == Some(session)
                        && e.login_hint
                            .as_deref()
                            .is_some_and(|h| h.eq_ignore_ascii_case(login_hint))
                })
            })
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.states.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate_state() {
        let manager = OAuthStateManager::new(600);
        let state = manager.create_state(Some("alice@example.com"), Some("stdio-1"));
        assert!(!state.is_empty());
        assert!(manager.is_pending_for("ALICE@example.com", Some("stdio-1")));

        let entry = manager.validate_and_consume(&state).unwrap();
        assert_eq!(entry.login_hint.as_deref(), Some("alice@example.com"));
        assert_eq!(entry.mcp_session_id.as_deref(), Some("stdio-1"));
        assert!(!manager.is_pending_for("alice@example.com", Some("stdio-1")));
    }

    #[test]
    fn test_pending_sign_in_visible_only_to_its_session() {
        let manager = OAuthStateManager::new(600);
        manager.create_state(Some("bob@example.com"), Some("mcp-bob"));
        assert!(manager.is_pending_for("bob@example.com", Some("mcp-bob")));
        assert!(!manager.is_pending_for("bob@example.com", Some("mcp-other")));
        assert!(!manager.is_pending_for("bob@example.com", None));
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let manager = OAuthStateManager::new(i64::MAX);
        let state = manager.create_state(None, None);
        assert!(manager.validate_and_consume(&state).is_some());
    }

    #[test]
    fn test_state_is_single_use() {
        let manager = OAuthStateManager::new(600);
        let state = manager.create_state(None, None);
        assert!(manager.validate_and_consume(&state).is_some());
        assert!(manager.validate_and_consume(&state).is_none());
    }

    #[test]
    fn test_invalid_state_rejected() {
        let manager = OAuthStateManager::new(600);
        assert!(manager.validate_and_consume("invalid_state").is_none());
    }

    #[test]
    fn test_expired_state_rejected() {
        let manager = OAuthStateManager::new(-1);
        let state = manager.create_state(Some("bob@example.com"), None);
        assert!(manager.validate_and_consume(&state).is_none());
        assert_eq!(manager.count(), 0);
    }
}

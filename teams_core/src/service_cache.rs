//! Reuses authenticated Graph clients across tool calls.
//!
//! Lookups happen only after the caller's ownership of the credential has been
//! validated; the cache never decides who may act as whom.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::debug;

use crate::credentials::normalize_email;
use crate::graph::GraphClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub user_email: String,
    pub service_type: String,
    pub scopes: BTreeSet<String>,
}

impl ServiceKey {
    pub fn new<I, S>(user_email: &str, service_type: &str, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_email: normalize_email(user_email),
            service_type: service_type.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }
}

struct CacheEntry {
    client: GraphClient,
    cached_at: DateTime<Utc>,
}

pub struct ServiceCache {
    entries: Mutex<HashMap<ServiceKey, CacheEntry>>,
    ttl: Duration,
}

impl ServiceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached client for `key`, if still fresh and built from `access_token`.
    pub fn get(&self, key: &ServiceKey, access_token: &str) -> Option<GraphClient> {
        self.get_at(key, access_token, Utc::now())
    }

    pub fn get_at(
        &self,
        key: &ServiceKey,
        access_token: &str,
        now: DateTime<Utc>,
    ) -> Option<GraphClient> {
        let mut entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        if now - entry.cached_at >= self.ttl {
            debug!(user_email = %key.user_email, service = %key.service_type, "Service cache entry expired");
            entries.remove(key);
            return None;
        }
        if entry.client.access_token() != access_token {
            // Token was refreshed since the client was built.
            entries.remove(key);
            return None;
        }
        Some(entry.client.clone())
    }

    pub fn insert(&self, key: ServiceKey, client: GraphClient) {
        self.insert_at(key, client, Utc::now());
    }

    pub fn insert_at(&self, key: ServiceKey, client: GraphClient, now: DateTime<Utc>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                CacheEntry {
                    client,
                    cached_at: now,
                },
            );
        }
    }

    /// Drops every entry belonging to `user_email`. Returns how many were removed.
    pub fn invalidate_user(&self, user_email: &str) -> usize {
        let email = normalize_email(user_email);
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|key, _| key.user_email != email);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

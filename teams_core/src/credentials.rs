use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Seconds shaved off `expires_in` so a token is refreshed slightly before the provider rejects it.
pub const EXPIRY_SKEW_SECS: i64 = 60;

/// Longest span taken from a token response or configuration: ten years.
pub const MAX_SPAN_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// `Duration::seconds` limited to `±MAX_SPAN_SECS`, so date arithmetic cannot overflow.
pub fn bounded_seconds(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(-MAX_SPAN_SECS, MAX_SPAN_SECS))
}

/// OAuth credential for one Microsoft identity, in the on-disk JSON shape.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(rename = "token", default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(rename = "token_uri", default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default, with = "scope_list")]
    pub scopes: BTreeSet<String>,
    #[serde(default, with = "expiry_format")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl CredentialRecord {
    /// True only when a token is present and `now` is strictly before expiry.
    /// A record without expiry is never valid.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let has_token = self
            .access_token
            .as_deref()
            .is_some_and(|t| !t.is_empty());
        has_token && !self.is_expired_at(now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => now >= expiry,
            None => true,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }

    /// Sets `expiry` from a provider `expires_in`, keeping a small safety margin.
    pub fn apply_expires_in(&mut self, expires_in: i64, now: DateTime<Utc>) {
        let secs = if expires_in > EXPIRY_SKEW_SECS {
            expires_in - EXPIRY_SKEW_SECS
        } else {
            expires_in.max(0)
        };
        self.expiry = Some(
            now.checked_add_signed(bounded_seconds(secs))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(v: &Option<String>) -> &'static str {
            if v.is_some() {
                "<redacted>"
            } else {
                "<none>"
            }
        }
        f.debug_struct("CredentialRecord")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Normalized key for an email address: trimmed and ASCII-lowercased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Parses an ISO-8601 timestamp. Offsets are honored; naive timestamps are read as UTC.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_expiry(expiry: &DateTime<Utc>) -> String {
    expiry.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

mod expiry_format {
    use super::{format_expiry, parse_expiry};
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&format_expiry(dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => parse_expiry(&s)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid expiry timestamp: {}", s))),
        }
    }
}

mod scope_list {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeSet;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawScopes {
        List(Vec<String>),
        Joined(String),
    }

    pub fn serialize<S>(value: &BTreeSet<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(value.iter())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<RawScopes>::deserialize(deserializer)?;
        Ok(match raw {
            None => BTreeSet::new(),
            Some(RawScopes::List(items)) => items.into_iter().filter(|s| !s.is_empty()).collect(),
            Some(RawScopes::Joined(s)) => s.split_whitespace().map(str::to_string).collect(),
        })
    }
}

//! OAuth token set types
//!
//! `oauth_data` is stored as a JSON object holding a `tokens` sub-object. Unknown
//! keys on either level are preserved so a rewrite never drops provider extras.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Token fields that are encrypted individually when persisted
pub const SENSITIVE_TOKEN_FIELDS: [&str; 2] = ["access_token", "refresh_token"];

/// Decrypted `oauth_data` object
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenSet>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for OAuthData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthData")
            .field("tokens", &self.tokens)
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Access/refresh token pair plus expiry metadata
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<ExpiresAt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

impl TokenSet {
    /// Normalized expiry of this token set
    pub fn expiry(&self) -> Expiry {
        match self.expires_at.as_ref() {
            None => Expiry::Absent,
            Some(raw) => raw
                .to_epoch_seconds()
                .map(Expiry::At)
                .unwrap_or(Expiry::Unparseable),
        }
    }

    /// Whether a non-empty refresh token is present
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Result of normalizing `expires_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Absent,
    At(i64),
    Unparseable,
}

/// Stored `expires_at`: epoch seconds or an ISO-8601 string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpiresAt {
    Epoch(i64),
    Fractional(f64),
    Text(String),
}

impl ExpiresAt {
    /// Convert to epoch seconds, if the stored value can be understood
    pub fn to_epoch_seconds(&self) -> Option<i64> {
        match self {
            ExpiresAt::Epoch(seconds) => Some(*seconds),
            ExpiresAt::Fractional(seconds) if seconds.is_finite() => Some(seconds.floor() as i64),
            ExpiresAt::Fractional(_) => None,
            ExpiresAt::Text(text) => parse_expiry_text(text.trim()),
        }
    }
}

impl From<DateTime<Utc>> for ExpiresAt {
    fn from(value: DateTime<Utc>) -> Self {
        ExpiresAt::Epoch(value.timestamp())
    }
}

fn parse_expiry_text(text: &str) -> Option<i64> {
    if let Ok(seconds) = text.parse::<i64>() {
        return Some(seconds);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp());
    }
    // ISO-8601 without an offset is taken as UTC
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc().timestamp())
}

/// Accepts a number or a numeric string (leaf decryption yields strings)
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| seconds_from_value(&v)))
}

/// Interpret a JSON value as a whole number of seconds
pub fn seconds_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

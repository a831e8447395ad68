//! Account model and credential helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upstream platform served by an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Anthropic-compatible upstream
    Anthropic,
    /// Gemini-native upstream
    Gemini,
    /// Composite upstream serving both Claude and Gemini models
    Antigravity,
}

impl Platform {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Antigravity => "antigravity",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the account authenticates against its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Oauth,
    ApiKey,
    SetupToken,
    /// Relays through another gateway; vends `api_key` directly, no OAuth.
    Upstream,
}

/// Account lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Error,
    Disabled,
}

/// An upstream identity able to answer requests.
///
/// `credentials` is an open-ended map: recognised keys (`access_token`,
/// `refresh_token`, `expires_at`, `project_id`, `model_mapping`,
/// `model_whitelist`, `intercept_warmup_requests`) are read through the
/// typed helpers below; unrecognised keys are preserved across token
/// refresh merges so operator-injected metadata survives rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    #[serde(rename = "type")]
    pub credential_kind: CredentialKind,
    #[serde(default)]
    pub credentials: Map<String, Value>,
    /// Lower numeric value = preferred.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: i32,
    pub status: AccountStatus,
    #[serde(default = "default_true")]
    pub schedulable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Per-model rate-limit entries and per-scope quota entries.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

fn default_max_concurrency() -> i32 {
    5
}

const fn default_true() -> bool {
    true
}

impl Account {
    /// Read a string credential, treating empty strings as absent.
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
    }

    /// Read an RFC3339 timestamp credential.
    pub fn credential_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.credential(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn credential_bool(&self, key: &str) -> bool {
        self.credentials.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub const fn is_oauth(&self) -> bool {
        matches!(self.credential_kind, CredentialKind::Oauth)
    }

    pub const fn is_schedulable(&self) -> bool {
        matches!(self.status, AccountStatus::Active) && self.schedulable
    }

    fn model_mapping(&self) -> Option<&Map<String, Value>> {
        self.credentials.get("model_mapping").and_then(Value::as_object)
    }

    /// Resolve the model id actually sent upstream.
    ///
    /// Exact `model_mapping` entries win over `*`-suffix glob entries;
    /// without a matching entry the requested id passes through.
    pub fn mapped_model(&self, requested: &str) -> String {
        let Some(mapping) = self.model_mapping() else {
            return requested.to_string();
        };
        if let Some(served) = mapping.get(requested).and_then(Value::as_str) {
            return served.to_string();
        }
        for (pattern, served) in mapping {
            if glob_match(pattern, requested) {
                if let Some(served) = served.as_str() {
                    return served.to_string();
                }
            }
        }
        requested.to_string()
    }

    /// Whether this account can serve the requested model.
    ///
    /// `model_whitelist` globs take precedence; otherwise `model_mapping`
    /// keys act as the whitelist; otherwise the platform's native model
    /// prefixes are admitted. The empty model is always allowed.
    pub fn is_model_supported(&self, requested: &str) -> bool {
        if requested.is_empty() {
            return true;
        }
        if let Some(patterns) = self.credentials.get("model_whitelist").and_then(Value::as_array) {
            return patterns
                .iter()
                .filter_map(Value::as_str)
                .any(|pattern| glob_match(pattern, requested));
        }
        if let Some(mapping) = self.model_mapping() {
            return mapping.keys().any(|pattern| glob_match(pattern, requested));
        }
        match self.platform {
            Platform::Anthropic => requested.starts_with("claude-"),
            Platform::Gemini => requested.starts_with("gemini-"),
            Platform::Antigravity => {
                requested.starts_with("claude-") || requested.starts_with("gemini-")
            },
        }
    }

    pub fn touch_last_used(&mut self) {
        self.last_used_at = Some(Utc::now());
    }
}

/// `*`-suffix glob match used by model mappings and whitelists.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => candidate.starts_with(prefix),
        None => pattern == candidate,
    }
}

//! Rate-limit gating on accounts.
//!
//! Two independent domains are checked before an account is admitted as
//! a scheduling candidate: per-model reset windows stored under
//! `extra.model_rate_limits`, and per-quota-scope windows (Antigravity
//! only) stored under `extra.antigravity_quota_scopes`.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::account::{Account, Platform};

const MODEL_RATE_LIMITS_KEY: &str = "model_rate_limits";
const QUOTA_SCOPES_KEY: &str = "antigravity_quota_scopes";
const RESET_AT_KEY: &str = "rate_limit_reset_at";

const SCOPE_CLAUDE_SONNET: &str = "claude_sonnet";
const SCOPE_CLAUDE_OPUS: &str = "claude_opus";
const SCOPE_CLAUDE_HAIKU: &str = "claude_haiku";
const SCOPE_GEMINI_FLASH: &str = "gemini_flash";
const SCOPE_GEMINI_PRO: &str = "gemini_pro";

/// Coarse upstream billing bucket, independent of per-model limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Claude,
    GeminiText,
    GeminiImage,
}

impl QuotaScope {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::GeminiText => "gemini_text",
            Self::GeminiImage => "gemini_image",
        }
    }
}

fn normalize_model_name(model: &str) -> String {
    let normalized = model.trim().to_ascii_lowercase();
    normalized.strip_prefix("models/").map(str::to_string).unwrap_or(normalized)
}

/// Map a requested model name to its legacy rate-limit scope.
///
/// Server-returned ids (`claude-sonnet-4-5`) and client aliases
/// (`claude-3-5-sonnet`) share a scope keyed on the model family, not
/// the version.
pub fn resolve_model_rate_limit_scope(requested: &str) -> Option<&'static str> {
    let model = normalize_model_name(requested);
    if model.is_empty() {
        return None;
    }
    if model.contains("sonnet") {
        return Some(SCOPE_CLAUDE_SONNET);
    }
    if model.contains("opus") {
        return Some(SCOPE_CLAUDE_OPUS);
    }
    if model.contains("haiku") {
        return Some(SCOPE_CLAUDE_HAIKU);
    }
    if model.contains("flash") {
        return Some(SCOPE_GEMINI_FLASH);
    }
    if model.starts_with("gemini") && model.contains("pro") {
        return Some(SCOPE_GEMINI_PRO);
    }
    None
}

/// Resolve the Antigravity quota scope for a model. Unknown models fall
/// through ungated.
pub fn resolve_quota_scope(requested: &str) -> Option<QuotaScope> {
    let model = normalize_model_name(requested);
    if model.starts_with("claude-") {
        return Some(QuotaScope::Claude);
    }
    if model.starts_with("gemini-") {
        if model.contains("image") {
            return Some(QuotaScope::GeminiImage);
        }
        return Some(QuotaScope::GeminiText);
    }
    None
}

/// Check a group's supported-scope list. An empty list supports all.
pub fn is_scope_supported(supported_scopes: &[String], scope: QuotaScope) -> bool {
    supported_scopes.is_empty() || supported_scopes.iter().any(|s| s == scope.as_str())
}

fn reset_at_from_entry(entry: &Value) -> Option<DateTime<Utc>> {
    let raw = entry.get(RESET_AT_KEY)?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

impl Account {
    fn model_rate_limit_reset_at(&self, scope: &str) -> Option<DateTime<Utc>> {
        if scope.is_empty() {
            return None;
        }
        let limits = self.extra.get(MODEL_RATE_LIMITS_KEY)?.as_object()?;
        reset_at_from_entry(limits.get(scope)?)
    }

    fn quota_scope_reset_at(&self, scope: QuotaScope) -> Option<DateTime<Utc>> {
        let scopes = self.extra.get(QUOTA_SCOPES_KEY)?.as_object()?;
        reset_at_from_entry(scopes.get(scope.as_str())?)
    }

    /// Per-model gate: the mapped model id is checked first, then the
    /// legacy scope key for data written before per-model entries.
    pub fn is_model_rate_limited(&self, requested: &str) -> bool {
        let now = Utc::now();
        let mapped = self.mapped_model(requested);
        if self.model_rate_limit_reset_at(&mapped).is_some_and(|at| at > now) {
            return true;
        }
        if let Some(scope) = resolve_model_rate_limit_scope(requested) {
            if self.model_rate_limit_reset_at(scope).is_some_and(|at| at > now) {
                return true;
            }
        }
        false
    }

    /// Quota-scope gate, Antigravity accounts only.
    pub fn is_quota_scope_limited(&self, requested: &str) -> bool {
        if self.platform != Platform::Antigravity {
            return false;
        }
        let Some(scope) = resolve_quota_scope(requested) else {
            return false;
        };
        self.quota_scope_reset_at(scope).is_some_and(|at| at > Utc::now())
    }

    /// The larger of the two remaining windows, never negative.
    pub fn rate_limit_remaining(&self, requested: &str) -> Duration {
        let now = Utc::now();
        let mut remaining = Duration::zero();

        let mapped = self.mapped_model(requested);
        for reset_at in [
            self.model_rate_limit_reset_at(&mapped),
            resolve_model_rate_limit_scope(requested)
                .and_then(|scope| self.model_rate_limit_reset_at(scope)),
            resolve_quota_scope(requested)
                .filter(|_| self.platform == Platform::Antigravity)
                .and_then(|scope| self.quota_scope_reset_at(scope)),
        ]
        .into_iter()
        .flatten()
        {
            remaining = remaining.max(reset_at - now);
        }
        remaining.max(Duration::zero())
    }

    /// Candidate admission: active, schedulable, and not gated for the
    /// requested model in either rate-limit domain.
    pub fn is_schedulable_for_model(&self, requested: &str) -> bool {
        self.is_schedulable()
            && !self.is_model_rate_limited(requested)
            && !self.is_quota_scope_limited(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::{AccountStatus, CredentialKind};
    use serde_json::{json, Map};

    fn account_with_extra(platform: Platform, extra: Value) -> Account {
        Account {
            id: 1,
            name: "acc".into(),
            platform,
            credential_kind: CredentialKind::Oauth,
            credentials: Map::new(),
            priority: 1,
            max_concurrency: 5,
            status: AccountStatus::Active,
            schedulable: true,
            last_used_at: None,
            extra: extra.as_object().cloned().unwrap_or_default(),
        }
    }

    fn future() -> String {
        (Utc::now() + Duration::minutes(10)).to_rfc3339()
    }

    fn past() -> String {
        (Utc::now() - Duration::minutes(10)).to_rfc3339()
    }

    #[test]
    fn scope_resolution_by_model_family() {
        assert_eq!(resolve_model_rate_limit_scope("claude-3-5-sonnet"), Some("claude_sonnet"));
        assert_eq!(resolve_model_rate_limit_scope("claude-sonnet-4-5"), Some("claude_sonnet"));
        assert_eq!(resolve_model_rate_limit_scope("claude-opus-4-5"), Some("claude_opus"));
        assert_eq!(resolve_model_rate_limit_scope("models/gemini-2.5-flash"), Some("gemini_flash"));
        assert_eq!(resolve_model_rate_limit_scope("gemini-3-pro-high"), Some("gemini_pro"));
        assert_eq!(resolve_model_rate_limit_scope("gpt-4"), None);
        assert_eq!(resolve_model_rate_limit_scope(""), None);
    }

    #[test]
    fn per_model_entry_gates_until_reset() {
        let account = account_with_extra(
            Platform::Antigravity,
            json!({"model_rate_limits": {"claude-sonnet-4-5": {"rate_limit_reset_at": future()}}}),
        );
        assert!(account.is_model_rate_limited("claude-sonnet-4-5"));

        let expired = account_with_extra(
            Platform::Antigravity,
            json!({"model_rate_limits": {"claude-sonnet-4-5": {"rate_limit_reset_at": past()}}}),
        );
        assert!(!expired.is_model_rate_limited("claude-sonnet-4-5"));
    }

    #[test]
    fn legacy_scope_entry_gates_aliases() {
        let account = account_with_extra(
            Platform::Antigravity,
            json!({"model_rate_limits": {"claude_sonnet": {"rate_limit_reset_at": future()}}}),
        );
        // A different sonnet alias still resolves to the shared scope.
        assert!(account.is_model_rate_limited("claude-3-5-sonnet-20241022"));
        assert!(!account.is_model_rate_limited("claude-opus-4-5"));
    }

    #[test]
    fn quota_scope_gates_antigravity_only() {
        let extra =
            json!({"antigravity_quota_scopes": {"claude": {"rate_limit_reset_at": future()}}});
        let ag = account_with_extra(Platform::Antigravity, extra.clone());
        assert!(ag.is_quota_scope_limited("claude-sonnet-4-5"));
        assert!(!ag.is_quota_scope_limited("gemini-2.5-pro"));

        let anthropic = account_with_extra(Platform::Anthropic, extra);
        assert!(!anthropic.is_quota_scope_limited("claude-sonnet-4-5"));
    }

    #[test]
    fn image_models_resolve_to_image_scope() {
        assert_eq!(resolve_quota_scope("gemini-3-pro-image"), Some(QuotaScope::GeminiImage));
        assert_eq!(resolve_quota_scope("gemini-2.5-flash"), Some(QuotaScope::GeminiText));
        assert_eq!(resolve_quota_scope("claude-opus-4-5"), Some(QuotaScope::Claude));
        assert_eq!(resolve_quota_scope("gpt-4"), None);
    }

    #[test]
    fn remaining_takes_larger_window() {
        let near = (Utc::now() + Duration::minutes(5)).to_rfc3339();
        let far = (Utc::now() + Duration::minutes(30)).to_rfc3339();
        let account = account_with_extra(
            Platform::Antigravity,
            json!({
                "model_rate_limits": {"claude-sonnet-4-5": {"rate_limit_reset_at": near}},
                "antigravity_quota_scopes": {"claude": {"rate_limit_reset_at": far}},
            }),
        );
        let remaining = account.rate_limit_remaining("claude-sonnet-4-5");
        assert!(remaining > Duration::minutes(29));
        assert!(remaining <= Duration::minutes(30));
    }

    #[test]
    fn remaining_never_negative() {
        let account = account_with_extra(
            Platform::Antigravity,
            json!({"model_rate_limits": {"claude-sonnet-4-5": {"rate_limit_reset_at": past()}}}),
        );
        assert_eq!(account.rate_limit_remaining("claude-sonnet-4-5"), Duration::zero());
    }

    #[test]
    fn empty_supported_scopes_allows_all() {
        assert!(is_scope_supported(&[], QuotaScope::Claude));
        assert!(is_scope_supported(&["claude".into()], QuotaScope::Claude));
        assert!(!is_scope_supported(&["gemini_text".into()], QuotaScope::Claude));
    }
}

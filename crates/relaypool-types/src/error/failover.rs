//! Upstream failure shapes consumed by the failover engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the failover engine should do about an upstream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverErrorKind {
    /// Transient; retry on the same account first (408, 425, flagged
    /// partial-body aborts).
    RetrySameAccount,
    /// Transient; switch to another account (500/502/504, transport).
    SwitchAccount,
    /// Switch and record the reset window (429).
    RateLimit,
    /// Switch; feeds the 503 selection-exhausted backoff path.
    Overload,
    /// Account becomes Error and leaves rotation (401/403).
    Auth,
    /// Client fault; surfaced as-is, no retry.
    Client,
}

/// Classify an upstream HTTP status into a failover action class.
///
/// 404 switches accounts: the model may simply not exist on the chosen
/// identity.
pub fn classify_status(status: u16) -> FailoverErrorKind {
    match status {
        408 | 425 => FailoverErrorKind::RetrySameAccount,
        429 => FailoverErrorKind::RateLimit,
        503 | 529 => FailoverErrorKind::Overload,
        401 | 403 => FailoverErrorKind::Auth,
        404 => FailoverErrorKind::SwitchAccount,
        400..=499 => FailoverErrorKind::Client,
        _ => FailoverErrorKind::SwitchAccount,
    }
}

/// A recoverable upstream failure, carried across failover iterations.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("upstream error {status_code}")]
pub struct UpstreamFailoverError {
    pub status_code: u16,
    pub retryable_on_same_account: bool,
    /// Upstream explicitly flagged this failure for cache-read billing.
    pub force_cache_billing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_excerpt: Option<String>,
}

impl UpstreamFailoverError {
    pub fn from_status(status_code: u16) -> Self {
        Self {
            status_code,
            retryable_on_same_account: classify_status(status_code)
                == FailoverErrorKind::RetrySameAccount,
            force_cache_billing: false,
            request_id: None,
            body_excerpt: None,
        }
    }

    pub fn kind(&self) -> FailoverErrorKind {
        if self.retryable_on_same_account {
            FailoverErrorKind::RetrySameAccount
        } else {
            classify_status(self.status_code)
        }
    }

    pub fn with_body_excerpt(mut self, body: &str) -> Self {
        const EXCERPT_LIMIT: usize = 512;
        let mut excerpt = body.trim().to_string();
        if excerpt.len() > EXCERPT_LIMIT {
            excerpt.truncate(EXCERPT_LIMIT);
        }
        if !excerpt.is_empty() {
            self.body_excerpt = Some(excerpt);
        }
        self
    }
}

/// Fatal to the request: the prompt does not fit the upstream context.
#[derive(Debug, Clone, Error)]
#[error("prompt is too long (upstream {status_code})")]
pub struct PromptTooLongError {
    pub status_code: u16,
    pub request_id: Option<String>,
    pub body: String,
}

/// Whether an upstream error body is the well-known prompt-length
/// rejection.
pub fn is_prompt_too_long_body(body: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return false;
    };
    let message = value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(serde_json::Value::as_str);
    message.is_some_and(|m| m.contains("Prompt is too long"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(408), FailoverErrorKind::RetrySameAccount);
        assert_eq!(classify_status(425), FailoverErrorKind::RetrySameAccount);
        assert_eq!(classify_status(429), FailoverErrorKind::RateLimit);
        assert_eq!(classify_status(503), FailoverErrorKind::Overload);
        assert_eq!(classify_status(529), FailoverErrorKind::Overload);
        assert_eq!(classify_status(401), FailoverErrorKind::Auth);
        assert_eq!(classify_status(403), FailoverErrorKind::Auth);
        assert_eq!(classify_status(500), FailoverErrorKind::SwitchAccount);
        assert_eq!(classify_status(502), FailoverErrorKind::SwitchAccount);
        assert_eq!(classify_status(504), FailoverErrorKind::SwitchAccount);
        assert_eq!(classify_status(404), FailoverErrorKind::SwitchAccount);
        assert_eq!(classify_status(400), FailoverErrorKind::Client);
        assert_eq!(classify_status(422), FailoverErrorKind::Client);
    }

    #[test]
    fn prompt_too_long_detection() {
        assert!(is_prompt_too_long_body(br#"{"error":{"message":"Prompt is too long"}}"#));
        assert!(is_prompt_too_long_body(br#"{"message":"Prompt is too long"}"#));
        assert!(!is_prompt_too_long_body(br#"{"error":{"message":"other"}}"#));
        assert!(!is_prompt_too_long_body(b"not json"));
    }

    #[test]
    fn body_excerpt_is_bounded() {
        let err =
            UpstreamFailoverError::from_status(500).with_body_excerpt(&"x".repeat(2048));
        assert_eq!(err.body_excerpt.unwrap().len(), 512);
    }
}

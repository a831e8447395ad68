//! Gateway-level errors and the client-facing error surface.

use thiserror::Error;

use super::failover::{PromptTooLongError, UpstreamFailoverError};

/// Map a final upstream status to the (status, error type) pair surfaced
/// to clients.
///
/// 429 passes through as `rate_limit_error`; 529 becomes
/// `overloaded_error` behind a 503; everything else is an opaque
/// `upstream_error` behind a 502.
pub fn map_upstream_error(status_code: u16) -> (u16, &'static str) {
    match status_code {
        429 => (429, "rate_limit_error"),
        529 => (503, "overloaded_error"),
        _ => (502, "upstream_error"),
    }
}

/// Errors surfaced by the dispatch orchestrator.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Failover budget spent; carries the last upstream error.
    #[error("all account switches exhausted")]
    Exhausted(Option<UpstreamFailoverError>),

    /// The scheduler found no admissible account at all.
    #[error("no available accounts: {reason}")]
    NoAvailableAccounts { reason: String },

    #[error(transparent)]
    PromptTooLong(#[from] PromptTooLongError),

    /// Upstream rejected the request as a client fault; surfaced as-is
    /// with the upstream status and body, never retried.
    #[error("upstream client error {status}")]
    UpstreamClient { status: u16, body: String },

    /// The request's cancellation signal fired; no response body.
    #[error("request canceled")]
    Canceled,

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("credential error for account {account_id}: {message}")]
    Credential { account_id: i64, message: String },

    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    /// HTTP status and error type for the client-facing envelope.
    pub fn surface(&self) -> (u16, &'static str) {
        match self {
            Self::Exhausted(Some(err)) => map_upstream_error(err.status_code),
            Self::Exhausted(None) => (502, "upstream_error"),
            Self::NoAvailableAccounts { .. } => (503, "overloaded_error"),
            Self::PromptTooLong(_) => (400, "invalid_request_error"),
            Self::UpstreamClient { status, .. } => (*status, "invalid_request_error"),
            Self::Canceled => (499, "request_canceled"),
            Self::InvalidRequest { .. } => (400, "invalid_request_error"),
            Self::Credential { .. } | Self::Store(_) => (502, "upstream_error"),
        }
    }

    /// JSON error envelope shared by plain and in-band SSE surfaces.
    pub fn envelope(&self) -> serde_json::Value {
        let (_, error_type) = self.surface();
        serde_json::json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
            }
        })
    }
}

//! Ephemeral load shapes read back from the shared store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-account load snapshot used by the layered scheduler.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountLoadInfo {
    pub current_concurrency: i32,
    /// Percentage derived from current/max concurrency.
    pub load_rate: i32,
    pub waiting_count: i32,
}

/// Per-(account, model) counters used by the load-balance scheduler.
///
/// `call_count` increases monotonically within a 24-hour TTL window and
/// resets when the key expires. A missing entry means the account has
/// never served the model in the current window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelLoadInfo {
    pub call_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

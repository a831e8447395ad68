//! Group model: a named pool of accounts sharing a scheduling policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::Platform;

/// How a group's scheduler picks among candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePolicy {
    /// Priority, then load rate, then LRU.
    #[default]
    Layered,
    /// Concurrency, then effective call count (cold accounts inherit the
    /// mean), then model LRU, then random.
    LoadBalance,
    /// Weighted proportional dispatch on call_count / priority weight.
    PriorityWeight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    #[serde(default)]
    pub policy: SchedulePolicy,
    #[serde(default)]
    pub prefer_oauth: bool,
    /// Quota scopes this group serves; empty means all.
    #[serde(default)]
    pub supported_scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

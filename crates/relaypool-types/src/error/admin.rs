//! Admin-surface errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when an account's proposed group set would mix incompatible
/// platforms (e.g. an Antigravity account joining an Anthropic group).
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("mixed channel in group {group_id} ({group_name}): {current_platform} vs {other_platform}")]
pub struct MixedChannelError {
    pub group_id: i64,
    pub group_name: String,
    pub current_platform: String,
    pub other_platform: String,
}

//! Admin-side validation: the mixed-channel check.
//!
//! An account joining a group whose declared platform differs from its
//! own, while other accounts already live there, silently changes
//! which upstream family answers that group's traffic. The check
//! surfaces this before the admin commits.

use std::sync::Arc;

use relaypool_types::{MixedChannelError, Platform};

use crate::repo::{AccountRepository, GroupRepository, RepoError};

fn display_platform(platform: Platform) -> &'static str {
    match platform {
        Platform::Anthropic => "Anthropic",
        Platform::Gemini => "Gemini",
        Platform::Antigravity => "Antigravity",
    }
}

pub struct MixedChannelChecker {
    accounts: Arc<dyn AccountRepository>,
    groups: Arc<dyn GroupRepository>,
}

impl MixedChannelChecker {
    pub fn new(accounts: Arc<dyn AccountRepository>, groups: Arc<dyn GroupRepository>) -> Self {
        Self { accounts, groups }
    }

    /// Validate a proposed (platform, group set) assignment.
    /// `account_id` excludes the account being edited from the
    /// occupancy check.
    pub async fn check(
        &self,
        platform: Platform,
        group_ids: &[i64],
        account_id: Option<i64>,
    ) -> Result<Result<(), MixedChannelError>, RepoError> {
        for &group_id in group_ids {
            let Some(group) = self.groups.get_by_id(group_id).await? else {
                continue;
            };
            if group.platform == platform {
                continue;
            }
            let occupied = self
                .accounts
                .list_by_groups(&[group_id])
                .await?
                .iter()
                .any(|existing| Some(existing.id) != account_id);
            if occupied {
                return Ok(Err(MixedChannelError {
                    group_id,
                    group_name: group.name,
                    current_platform: display_platform(platform).to_string(),
                    other_platform: display_platform(group.platform).to_string(),
                }));
            }
        }
        Ok(Ok(()))
    }
}

//! Account scheduler.
//!
//! Two families of selection: the layered filter (priority → load rate →
//! LRU) and the load-balance filter (concurrency → effective call count
//! → model LRU → random). A priority-weight ratio variant is available
//! as a third policy; it is never swapped in implicitly.

mod layered;
mod load_balance;
mod weighted;

pub use layered::{filter_by_min_load_rate, filter_by_min_priority, select_by_lru};
pub use load_balance::{
    filter_by_min_call_count, filter_by_min_concurrency, filter_by_min_last_used,
    random_select_with_oauth_preference, select_by_load_balance,
};
pub use weighted::select_by_priority_weight;

use std::collections::{HashMap, HashSet};

use relaypool_types::models::rate_limit::{is_scope_supported, resolve_quota_scope};
use relaypool_types::{Account, AccountLoadInfo, Group, ModelLoadInfo, Platform, SchedulePolicy};

/// A candidate paired with its ephemeral load snapshot.
#[derive(Debug, Clone)]
pub struct AccountWithLoad {
    pub account: Account,
    pub load: AccountLoadInfo,
}

/// Per-request inputs the scheduler needs besides the candidates.
pub struct SelectionContext<'a> {
    pub group: &'a Group,
    pub model: &'a str,
    pub failed_account_ids: &'a HashSet<i64>,
    /// Restrict candidates to one platform: set by the forced-platform
    /// ingress routes and by the Antigravity extra-retry phase.
    pub platform_filter: Option<Platform>,
    pub model_load_map: Option<&'a HashMap<i64, ModelLoadInfo>>,
}

/// Admission check applied to every account before policy selection.
///
/// Checks, in order: failed set, platform restriction, schedulability
/// (status + both rate-limit domains), model support, and the group's
/// supported quota scopes.
pub fn is_candidate_eligible(account: &Account, ctx: &SelectionContext<'_>) -> bool {
    if ctx.failed_account_ids.contains(&account.id) {
        return false;
    }
    if ctx.platform_filter.is_some_and(|platform| account.platform != platform) {
        return false;
    }
    if !account.is_schedulable_for_model(ctx.model) {
        return false;
    }
    if !account.is_model_supported(ctx.model) {
        return false;
    }
    if let Some(scope) = resolve_quota_scope(ctx.model) {
        if !is_scope_supported(&ctx.group.supported_scopes, scope) {
            return false;
        }
    }
    true
}

/// Pick one account from the pool, or `None` when no candidate remains.
/// Never fabricates: the result is always an element of `pool`.
pub fn select_account(pool: &[AccountWithLoad], ctx: &SelectionContext<'_>) -> Option<Account> {
    let candidates: Vec<AccountWithLoad> = pool
        .iter()
        .filter(|entry| is_candidate_eligible(&entry.account, ctx))
        .cloned()
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let prefer_oauth = ctx.group.prefer_oauth;
    let selected = match ctx.group.policy {
        SchedulePolicy::Layered => {
            let step1 = filter_by_min_priority(candidates);
            let step2 = filter_by_min_load_rate(step1);
            select_by_lru(step2, prefer_oauth)
        },
        SchedulePolicy::LoadBalance => {
            select_by_load_balance(candidates, ctx.model_load_map, prefer_oauth)
        },
        SchedulePolicy::PriorityWeight => {
            select_by_priority_weight(candidates, ctx.model_load_map, prefer_oauth)
        },
    };

    selected.map(|entry| {
        tracing::debug!(
            account_id = entry.account.id,
            account = %entry.account.name,
            policy = ?ctx.group.policy,
            model = ctx.model,
            "scheduler selected account"
        );
        entry.account
    })
}


#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use chrono::{Duration, Utc};
    use relaypool_types::{CredentialKind, SchedulePolicy};
    use serde_json::json;

    use super::test_support::{account, entry, entry_used, group, with_load};
    use super::*;

    fn ctx<'a>(
        group: &'a Group,
        model: &'a str,
        failed: &'a HashSet<i64>,
    ) -> SelectionContext<'a> {
        SelectionContext {
            group,
            model,
            failed_account_ids: failed,
            platform_filter: None,
            model_load_map: None,
        }
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let group = group(SchedulePolicy::Layered);
        let failed = HashSet::new();
        assert!(select_account(&[], &ctx(&group, "claude-sonnet-4-5", &failed)).is_none());
    }

    #[test]
    fn selection_is_always_from_the_pool() {
        let group = group(SchedulePolicy::Layered);
        let failed = HashSet::new();
        let pool = vec![entry(1, 1, 0), entry(2, 2, 0), entry(3, 1, 50)];
        let selected =
            select_account(&pool, &ctx(&group, "claude-sonnet-4-5", &failed)).unwrap();
        assert!(pool.iter().any(|e| e.account.id == selected.id));
    }

    #[test]
    fn failed_accounts_are_excluded() {
        let group = group(SchedulePolicy::Layered);
        let failed: HashSet<i64> = [1].into();
        let pool = vec![entry(1, 1, 0), entry(2, 2, 0)];
        let selected =
            select_account(&pool, &ctx(&group, "claude-sonnet-4-5", &failed)).unwrap();
        assert_eq!(selected.id, 2);
    }

    #[test]
    fn adding_better_priority_never_picks_worse() {
        // Monotone under priority improvements.
        let group = group(SchedulePolicy::Layered);
        let failed = HashSet::new();
        let now = Utc::now();
        let base = vec![
            entry_used(1, 2, 10, Some(now - Duration::hours(2))),
            entry_used(2, 2, 10, Some(now - Duration::hours(1))),
        ];
        let baseline = select_account(&base, &ctx(&group, "claude-sonnet-4-5", &failed)).unwrap();
        assert_eq!(baseline.id, 1);

        let mut improved = base;
        improved.push(entry_used(3, 1, 90, Some(now)));
        let selected =
            select_account(&improved, &ctx(&group, "claude-sonnet-4-5", &failed)).unwrap();
        assert_eq!(selected.id, 3, "strictly better priority wins regardless of load");
    }

    #[test]
    fn rate_limited_accounts_are_not_candidates() {
        let group = group(SchedulePolicy::Layered);
        let failed = HashSet::new();
        let reset = (Utc::now() + Duration::minutes(10)).to_rfc3339();
        let mut limited = account(1, 1);
        limited.extra = json!({
            "model_rate_limits": {"claude-sonnet-4-5": {"rate_limit_reset_at": reset}}
        })
        .as_object()
        .cloned()
        .unwrap();
        let pool = vec![with_load(limited, Default::default()), entry(2, 2, 0)];
        let selected =
            select_account(&pool, &ctx(&group, "claude-sonnet-4-5", &failed)).unwrap();
        assert_eq!(selected.id, 2);
    }

    #[test]
    fn platform_filter_excludes_other_platforms() {
        let group = group(SchedulePolicy::Layered);
        let failed = HashSet::new();
        let mut anthropic = account(1, 1);
        anthropic.platform = Platform::Anthropic;
        let pool = vec![with_load(anthropic, Default::default()), entry(2, 2, 0)];

        let context = SelectionContext {
            group: &group,
            model: "claude-sonnet-4-5",
            failed_account_ids: &failed,
            platform_filter: Some(Platform::Antigravity),
            model_load_map: None,
        };
        let selected = select_account(&pool, &context).unwrap();
        assert_eq!(selected.id, 2);
    }

    #[test]
    fn unsupported_scope_excludes_group() {
        let mut group = group(SchedulePolicy::Layered);
        group.supported_scopes = vec!["gemini_text".into()];
        let failed = HashSet::new();
        let pool = vec![entry(1, 1, 0)];
        assert!(select_account(&pool, &ctx(&group, "claude-sonnet-4-5", &failed)).is_none());
        assert!(select_account(&pool, &ctx(&group, "gemini-2.5-flash", &failed)).is_some());
    }

    #[test]
    fn load_balance_policy_consults_model_load_map() {
        let group = group(SchedulePolicy::LoadBalance);
        let failed = HashSet::new();
        let pool = vec![entry(1, 1, 0), entry(2, 1, 0)];
        let loads: HashMap<i64, ModelLoadInfo> = [
            (1, ModelLoadInfo { call_count: 50, last_used_at: Some(Utc::now()) }),
            (2, ModelLoadInfo { call_count: 3, last_used_at: Some(Utc::now()) }),
        ]
        .into();
        let context = SelectionContext {
            group: &group,
            model: "claude-sonnet-4-5",
            failed_account_ids: &failed,
            platform_filter: None,
            model_load_map: Some(&loads),
        };
        assert_eq!(select_account(&pool, &context).unwrap().id, 2);
    }

    #[test]
    fn prefer_oauth_breaks_never_used_ties() {
        let mut group = group(SchedulePolicy::Layered);
        group.prefer_oauth = true;
        let failed = HashSet::new();
        let mut api_key = account(1, 1);
        api_key.credential_kind = CredentialKind::ApiKey;
        let pool = vec![with_load(api_key, Default::default()), entry(2, 1, 0)];
        let selected =
            select_account(&pool, &ctx(&group, "claude-sonnet-4-5", &failed)).unwrap();
        assert_eq!(selected.id, 2);
    }
}

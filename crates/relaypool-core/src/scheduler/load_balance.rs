//! Load-balance filter: concurrency → effective call count → model LRU
//! → random.
//!
//! Step 2 substitutes the mean of the positive call counts for accounts
//! with no record, so a freshly added account is neither stampeded nor
//! starved.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use relaypool_types::ModelLoadInfo;

use super::{layered::select_by_lru, AccountWithLoad};

/// Keep only accounts at the minimum current concurrency.
pub fn filter_by_min_concurrency(candidates: Vec<AccountWithLoad>) -> Vec<AccountWithLoad> {
    let Some(min) = candidates.iter().map(|e| e.load.current_concurrency).min() else {
        return candidates;
    };
    candidates.into_iter().filter(|e| e.load.current_concurrency == min).collect()
}

fn call_count(entry: &AccountWithLoad, loads: &HashMap<i64, ModelLoadInfo>) -> i64 {
    loads.get(&entry.account.id).map(|info| info.call_count).unwrap_or(0)
}

/// Mean of the positive call counts in the candidate set; zero when all
/// candidates are cold.
fn mean_positive_call_count(
    candidates: &[AccountWithLoad],
    loads: &HashMap<i64, ModelLoadInfo>,
) -> f64 {
    let positive: Vec<i64> =
        candidates.iter().map(|e| call_count(e, loads)).filter(|&c| c > 0).collect();
    if positive.is_empty() {
        return 0.0;
    }
    positive.iter().sum::<i64>() as f64 / positive.len() as f64
}

/// Keep only accounts at the minimum effective call count. A zero or
/// missing count is replaced by the candidate-set mean.
pub fn filter_by_min_call_count(
    candidates: Vec<AccountWithLoad>,
    loads: &HashMap<i64, ModelLoadInfo>,
) -> Vec<AccountWithLoad> {
    if candidates.is_empty() {
        return candidates;
    }
    let mean = mean_positive_call_count(&candidates, loads);
    let effective = |entry: &AccountWithLoad| -> f64 {
        let count = call_count(entry, loads);
        if count > 0 {
            count as f64
        } else {
            mean
        }
    };
    let min = candidates.iter().map(&effective).fold(f64::INFINITY, f64::min);
    candidates.into_iter().filter(|e| effective(e) == min).collect()
}

fn model_last_used(
    entry: &AccountWithLoad,
    loads: &HashMap<i64, ModelLoadInfo>,
) -> Option<DateTime<Utc>> {
    loads.get(&entry.account.id).and_then(|info| info.last_used_at)
}

/// Keep only accounts with the earliest model-level last-used time.
/// Never-scheduled accounts (missing entry) rank earliest.
pub fn filter_by_min_last_used(
    candidates: Vec<AccountWithLoad>,
    loads: &HashMap<i64, ModelLoadInfo>,
) -> Vec<AccountWithLoad> {
    if candidates.is_empty() {
        return candidates;
    }
    let never_used: Vec<AccountWithLoad> = candidates
        .iter()
        .filter(|e| model_last_used(e, loads).is_none())
        .cloned()
        .collect();
    if !never_used.is_empty() {
        return never_used;
    }
    let min = candidates.iter().filter_map(|e| model_last_used(e, loads)).min();
    candidates.into_iter().filter(|e| model_last_used(e, loads) == min).collect()
}

/// Random pick; with `prefer_oauth`, restrict the pool to OAuth
/// candidates iff any exist.
pub fn random_select_with_oauth_preference(
    candidates: Vec<AccountWithLoad>,
    prefer_oauth: bool,
) -> Option<AccountWithLoad> {
    if candidates.is_empty() {
        return None;
    }
    if prefer_oauth {
        let oauth: Vec<&AccountWithLoad> =
            candidates.iter().filter(|e| e.account.is_oauth()).collect();
        if !oauth.is_empty() {
            return oauth.choose(&mut rand::thread_rng()).map(|e| (*e).clone());
        }
    }
    candidates.choose(&mut rand::thread_rng()).cloned()
}

/// Four-level load-balance selection. Without a model-load map this
/// degenerates to the LRU rule on account timestamps.
pub fn select_by_load_balance(
    candidates: Vec<AccountWithLoad>,
    loads: Option<&HashMap<i64, ModelLoadInfo>>,
    prefer_oauth: bool,
) -> Option<AccountWithLoad> {
    if candidates.is_empty() {
        return None;
    }
    let Some(loads) = loads else {
        return select_by_lru(candidates, prefer_oauth);
    };
    let step1 = filter_by_min_concurrency(candidates);
    let step2 = filter_by_min_call_count(step1, loads);
    let step3 = filter_by_min_last_used(step2, loads);
    random_select_with_oauth_preference(step3, prefer_oauth)
}

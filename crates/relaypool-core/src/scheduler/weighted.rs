//! Priority-weight variant of the load-balance step 2: weighted
//! proportional dispatch on call_count / weight(priority).
//!
//! weight(p) = 10 for p ≤ 1, else 10/p, so a priority-1 account absorbs
//! ten times the calls of a priority-10 account in the steady state.

use std::collections::HashMap;

use relaypool_types::ModelLoadInfo;

use super::load_balance::{
    filter_by_min_concurrency, filter_by_min_last_used, random_select_with_oauth_preference,
};
use super::{layered::select_by_lru, AccountWithLoad};

fn priority_weight(priority: i32) -> f64 {
    if priority <= 1 {
        10.0
    } else {
        10.0 / priority as f64
    }
}

fn load_ratio(entry: &AccountWithLoad, loads: &HashMap<i64, ModelLoadInfo>) -> Option<f64> {
    let count = loads.get(&entry.account.id).map(|info| info.call_count).unwrap_or(0);
    if count > 0 {
        Some(count as f64 / priority_weight(entry.account.priority))
    } else {
        None
    }
}

/// Keep only accounts at the minimum load ratio; cold accounts inherit
/// the mean ratio of the warm ones.
fn filter_by_min_load_ratio(
    candidates: Vec<AccountWithLoad>,
    loads: &HashMap<i64, ModelLoadInfo>,
) -> Vec<AccountWithLoad> {
    if candidates.is_empty() {
        return candidates;
    }
    let warm: Vec<f64> = candidates.iter().filter_map(|e| load_ratio(e, loads)).collect();
    let mean = if warm.is_empty() { 0.0 } else { warm.iter().sum::<f64>() / warm.len() as f64 };
    let effective =
        |entry: &AccountWithLoad| -> f64 { load_ratio(entry, loads).unwrap_or(mean) };
    let min = candidates.iter().map(&effective).fold(f64::INFINITY, f64::min);
    candidates.into_iter().filter(|e| effective(e) == min).collect()
}

/// Weighted proportional selection: concurrency → load ratio → model
/// LRU → random.
pub fn select_by_priority_weight(
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
    let step2 = filter_by_min_load_ratio(step1, loads);
    let step3 = filter_by_min_last_used(step2, loads);
    random_select_with_oauth_preference(step3, prefer_oauth)
}

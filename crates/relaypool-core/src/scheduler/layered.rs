//! Layered filter: priority → load rate → LRU.

use super::AccountWithLoad;

/// Keep only accounts at the minimum priority value (lower = preferred).
pub fn filter_by_min_priority(candidates: Vec<AccountWithLoad>) -> Vec<AccountWithLoad> {
    let Some(min) = candidates.iter().map(|e| e.account.priority).min() else {
        return candidates;
    };
    candidates.into_iter().filter(|e| e.account.priority == min).collect()
}

/// Keep only accounts at the minimum load rate.
pub fn filter_by_min_load_rate(candidates: Vec<AccountWithLoad>) -> Vec<AccountWithLoad> {
    let Some(min) = candidates.iter().map(|e| e.load.load_rate).min() else {
        return candidates;
    };
    candidates.into_iter().filter(|e| e.load.load_rate == min).collect()
}

/// Pick the least-recently-used account. A missing timestamp ranks
/// earliest. Among never-used ties, `prefer_oauth` picks an OAuth
/// account when one exists; otherwise the first in input order wins.
pub fn select_by_lru(
    candidates: Vec<AccountWithLoad>,
    prefer_oauth: bool,
) -> Option<AccountWithLoad> {
    if candidates.is_empty() {
        return None;
    }

    let never_used: Vec<&AccountWithLoad> =
        candidates.iter().filter(|e| e.account.last_used_at.is_none()).collect();
    if !never_used.is_empty() {
        if prefer_oauth {
            if let Some(oauth) = never_used.iter().find(|e| e.account.is_oauth()) {
                return Some((*oauth).clone());
            }
        }
        return Some(never_used[0].clone());
    }

    candidates.into_iter().min_by_key(|e| e.account.last_used_at)
}

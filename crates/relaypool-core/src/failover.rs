//! Failover engine: a per-request state machine that decides, after
//! every upstream failure, whether to retry the same account, switch to
//! another, or give up.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relaypool_types::{Platform, UpstreamFailoverError};

use crate::repo::TempUnscheduler;
use crate::sleep_with_cancel;

/// Same-account retry cap for retryable-on-same-account errors.
const MAX_SAME_ACCOUNT_RETRIES: u32 = 2;
const SAME_ACCOUNT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Broad backoff before one pool-wide retry after upstream 503.
const SELECTION_EXHAUSTED_BACKOFF: Duration = Duration::from_secs(2);
/// Inter-attempt delay during the Antigravity extra-retry phase.
const EXTRA_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Next step after handling an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    /// Loop again: either retry the same account or pick another.
    Continue,
    /// Budget spent; surface the last upstream error.
    Exhausted,
    /// The request's cancellation signal fired.
    Canceled,
}

/// Cross-iteration failover state, owned by exactly one request task.
#[derive(Debug)]
pub struct FailoverState {
    pub switch_count: u32,
    pub max_switches: u32,
    pub failed_account_ids: HashSet<i64>,
    same_account_retries: HashMap<i64, u32>,
    pub last_failover_error: Option<UpstreamFailoverError>,
    force_cache_billing: bool,
    has_bound_session: bool,
    extra_count: u32,
    max_extra_retries: u32,
}

impl FailoverState {
    pub fn new(max_switches: u32, max_extra_retries: u32, has_bound_session: bool) -> Self {
        Self {
            switch_count: 0,
            max_switches,
            failed_account_ids: HashSet::new(),
            same_account_retries: HashMap::new(),
            last_failover_error: None,
            force_cache_billing: false,
            has_bound_session,
            extra_count: 0,
            max_extra_retries,
        }
    }

    /// Once set, never cleared for the lifetime of the request: a rebind
    /// after failover misses the upstream prompt cache, and the user is
    /// still billed at cache-read rates.
    pub const fn force_cache_billing(&self) -> bool {
        self.force_cache_billing
    }

    /// Past the switch budget the loop continues only on Antigravity
    /// candidates, bounded by the extra-retry counter.
    pub const fn in_extra_phase(&self) -> bool {
        self.switch_count >= self.max_switches
    }

    /// Handle an upstream failure on `account_id` and decide the next
    /// action. The orchestrator loops on `Continue`.
    pub async fn handle_failover_error(
        &mut self,
        cancel: &CancellationToken,
        unscheduler: &dyn TempUnscheduler,
        account_id: i64,
        platform: Platform,
        err: UpstreamFailoverError,
    ) -> FailoverAction {
        if self.has_bound_session || err.force_cache_billing {
            self.force_cache_billing = true;
        }
        let retryable_same = err.retryable_on_same_account;
        let status = err.status_code;
        self.last_failover_error = Some(err);

        if retryable_same {
            let retries = self.same_account_retries.entry(account_id).or_insert(0);
            if *retries < MAX_SAME_ACCOUNT_RETRIES {
                *retries += 1;
                tracing::info!(
                    account_id,
                    status,
                    retry = *retries,
                    max = MAX_SAME_ACCOUNT_RETRIES,
                    "retryable upstream error, same-account retry"
                );
                if !sleep_with_cancel(cancel, SAME_ACCOUNT_RETRY_DELAY).await {
                    return FailoverAction::Canceled;
                }
                return FailoverAction::Continue;
            }
            // Retries spent: temp-ban the account server-wide.
            if let Some(ref err) = self.last_failover_error {
                unscheduler.temp_unschedule(account_id, err).await;
            }
        }

        self.failed_account_ids.insert(account_id);

        if self.switch_count >= self.max_switches {
            // Antigravity continues past the budget into the bounded
            // extra-retry phase.
            if platform == Platform::Antigravity && self.max_extra_retries > 0 {
                self.extra_count += 1;
                if self.extra_count > self.max_extra_retries {
                    return FailoverAction::Exhausted;
                }
                tracing::info!(
                    account_id,
                    status,
                    extra = self.extra_count,
                    max_extra = self.max_extra_retries,
                    "switch budget spent, antigravity extra retry"
                );
                if !sleep_with_cancel(cancel, EXTRA_RETRY_DELAY).await {
                    return FailoverAction::Canceled;
                }
                return FailoverAction::Continue;
            }
            return FailoverAction::Exhausted;
        }

        self.switch_count += 1;
        tracing::info!(
            account_id,
            status,
            switch = self.switch_count,
            max = self.max_switches,
            "upstream error, switching account"
        );

        if platform == Platform::Antigravity {
            // Linear backoff between switches, zero on the first.
            let delay = Duration::from_secs(u64::from(self.switch_count - 1));
            if !sleep_with_cancel(cancel, delay).await {
                return FailoverAction::Canceled;
            }
        }

        FailoverAction::Continue
    }

    /// The scheduler found no candidates. After an upstream 503 and
    /// within the switch budget, back off 2 s, clear the failed set, and
    /// try the whole pool once more; otherwise give up.
    pub async fn handle_selection_exhausted(
        &mut self,
        cancel: &CancellationToken,
    ) -> FailoverAction {
        let last_was_overload =
            self.last_failover_error.as_ref().is_some_and(|err| err.status_code == 503);
        if last_was_overload && self.switch_count <= self.max_switches {
            tracing::info!(
                switch = self.switch_count,
                max = self.max_switches,
                "all candidates excluded after 503, backing off before pool-wide retry"
            );
            if !sleep_with_cancel(cancel, SELECTION_EXHAUSTED_BACKOFF).await {
                return FailoverAction::Canceled;
            }
            self.failed_account_ids.clear();
            return FailoverAction::Continue;
        }
        FailoverAction::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct RecordingUnscheduler {
        calls: AtomicU32,
        account_ids: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl TempUnscheduler for RecordingUnscheduler {
        async fn temp_unschedule(&self, account_id: i64, _err: &UpstreamFailoverError) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.account_ids.lock().unwrap().push(account_id);
        }
    }

    fn err(status: u16) -> UpstreamFailoverError {
        UpstreamFailoverError::from_status(status)
    }

    #[tokio::test]
    async fn basic_exhaustion_over_three_accounts() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(2, 0, false);

        let a = state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Anthropic, err(500))
            .await;
        let b = state
            .handle_failover_error(&cancel, &unscheduler, 2, Platform::Anthropic, err(500))
            .await;
        let c = state
            .handle_failover_error(&cancel, &unscheduler, 3, Platform::Anthropic, err(500))
            .await;

        assert_eq!(a, FailoverAction::Continue);
        assert_eq!(b, FailoverAction::Continue);
        assert_eq!(c, FailoverAction::Exhausted);
        assert_eq!(state.failed_account_ids, HashSet::from([1, 2, 3]));
        assert_eq!(state.switch_count, 2);
        assert_eq!(unscheduler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn same_account_retries_then_switch_and_temp_unschedule() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(3, 0, false);

        for _ in 0..3 {
            let action = state
                .handle_failover_error(&cancel, &unscheduler, 100, Platform::Anthropic, err(408))
                .await;
            assert_eq!(action, FailoverAction::Continue);
        }

        assert_eq!(state.switch_count, 1);
        assert!(state.failed_account_ids.contains(&100));
        assert_eq!(unscheduler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*unscheduler.account_ids.lock().unwrap(), vec![100]);
    }

    #[tokio::test]
    async fn antigravity_linear_delay_between_switches() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(5, 0, false);

        let start = Instant::now();
        state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Antigravity, err(500))
            .await;
        assert!(start.elapsed() < Duration::from_millis(200), "first switch has no delay");

        let start = Instant::now();
        state
            .handle_failover_error(&cancel, &unscheduler, 2, Platform::Antigravity, err(500))
            .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "second switch waits ~1s, got {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn canceled_context_returns_quickly() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(3, 0, false);

        let start = Instant::now();
        let action = state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Anthropic, err(408))
            .await;
        assert_eq!(action, FailoverAction::Canceled);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn force_cache_billing_is_a_latch() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(5, 0, true);
        assert!(!state.force_cache_billing(), "clean requests bill normally");

        state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Anthropic, err(500))
            .await;
        assert!(state.force_cache_billing());

        let mut unbound = FailoverState::new(5, 0, false);
        assert!(!unbound.force_cache_billing());
        let mut flagged = err(500);
        flagged.force_cache_billing = true;
        unbound
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Anthropic, flagged)
            .await;
        assert!(unbound.force_cache_billing());
        unbound
            .handle_failover_error(&cancel, &unscheduler, 2, Platform::Anthropic, err(500))
            .await;
        assert!(unbound.force_cache_billing(), "latch never resets");
    }

    #[tokio::test]
    async fn extra_phase_extends_antigravity_retries() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(1, 2, false);

        // Spend the switch budget.
        let action = state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Antigravity, err(500))
            .await;
        assert_eq!(action, FailoverAction::Continue);
        assert!(state.in_extra_phase());

        // Two extra retries pass, the third exhausts.
        for expected in [FailoverAction::Continue, FailoverAction::Continue] {
            let action = state
                .handle_failover_error(&cancel, &unscheduler, 2, Platform::Antigravity, err(500))
                .await;
            assert_eq!(action, expected);
        }
        let action = state
            .handle_failover_error(&cancel, &unscheduler, 3, Platform::Antigravity, err(500))
            .await;
        assert_eq!(action, FailoverAction::Exhausted);
        assert_eq!(state.switch_count, 1, "extra phase does not consume switches");
    }

    #[tokio::test]
    async fn zero_extra_retries_disables_extra_phase() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(1, 0, false);

        state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Antigravity, err(500))
            .await;
        let action = state
            .handle_failover_error(&cancel, &unscheduler, 2, Platform::Antigravity, err(500))
            .await;
        assert_eq!(action, FailoverAction::Exhausted);
    }

    #[tokio::test]
    async fn non_antigravity_never_enters_extra_phase() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(1, 10, false);

        state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Gemini, err(500))
            .await;
        let action = state
            .handle_failover_error(&cancel, &unscheduler, 2, Platform::Gemini, err(500))
            .await;
        assert_eq!(action, FailoverAction::Exhausted);
    }

    #[tokio::test]
    async fn selection_exhausted_backs_off_after_503() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(3, 0, false);

        state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Anthropic, err(503))
            .await;
        assert!(!state.failed_account_ids.is_empty());

        let start = Instant::now();
        let action = state.handle_selection_exhausted(&cancel).await;
        assert_eq!(action, FailoverAction::Continue);
        assert!(start.elapsed() >= Duration::from_millis(1900));
        assert!(state.failed_account_ids.is_empty(), "failed set cleared for pool-wide retry");
    }

    #[tokio::test]
    async fn selection_exhausted_without_503_gives_up() {
        let cancel = CancellationToken::new();
        let unscheduler = RecordingUnscheduler::default();
        let mut state = FailoverState::new(3, 0, false);

        state
            .handle_failover_error(&cancel, &unscheduler, 1, Platform::Anthropic, err(500))
            .await;
        let action = state.handle_selection_exhausted(&cancel).await;
        assert_eq!(action, FailoverAction::Exhausted);
    }

    #[tokio::test]
    async fn selection_exhausted_with_no_error_gives_up() {
        let cancel = CancellationToken::new();
        let mut state = FailoverState::new(3, 0, false);
        assert_eq!(state.handle_selection_exhausted(&cancel).await, FailoverAction::Exhausted);
    }
}

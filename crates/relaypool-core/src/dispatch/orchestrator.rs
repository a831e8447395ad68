//! The per-request dispatch loop.
//!
//! Ordering per attempt: sticky lookup (first attempt only) → scheduler
//! → slot acquire → credential resolve → upstream send. Slot release is
//! guaranteed on every exit path, including cancellation. The failover
//! engine decides what happens after each failure.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use relaypool_types::{
    Account, GatewayConfig, GatewayError, Group, Platform, RunMode, UpstreamFailoverError,
};

use crate::failover::{FailoverAction, FailoverState};
use crate::load::LoadStore;
use crate::repo::{AccountRepository, GroupRepository, TempUnscheduler};
use crate::scheduler::{select_account, AccountWithLoad, SelectionContext};
use crate::slots::ConcurrencyCache;
use crate::sticky::{SessionBinding, SessionStore};
use crate::token::{TokenError, TokenProvider};
use crate::upstream::{
    classify_error_response, UpstreamBody, UpstreamClient, UpstreamError, UpstreamRequest,
};
use crate::{sleep_with_cancel, StoreError};

use super::cache_billing::{
    estimate_input_tokens_after_last_cache_breakpoint, force_cache_read_billing,
};
use super::request::ParsedRequest;
use super::session_id::replace_session_id_for_oauth;
use super::warmup::{is_warmup_request, warmup_response};

const SLOT_ACQUIRE_POLL: std::time::Duration = std::time::Duration::from_millis(100);

pub enum DispatchBody {
    Json(Value),
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl std::fmt::Debug for DispatchBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchBody::Json(v) => f.debug_tuple("Json").field(v).finish(),
            DispatchBody::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

#[derive(Debug)]
pub struct DispatchResponse {
    pub status: u16,
    pub account_id: i64,
    pub body: DispatchBody,
}

impl DispatchResponse {
    fn json(account_id: i64, value: Value) -> Self {
        Self { status: 200, account_id, body: DispatchBody::Json(value) }
    }
}

#[derive(Clone)]
pub struct DispatcherConfig {
    pub gateway: GatewayConfig,
    /// Messages endpoint per platform, e.g.
    /// `https://api.anthropic.com/v1/messages`.
    pub upstream_urls: HashMap<Platform, String>,
}

pub struct Dispatcher {
    accounts: Arc<dyn AccountRepository>,
    groups: Arc<dyn GroupRepository>,
    sessions: Arc<dyn SessionStore>,
    loads: Arc<dyn LoadStore>,
    slots: Arc<dyn ConcurrencyCache>,
    tokens: Arc<TokenProvider>,
    upstream: Arc<dyn UpstreamClient>,
    unscheduler: Arc<dyn TempUnscheduler>,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        groups: Arc<dyn GroupRepository>,
        sessions: Arc<dyn SessionStore>,
        loads: Arc<dyn LoadStore>,
        slots: Arc<dyn ConcurrencyCache>,
        tokens: Arc<TokenProvider>,
        upstream: Arc<dyn UpstreamClient>,
        unscheduler: Arc<dyn TempUnscheduler>,
        config: DispatcherConfig,
    ) -> Self {
        Self { accounts, groups, sessions, loads, slots, tokens, upstream, unscheduler, config }
    }

    /// Run one request to completion: loop over account attempts until
    /// success, exhaustion, or cancellation. `forced_platform` narrows
    /// candidates to one platform (the `/{platform}/v1/messages`
    /// routes).
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        parsed: &ParsedRequest,
        forced_platform: Option<Platform>,
    ) -> Result<DispatchResponse, GatewayError> {
        let group = self
            .groups
            .get_by_id(group_id)
            .await
            .map_err(|err| GatewayError::Store(err.to_string()))?
            .ok_or_else(|| GatewayError::InvalidRequest {
                message: format!("unknown group {group_id}"),
            })?;

        let session_hash = parsed.session_hash();
        let bound_account_id = match &session_hash {
            Some(hash) => self.sticky_get(cancel, group_id, hash).await?,
            None => None,
        };

        let mut failover = FailoverState::new(
            self.config.gateway.max_account_switches,
            self.config.gateway.antigravity_extra_retries,
            bound_account_id.is_some(),
        );
        let mut sticky_candidate = bound_account_id;
        let mut sticky_hit = false;

        loop {
            let account = match self
                .pick_account(
                    cancel,
                    &group,
                    parsed,
                    &failover,
                    forced_platform,
                    &mut sticky_candidate,
                    &mut sticky_hit,
                )
                .await?
            {
                Some(account) => account,
                None => match failover.handle_selection_exhausted(cancel).await {
                    FailoverAction::Continue => continue,
                    FailoverAction::Canceled => return Err(GatewayError::Canceled),
                    FailoverAction::Exhausted => {
                        return Err(self.exhausted_error(failover));
                    },
                },
            };

            // Warmup traffic never reaches the upstream on flagged
            // accounts.
            if account.credential_bool("intercept_warmup_requests") && is_warmup_request(parsed) {
                tracing::debug!(account_id = account.id, "warmup request intercepted");
                return Ok(DispatchResponse::json(account.id, warmup_response(&parsed.model)));
            }

            let holder = uuid::Uuid::new_v4().to_string();
            if !self.acquire_slot(cancel, &account, &holder).await? {
                tracing::warn!(account_id = account.id, "account at capacity, trying next");
                failover.failed_account_ids.insert(account.id);
                continue;
            }

            // Slot is held from here on: every path below must release.
            match self.attempt(cancel, &group, parsed, &account, &failover).await {
                AttemptOutcome::Success(response) => {
                    self.slot_release(&account, &holder).await;
                    self.record_success(
                        cancel,
                        &group,
                        parsed,
                        &account,
                        &session_hash,
                        sticky_hit,
                    )
                    .await;
                    return Ok(response);
                },
                AttemptOutcome::Fatal(err) => {
                    self.slot_release(&account, &holder).await;
                    return Err(err);
                },
                AttemptOutcome::Failover(err) => {
                    self.slot_release(&account, &holder).await;
                    match failover
                        .handle_failover_error(
                            cancel,
                            self.unscheduler.as_ref(),
                            account.id,
                            account.platform,
                            err,
                        )
                        .await
                    {
                        FailoverAction::Continue => continue,
                        FailoverAction::Canceled => return Err(GatewayError::Canceled),
                        FailoverAction::Exhausted => {
                            return Err(self.exhausted_error(failover));
                        },
                    }
                },
            }
        }
    }

    fn exhausted_error(&self, failover: FailoverState) -> GatewayError {
        match failover.last_failover_error {
            Some(err) => GatewayError::Exhausted(Some(err)),
            None => GatewayError::NoAvailableAccounts {
                reason: "no schedulable account for request".into(),
            },
        }
    }

    async fn sticky_get(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        hash: &str,
    ) -> Result<Option<i64>, GatewayError> {
        match self.sessions.get(cancel, group_id, hash).await {
            Ok(bound) => Ok(bound),
            Err(StoreError::Canceled) => Err(GatewayError::Canceled),
            Err(err) => {
                // Sticky lookups are best-effort; a broken store must
                // not fail the request.
                tracing::warn!(group_id, error = %err, "sticky lookup failed, scheduling fresh");
                Ok(None)
            },
        }
    }

    /// Sticky candidate on the first attempt, scheduler afterwards.
    #[allow(clippy::too_many_arguments)]
    async fn pick_account(
        &self,
        cancel: &CancellationToken,
        group: &Group,
        parsed: &ParsedRequest,
        failover: &FailoverState,
        forced_platform: Option<Platform>,
        sticky_candidate: &mut Option<i64>,
        sticky_hit: &mut bool,
    ) -> Result<Option<Account>, GatewayError> {
        *sticky_hit = false;
        if let Some(bound_id) = sticky_candidate.take() {
            match self.accounts.get_by_id(bound_id).await {
                Ok(Some(account))
                    if account.is_schedulable_for_model(&parsed.model)
                        && !failover.failed_account_ids.contains(&account.id) =>
                {
                    tracing::debug!(account_id = account.id, "sticky session hit");
                    *sticky_hit = true;
                    return Ok(Some(account));
                },
                _ => {
                    // Bound account is gone or unavailable: drop the
                    // binding so the next request rebinds cleanly.
                    if let Some(hash) = parsed.session_hash() {
                        let _ = self.sessions.delete(cancel, group.id, &hash).await;
                    }
                    tracing::debug!(account_id = bound_id, "sticky binding dropped");
                },
            }
        }

        let pool = self
            .accounts
            .list_by_group(group.id)
            .await
            .map_err(|err| GatewayError::Store(err.to_string()))?;
        if pool.is_empty() {
            return Ok(None);
        }

        let capacity_pairs: Vec<(i64, i32)> =
            pool.iter().map(|a| (a.id, a.max_concurrency)).collect();
        let load_map = self
            .slots
            .load_batch(cancel, &capacity_pairs)
            .await
            .map_err(map_store_err)?;

        let model_keys: Vec<(i64, String)> =
            pool.iter().map(|a| (a.id, a.mapped_model(&parsed.model))).collect();
        let model_load_map =
            self.loads.get_batch(cancel, &model_keys).await.map_err(map_store_err)?;

        let pool: Vec<AccountWithLoad> = pool
            .into_iter()
            .map(|account| {
                let load = load_map.get(&account.id).copied().unwrap_or_default();
                AccountWithLoad { account, load }
            })
            .collect();

        // The extra-retry phase overrides any forced platform: only
        // Antigravity candidates continue past the switch budget.
        let platform_filter = if failover.in_extra_phase() {
            Some(Platform::Antigravity)
        } else {
            forced_platform
        };
        let ctx = SelectionContext {
            group,
            model: &parsed.model,
            failed_account_ids: &failover.failed_account_ids,
            platform_filter,
            model_load_map: Some(&model_load_map),
        };
        Ok(select_account(&pool, &ctx))
    }

    async fn acquire_slot(
        &self,
        cancel: &CancellationToken,
        account: &Account,
        holder: &str,
    ) -> Result<bool, GatewayError> {
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_millis(self.config.gateway.slot_wait_ms);
        loop {
            match self
                .slots
                .acquire(cancel, account.id, account.max_concurrency, holder)
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) => {},
                Err(StoreError::Canceled) => return Err(GatewayError::Canceled),
                Err(err) => return Err(GatewayError::Store(err.to_string())),
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            if !sleep_with_cancel(cancel, SLOT_ACQUIRE_POLL).await {
                return Err(GatewayError::Canceled);
            }
        }
    }

    async fn slot_release(&self, account: &Account, holder: &str) {
        if let Err(err) = self.slots.release(account.id, holder).await {
            tracing::error!(account_id = account.id, error = %err, "slot release failed");
        }
    }

    /// One upstream attempt on a held slot. Never touches the slot
    /// itself; the caller releases.
    async fn attempt(
        &self,
        cancel: &CancellationToken,
        _group: &Group,
        parsed: &ParsedRequest,
        account: &Account,
        failover: &FailoverState,
    ) -> AttemptOutcome {
        let token = match self.tokens.get_access_token(cancel, account).await {
            Ok(token) => token,
            Err(TokenError::Canceled) => return AttemptOutcome::Fatal(GatewayError::Canceled),
            Err(err) => {
                tracing::warn!(account_id = account.id, error = %err, "credential resolve failed");
                let mut synthetic = UpstreamFailoverError::from_status(500);
                synthetic.body_excerpt = Some(err.to_string());
                return AttemptOutcome::Failover(synthetic);
            },
        };

        let Some(url) = self.config.upstream_urls.get(&account.platform) else {
            return AttemptOutcome::Fatal(GatewayError::InvalidRequest {
                message: format!("no upstream configured for platform {}", account.platform),
            });
        };

        let body = self.prepare_body(parsed, account);
        let request = UpstreamRequest {
            url: url.clone(),
            bearer_token: token,
            body,
            stream: parsed.stream,
        };

        let response = match self.upstream.execute(request).await {
            Ok(response) => response,
            Err(transport) => {
                tracing::warn!(account_id = account.id, error = %transport, "upstream transport failure");
                return AttemptOutcome::Failover(transport.into_failover_error());
            },
        };

        if (200..300).contains(&response.status) {
            let body = match response.body {
                UpstreamBody::Stream(stream) => DispatchBody::Stream(stream),
                UpstreamBody::Buffered(bytes) => {
                    match serde_json::from_slice::<Value>(&bytes) {
                        Ok(mut value) => {
                            // Simple run mode skips billing adjustments.
                            if failover.force_cache_billing()
                                && self.config.gateway.run_mode == RunMode::Full
                            {
                                self.apply_cache_billing(parsed, &mut value);
                            }
                            DispatchBody::Json(value)
                        },
                        Err(_) => DispatchBody::Stream(Box::pin(futures::stream::once(
                            async move { Ok(bytes) },
                        ))),
                    }
                },
            };
            return AttemptOutcome::Success(DispatchResponse {
                status: response.status,
                account_id: account.id,
                body,
            });
        }

        let body = match response.body {
            UpstreamBody::Buffered(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        };
        match classify_error_response(response.status, response.request_id, response.retry_after.as_deref(), &body)
        {
            UpstreamError::PromptTooLong(err) => {
                tracing::warn!(account_id = account.id, "prompt too long, failing request");
                AttemptOutcome::Fatal(GatewayError::PromptTooLong(err))
            },
            UpstreamError::Client { status, body } => {
                AttemptOutcome::Fatal(GatewayError::UpstreamClient { status, body })
            },
            UpstreamError::Failover { err, rate_limit_reset, auth_failure } => {
                if auth_failure {
                    tracing::warn!(
                        account_id = account.id,
                        status = err.status_code,
                        "auth failure, marking account error"
                    );
                    let _ = self
                        .accounts
                        .mark_error(account.id, &format!("upstream {}", err.status_code))
                        .await;
                }
                if let Some(reset_at) = rate_limit_reset {
                    let scope = account.mapped_model(&parsed.model);
                    let _ = self.accounts.set_model_rate_limit(account.id, &scope, reset_at).await;
                }
                AttemptOutcome::Failover(err)
            },
        }
    }

    /// Model mapping and per-account session-id rewriting applied to
    /// the outbound body.
    fn prepare_body(&self, parsed: &ParsedRequest, account: &Account) -> Bytes {
        let mut body = parsed.body.to_vec();

        let mapped = account.mapped_model(&parsed.model);
        if mapped != parsed.model {
            if let Ok(mut value) = serde_json::from_slice::<Value>(&body) {
                if let Some(object) = value.as_object_mut() {
                    object.insert("model".into(), Value::String(mapped));
                    if let Ok(rewritten) = serde_json::to_vec(&value) {
                        body = rewritten;
                    }
                }
            }
        }

        if account.platform == Platform::Antigravity && account.is_oauth() {
            if let Ok(rewritten) = replace_session_id_for_oauth(&body, account.id) {
                body = rewritten;
            }
        }

        Bytes::from(body)
    }

    fn apply_cache_billing(&self, parsed: &ParsedRequest, response: &mut Value) {
        let estimated =
            estimate_input_tokens_after_last_cache_breakpoint(&parsed.messages).unwrap_or(0);
        if let Some(usage) = response.get_mut("usage") {
            force_cache_read_billing(usage, estimated);
        }
    }

    /// Post-success bookkeeping: sticky save/refresh and the model-load
    /// counter. Best-effort; the response is already won.
    async fn record_success(
        &self,
        cancel: &CancellationToken,
        group: &Group,
        parsed: &ParsedRequest,
        account: &Account,
        session_hash: &Option<String>,
        sticky_hit: bool,
    ) {
        if let Some(hash) = session_hash {
            if sticky_hit {
                if let Err(err) = self.sessions.refresh(cancel, group.id, hash).await {
                    tracing::debug!(error = %err, "sticky refresh failed");
                }
            } else {
                if let Err(err) = self.sessions.set(cancel, group.id, hash, account.id).await {
                    tracing::debug!(error = %err, "sticky save failed");
                }
                let chain = parsed.digest_chain();
                if !chain.is_empty() {
                    let binding = SessionBinding {
                        uuid: uuid::Uuid::new_v4().to_string(),
                        account_id: account.id,
                    };
                    if let Err(err) = self
                        .sessions
                        .save(cancel, group.id, &parsed.prefix_hash(), &chain, &binding)
                        .await
                    {
                        tracing::debug!(error = %err, "sticky trie save failed");
                    }
                }
            }
        }

        let mapped = account.mapped_model(&parsed.model);
        if let Err(err) = self.loads.record_call(cancel, account.id, &mapped).await {
            tracing::debug!(error = %err, "model load record failed");
        }
        if let Err(err) = self.accounts.touch_last_used(account.id, Utc::now()).await {
            tracing::debug!(error = %err, "last_used update failed");
        }
    }
}

enum AttemptOutcome {
    Success(DispatchResponse),
    /// Enter the failover machine.
    Failover(UpstreamFailoverError),
    /// Surface immediately, no retry.
    Fatal(GatewayError),
}

fn map_store_err(err: StoreError) -> GatewayError {
    match err {
        StoreError::Canceled => GatewayError::Canceled,
        other => GatewayError::Store(other.to_string()),
    }
}

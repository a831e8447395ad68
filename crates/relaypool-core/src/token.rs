//! Credential provider for OAuth accounts.
//!
//! Access tokens are cached process-wide under `ag:{project_id}` (or
//! `ag:account:{id}` before a project is known). Refreshes run under a
//! 30-second single-flight lease per cache key; losers recheck the
//! cache instead of piling onto the upstream OAuth endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use relaypool_types::{Account, CredentialKind};

use crate::redis_store::{run_with_cancel, RedisStore, StoreError};
use crate::repo::AccountRepository;
use crate::sleep_with_cancel;

/// Refresh when the token is within this window of expiry, in minutes.
const REFRESH_SKEW_MINS: i64 = 3;
/// Subtracted from the remaining lifetime when computing the cache TTL.
const CACHE_SKEW_MINS: i64 = 5;
const CACHE_TTL_MAX: Duration = Duration::from_secs(30 * 60);
const CACHE_TTL_MIN: Duration = Duration::from_secs(60);
const REFRESH_LOCK_TTL: Duration = Duration::from_secs(30);
const REFRESH_LOCK_POLL: Duration = Duration::from_millis(250);
/// Per-account cooldown between project-id fill attempts.
const PROJECT_ID_FILL_COOLDOWN: Duration = Duration::from_secs(60);
/// Last-resort tenant when every discovery call fails.
const FALLBACK_PROJECT_ID: &str = "bamboo-precept-lgxtn";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("account {0} is not an oauth account")]
    NotOauth(i64),
    #[error("account {0} missing credential {1}")]
    MissingCredential(i64, &'static str),
    #[error("token refresh failed for account {account_id}: {message}")]
    RefreshFailed { account_id: i64, message: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("request canceled")]
    Canceled,
}

/// Token payload returned by the upstream OAuth refresh.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenInfo {
    /// New credential map for the account; the caller merges the old
    /// map underneath so unrecognised keys survive rotation.
    pub fn into_credentials(self) -> Map<String, Value> {
        let mut credentials = Map::new();
        credentials.insert("access_token".into(), Value::String(self.access_token));
        if let Some(refresh_token) = self.refresh_token {
            credentials.insert("refresh_token".into(), Value::String(refresh_token));
        }
        credentials.insert("expires_at".into(), Value::String(self.expires_at.to_rfc3339()));
        credentials
    }
}

#[derive(Debug, Error)]
#[error("oauth upstream error: {message}")]
pub struct OAuthError {
    pub message: String,
}

/// Upstream OAuth surface; the production impl speaks HTTPS, tests
/// substitute fakes.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenInfo, OAuthError>;

    /// First project-id discovery call.
    async fn load_code_assist(&self, access_token: &str) -> Result<Option<String>, OAuthError>;

    /// Second discovery call, only after `load_code_assist` succeeded
    /// without a project.
    async fn onboard_user(&self, access_token: &str) -> Result<Option<String>, OAuthError>;
}

#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get_access_token(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn set_access_token(
        &self,
        cancel: &CancellationToken,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn acquire_refresh_lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn release_refresh_lock(&self, key: &str) -> Result<(), StoreError>;
}

pub struct RedisTokenCache {
    store: RedisStore,
}

impl RedisTokenCache {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    fn lock_key(key: &str) -> String {
        format!("{key}:refresh_lock")
    }
}

#[async_trait]
impl TokenCache for RedisTokenCache {
    async fn get_access_token(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        run_with_cancel(cancel, conn.get(key)).await
    }

    async fn set_access_token(
        &self,
        cancel: &CancellationToken,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        run_with_cancel(cancel, conn.set_ex(key, token, ttl.as_secs().max(1))).await
    }

    async fn acquire_refresh_lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let acquired: Option<String> = run_with_cancel(
            cancel,
            redis::cmd("SET")
                .arg(Self::lock_key(key))
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn),
        )
        .await?;
        Ok(acquired.is_some())
    }

    async fn release_refresh_lock(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.store.connection().await?;
        let _: u64 = conn.del(Self::lock_key(key)).await?;
        Ok(())
    }
}

/// Cache key for an account's access token.
pub fn token_cache_key(account: &Account) -> String {
    match account.credential("project_id") {
        Some(project_id) => format!("ag:{project_id}"),
        None => format!("ag:account:{}", account.id),
    }
}

/// Merge old credentials underneath new ones: keys absent from the new
/// map are carried over.
pub fn merge_credentials(new_credentials: &mut Map<String, Value>, old: &Map<String, Value>) {
    for (key, value) in old {
        if !new_credentials.contains_key(key) {
            new_credentials.insert(key.clone(), value.clone());
        }
    }
}

/// TTL for a cached token: remaining lifetime minus skew, clamped to
/// [1 min, 30 min].
pub fn cache_ttl(expires_at: Option<DateTime<Utc>>) -> Duration {
    let Some(expires_at) = expires_at else {
        return CACHE_TTL_MAX;
    };
    let cache_skew = chrono::Duration::minutes(CACHE_SKEW_MINS);
    let until = expires_at - Utc::now();
    let ttl = if until > cache_skew {
        until - cache_skew
    } else if until > chrono::Duration::zero() {
        until
    } else {
        chrono::Duration::minutes(1)
    };
    let ttl = Duration::from_secs(ttl.num_seconds().max(0) as u64);
    ttl.clamp(CACHE_TTL_MIN, CACHE_TTL_MAX)
}

pub struct TokenProvider {
    cache: std::sync::Arc<dyn TokenCache>,
    accounts: std::sync::Arc<dyn AccountRepository>,
    oauth: std::sync::Arc<dyn OAuthClient>,
    project_fill_attempts: DashMap<i64, std::time::Instant>,
}

impl TokenProvider {
    pub fn new(
        cache: std::sync::Arc<dyn TokenCache>,
        accounts: std::sync::Arc<dyn AccountRepository>,
        oauth: std::sync::Arc<dyn OAuthClient>,
    ) -> Self {
        Self { cache, accounts, oauth, project_fill_attempts: DashMap::new() }
    }

    /// Resolve a usable access token for the account.
    pub async fn get_access_token(
        &self,
        cancel: &CancellationToken,
        account: &Account,
    ) -> Result<String, TokenError> {
        // Upstream-kind accounts skip OAuth entirely.
        if account.credential_kind == CredentialKind::Upstream {
            return account
                .credential("api_key")
                .map(str::to_string)
                .ok_or(TokenError::MissingCredential(account.id, "api_key"));
        }
        if account.credential_kind != CredentialKind::Oauth {
            return Err(TokenError::NotOauth(account.id));
        }

        let cache_key = token_cache_key(account);
        if let Some(token) = self.cache.get_access_token(cancel, &cache_key).await? {
            return Ok(token);
        }

        let mut account = account.clone();
        let mut expires_at = account.credential_time("expires_at");
        if needs_refresh(expires_at) {
            match self.acquire_lock_or_cached(cancel, &cache_key).await? {
                LockOutcome::Cached(token) => return Ok(token),
                LockOutcome::Acquired => {
                    let result =
                        self.refresh_under_lock(cancel, &cache_key, &mut account).await;
                    if let Err(err) = self.cache.release_refresh_lock(&cache_key).await {
                        tracing::warn!(account_id = account.id, error = %err, "refresh lock release failed");
                    }
                    result?;
                    expires_at = account.credential_time("expires_at");
                },
                LockOutcome::Timeout => {
                    // Holder overran its lease; fall through with the
                    // credentials we have.
                    tracing::warn!(
                        account_id = account.id,
                        "refresh lock wait timed out, using current credentials"
                    );
                },
            }
        }

        let mut access_token = account
            .credential("access_token")
            .map(str::to_string)
            .ok_or(TokenError::MissingCredential(account.id, "access_token"))?;

        if account.credential("project_id").is_none() {
            self.try_fill_project_id(&mut account, &access_token).await;
        }

        // Version check: a parallel writer may have published a newer
        // token while we worked. If so, serve the persisted one and skip
        // the cache write.
        let latest = self.accounts.get_by_id(account.id).await.ok().flatten();
        let persisted_token =
            latest.as_ref().and_then(|a| a.credential("access_token")).map(str::to_string);
        match persisted_token {
            Some(persisted) if persisted != access_token => {
                tracing::debug!(account_id = account.id, "token version stale, using persisted");
                access_token = persisted;
            },
            _ => {
                let ttl = cache_ttl(expires_at);
                if let Err(err) =
                    self.cache.set_access_token(cancel, &cache_key, &access_token, ttl).await
                {
                    tracing::warn!(account_id = account.id, error = %err, "token cache write failed");
                }
            },
        }

        Ok(access_token)
    }

    async fn acquire_lock_or_cached(
        &self,
        cancel: &CancellationToken,
        cache_key: &str,
    ) -> Result<LockOutcome, TokenError> {
        let deadline = std::time::Instant::now() + REFRESH_LOCK_TTL;
        loop {
            if let Some(token) = self.cache.get_access_token(cancel, cache_key).await? {
                return Ok(LockOutcome::Cached(token));
            }
            if self.cache.acquire_refresh_lock(cancel, cache_key, REFRESH_LOCK_TTL).await? {
                return Ok(LockOutcome::Acquired);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(LockOutcome::Timeout);
            }
            if !sleep_with_cancel(cancel, REFRESH_LOCK_POLL).await {
                return Err(TokenError::Canceled);
            }
        }
    }

    async fn refresh_under_lock(
        &self,
        cancel: &CancellationToken,
        cache_key: &str,
        account: &mut Account,
    ) -> Result<(), TokenError> {
        // Another worker may have refreshed while we waited for the
        // lock.
        if self.cache.get_access_token(cancel, cache_key).await?.is_some() {
            return Ok(());
        }
        if let Ok(Some(fresh)) = self.accounts.get_by_id(account.id).await {
            *account = fresh;
        }
        let expires_at = account.credential_time("expires_at");
        if !needs_refresh(expires_at) {
            return Ok(());
        }

        let refresh_token = account
            .credential("refresh_token")
            .map(str::to_string)
            .ok_or(TokenError::MissingCredential(account.id, "refresh_token"))?;

        let token_info = match self.oauth.refresh_token(&refresh_token).await {
            Ok(info) => info,
            Err(err) => {
                if err.message.contains("invalid_grant") {
                    tracing::error!(
                        account_id = account.id,
                        "refresh token revoked (invalid_grant), disabling account"
                    );
                    let _ = self.accounts.mark_error(account.id, "invalid_grant").await;
                }
                return Err(TokenError::RefreshFailed {
                    account_id: account.id,
                    message: err.message,
                });
            },
        };

        let mut new_credentials = token_info.into_credentials();
        merge_credentials(&mut new_credentials, &account.credentials);
        account.credentials = new_credentials;
        if let Err(err) = self.accounts.update(account).await {
            tracing::error!(account_id = account.id, error = %err, "failed to persist refreshed credentials");
        }
        Ok(())
    }

    /// Best-effort project-id fill: load-code-assist, then onboard-user,
    /// then the fixed fallback tenant. A 60 s per-account cooldown keeps
    /// failing accounts from hammering the discovery endpoints.
    async fn try_fill_project_id(&self, account: &mut Account, access_token: &str) {
        if let Some(last_attempt) = self.project_fill_attempts.get(&account.id) {
            if last_attempt.elapsed() < PROJECT_ID_FILL_COOLDOWN {
                return;
            }
        }
        self.project_fill_attempts.insert(account.id, std::time::Instant::now());

        match self.oauth.load_code_assist(access_token).await {
            Ok(Some(project_id)) => {
                self.persist_project_id(account, &project_id).await;
                self.project_fill_attempts.remove(&account.id);
                return;
            },
            Ok(None) => {
                if let Ok(Some(project_id)) = self.oauth.onboard_user(access_token).await {
                    self.persist_project_id(account, &project_id).await;
                    self.project_fill_attempts.remove(&account.id);
                    return;
                }
            },
            Err(_) => {},
        }

        tracing::warn!(
            account_id = account.id,
            fallback = FALLBACK_PROJECT_ID,
            "project_id discovery failed, using fallback"
        );
        self.persist_project_id(account, FALLBACK_PROJECT_ID).await;
    }

    async fn persist_project_id(&self, account: &mut Account, project_id: &str) {
        account
            .credentials
            .insert("project_id".into(), Value::String(project_id.to_string()));
        if let Err(err) = self.accounts.update(account).await {
            tracing::error!(account_id = account.id, error = %err, "failed to persist project_id");
        }
    }
}

enum LockOutcome {
    Cached(String),
    Acquired,
    Timeout,
}

fn needs_refresh(expires_at: Option<DateTime<Utc>>) -> bool {
    match expires_at {
        None => true,
        Some(at) => at - Utc::now() <= chrono::Duration::minutes(REFRESH_SKEW_MINS),
    }
}

//! Collaborator seams: persistent repositories and the temp-unschedule
//! hook. Injected at startup; tests substitute in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use relaypool_types::{Account, Group, UpstreamFailoverError};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("repository error: {0}")]
    Other(String),
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<Account>, RepoError>;

    /// Accounts of a group, already hydrated; the scheduler applies
    /// per-request admission on top.
    async fn list_by_group(&self, group_id: i64) -> Result<Vec<Account>, RepoError>;

    /// Accounts across a set of groups, used by the mixed-channel check.
    async fn list_by_groups(&self, group_ids: &[i64]) -> Result<Vec<Account>, RepoError>;

    /// Persist the full account, including its credentials map.
    async fn update(&self, account: &Account) -> Result<(), RepoError>;

    /// Mark the account Error and remove it from rotation (401/403).
    async fn mark_error(&self, id: i64, reason: &str) -> Result<(), RepoError>;

    /// Record a per-model rate-limit reset window under
    /// `extra.model_rate_limits`.
    async fn set_model_rate_limit(
        &self,
        id: i64,
        scope: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<(), RepoError>;

    async fn touch_last_used(&self, id: i64, at: DateTime<Utc>) -> Result<(), RepoError>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<Group>, RepoError>;
}

/// Temp-bans an account server-wide after same-account retries are
/// spent on a retryable error.
#[async_trait]
pub trait TempUnscheduler: Send + Sync {
    async fn temp_unschedule(&self, account_id: i64, err: &UpstreamFailoverError);
}

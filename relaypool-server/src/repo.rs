//! In-memory account and group repositories.
//!
//! The dispatch engine only sees the repository traits; this process
//! keeps its pool in memory, seeded and mutated through the admin API.
//! Deployments backed by an external database swap these out without
//! touching the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use relaypool_core::repo::{AccountRepository, GroupRepository, RepoError, TempUnscheduler};
use relaypool_types::{Account, AccountStatus, Group, UpstreamFailoverError};

/// How long a temp-banned account stays out of rotation.
const TEMP_UNSCHEDULE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct InMemoryAccountRepo {
    accounts: DashMap<i64, Account>,
    /// account_id → group memberships.
    memberships: DashMap<i64, Vec<i64>>,
    next_id: std::sync::atomic::AtomicI64,
}

impl InMemoryAccountRepo {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            memberships: DashMap::new(),
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }

    pub fn insert(&self, mut account: Account, group_ids: Vec<i64>) -> Account {
        if account.id == 0 {
            account.id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        self.memberships.insert(account.id, group_ids);
        self.accounts.insert(account.id, account.clone());
        account
    }

    pub fn set_groups(&self, account_id: i64, group_ids: Vec<i64>) {
        self.memberships.insert(account_id, group_ids);
    }

    pub fn all_ids(&self) -> Vec<i64> {
        self.accounts.iter().map(|entry| *entry.key()).collect()
    }

    fn in_group(&self, account_id: i64, group_id: i64) -> bool {
        self.memberships
            .get(&account_id)
            .map(|groups| groups.contains(&group_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepo {
    async fn get_by_id(&self, id: i64) -> Result<Option<Account>, RepoError> {
        Ok(self.accounts.get(&id).map(|a| a.clone()))
    }

    async fn list_by_group(&self, group_id: i64) -> Result<Vec<Account>, RepoError> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|entry| self.in_group(*entry.key(), group_id))
            .map(|entry| entry.value().clone())
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn list_by_groups(&self, group_ids: &[i64]) -> Result<Vec<Account>, RepoError> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|entry| group_ids.iter().any(|&g| self.in_group(*entry.key(), g)))
            .map(|entry| entry.value().clone())
            .collect();
        accounts.sort_by_key(|a| a.id);
        accounts.dedup_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn update(&self, account: &Account) -> Result<(), RepoError> {
        self.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn mark_error(&self, id: i64, reason: &str) -> Result<(), RepoError> {
        let mut account =
            self.accounts.get_mut(&id).ok_or(RepoError::AccountNotFound(id))?;
        account.status = AccountStatus::Error;
        tracing::warn!(account_id = id, reason, "account marked error");
        Ok(())
    }

    async fn set_model_rate_limit(
        &self,
        id: i64,
        scope: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let mut account =
            self.accounts.get_mut(&id).ok_or(RepoError::AccountNotFound(id))?;
        let limits = account
            .extra
            .entry("model_rate_limits".to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(limits) = limits.as_object_mut() {
            limits.insert(
                scope.to_string(),
                serde_json::json!({"rate_limit_reset_at": reset_at.to_rfc3339()}),
            );
        }
        Ok(())
    }

    async fn touch_last_used(&self, id: i64, at: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(mut account) = self.accounts.get_mut(&id) {
            account.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryGroupRepo {
    groups: DashMap<i64, Group>,
}

impl InMemoryGroupRepo {
    pub fn new() -> Self {
        Self { groups: DashMap::new() }
    }

    pub fn insert(&self, group: Group) {
        self.groups.insert(group.id, group);
    }
}

#[async_trait]
impl GroupRepository for InMemoryGroupRepo {
    async fn get_by_id(&self, id: i64) -> Result<Option<Group>, RepoError> {
        Ok(self.groups.get(&id).map(|g| g.clone()))
    }
}

/// Temp-bans an account by flipping `schedulable` off and restoring it
/// after a fixed window.
pub struct ScheduleBanService {
    accounts: Arc<InMemoryAccountRepo>,
}

impl ScheduleBanService {
    pub fn new(accounts: Arc<InMemoryAccountRepo>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl TempUnscheduler for ScheduleBanService {
    async fn temp_unschedule(&self, account_id: i64, err: &UpstreamFailoverError) {
        {
            let Some(mut account) = self.accounts.accounts.get_mut(&account_id) else {
                return;
            };
            if !account.schedulable {
                return;
            }
            account.schedulable = false;
        }
        tracing::warn!(
            account_id,
            status = err.status_code,
            window_secs = TEMP_UNSCHEDULE_WINDOW.as_secs(),
            "account temporarily unscheduled after repeated retryable errors"
        );

        let accounts = Arc::clone(&self.accounts);
        tokio::spawn(async move {
            tokio::time::sleep(TEMP_UNSCHEDULE_WINDOW).await;
            if let Some(mut account) = accounts.accounts.get_mut(&account_id) {
                account.schedulable = true;
                tracing::info!(account_id, "temp unschedule window elapsed, back in rotation");
            }
        });
    }
}

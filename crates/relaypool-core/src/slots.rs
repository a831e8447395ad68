//! Per-account concurrency slots.
//!
//! Each account's in-flight requests are a Redis sorted set of holder
//! ids scored by their expiry deadline. Acquire purges expired holds,
//! checks capacity, and inserts in one Lua script; release is an
//! idempotent ZREM. The watchdog sweep reclaims holds leaked by crashed
//! tasks.

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use relaypool_types::AccountLoadInfo;

use crate::redis_store::{run_with_cancel, RedisStore, StoreError};

// KEYS[1] slot set; ARGV: now, capacity, deadline, holder, set ttl.
const SLOT_ACQUIRE_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[2]) then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[5]))
return 1
"#;

#[async_trait]
pub trait ConcurrencyCache: Send + Sync {
    /// Try to take a slot; `false` when the account is saturated.
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        account_id: i64,
        max_concurrency: i32,
        holder: &str,
    ) -> Result<bool, StoreError>;

    /// Idempotent; must be called exactly once per successful acquire.
    async fn release(&self, account_id: i64, holder: &str) -> Result<(), StoreError>;

    async fn current_concurrency(
        &self,
        cancel: &CancellationToken,
        account_id: i64,
    ) -> Result<i32, StoreError>;

    /// Load snapshot for a candidate set: concurrency and derived load
    /// rate against each account's capacity.
    async fn load_batch(
        &self,
        cancel: &CancellationToken,
        accounts: &[(i64, i32)],
    ) -> Result<std::collections::HashMap<i64, AccountLoadInfo>, StoreError>;

    /// Watchdog: purge expired holds for an account.
    async fn cleanup_expired(&self, account_id: i64) -> Result<(), StoreError>;
}

pub struct RedisSlotCache {
    store: RedisStore,
    hold_secs: u64,
    acquire_script: redis::Script,
}

impl RedisSlotCache {
    pub fn new(store: RedisStore, hold_secs: u64) -> Self {
        Self { store, hold_secs, acquire_script: redis::Script::new(SLOT_ACQUIRE_SCRIPT) }
    }

    fn slot_key(account_id: i64) -> String {
        format!("ag:slots:{account_id}")
    }
}

#[async_trait]
impl ConcurrencyCache for RedisSlotCache {
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        account_id: i64,
        max_concurrency: i32,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp();
        let deadline = now + self.hold_secs as i64;
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let acquired: i64 = run_with_cancel(
            cancel,
            self.acquire_script
                .key(Self::slot_key(account_id))
                .arg(now)
                .arg(max_concurrency)
                .arg(deadline)
                .arg(holder)
                .arg(self.hold_secs * 2)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(acquired == 1)
    }

    async fn release(&self, account_id: i64, holder: &str) -> Result<(), StoreError> {
        // Deliberately not cancellation-gated: release must run on the
        // cancel path too.
        let mut conn = self.store.connection().await?;
        let _: u64 = conn.zrem(Self::slot_key(account_id), holder).await?;
        Ok(())
    }

    async fn current_concurrency(
        &self,
        cancel: &CancellationToken,
        account_id: i64,
    ) -> Result<i32, StoreError> {
        let now = Utc::now().timestamp();
        let key = Self::slot_key(account_id);
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let _: u64 =
            run_with_cancel(cancel, conn.zrembyscore(&key, "-inf", now)).await?;
        let count: i64 = run_with_cancel(cancel, conn.zcard(&key)).await?;
        Ok(count as i32)
    }

    async fn load_batch(
        &self,
        cancel: &CancellationToken,
        accounts: &[(i64, i32)],
    ) -> Result<std::collections::HashMap<i64, AccountLoadInfo>, StoreError> {
        let mut out = std::collections::HashMap::new();
        for &(account_id, max_concurrency) in accounts {
            let current = self.current_concurrency(cancel, account_id).await?;
            let load_rate = if max_concurrency > 0 {
                (current * 100) / max_concurrency
            } else {
                0
            };
            out.insert(
                account_id,
                AccountLoadInfo { current_concurrency: current, load_rate, waiting_count: 0 },
            );
        }
        Ok(out)
    }

    async fn cleanup_expired(&self, account_id: i64) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let mut conn = self.store.connection().await?;
        let removed: u64 = conn.zrembyscore(Self::slot_key(account_id), "-inf", now).await?;
        if removed > 0 {
            tracing::info!(account_id, removed, "slot watchdog reclaimed expired holds");
        }
        Ok(())
    }
}

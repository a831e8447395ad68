//! Per-(account, model) load accounting.
//!
//! Counters are best-effort and expire after 24 hours; the scheduler
//! tolerates staleness of up to one pipeline. Keys:
//! `ag:model_load:{account_id}:{model}` and
//! `ag:model_last_used:{account_id}:{model}`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use relaypool_types::ModelLoadInfo;

use crate::redis_store::{run_with_cancel, RedisStore, StoreError};

const LOAD_TTL_SECS: u64 = 24 * 60 * 60;

#[async_trait]
pub trait LoadStore: Send + Sync {
    /// Bump the call counter and stamp last-used for a completed
    /// dispatch. One atomic pipeline.
    async fn record_call(
        &self,
        cancel: &CancellationToken,
        account_id: i64,
        model: &str,
    ) -> Result<(), StoreError>;

    /// Batch read for a candidate set; accounts without entries are
    /// absent from the result (missing means cold). Each account is
    /// read under its own model key, since `model_mapping` can make the
    /// served model differ per account.
    async fn get_batch(
        &self,
        cancel: &CancellationToken,
        keys: &[(i64, String)],
    ) -> Result<HashMap<i64, ModelLoadInfo>, StoreError>;
}

pub struct RedisLoadStore {
    store: RedisStore,
}

impl RedisLoadStore {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    fn load_key(account_id: i64, model: &str) -> String {
        format!("ag:model_load:{account_id}:{model}")
    }

    fn last_used_key(account_id: i64, model: &str) -> String {
        format!("ag:model_last_used:{account_id}:{model}")
    }
}

#[async_trait]
impl LoadStore for RedisLoadStore {
    async fn record_call(
        &self,
        cancel: &CancellationToken,
        account_id: i64,
        model: &str,
    ) -> Result<(), StoreError> {
        let load_key = Self::load_key(account_id, model);
        let last_used_key = Self::last_used_key(account_id, model);
        let now = Utc::now().to_rfc3339();

        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(&load_key, 1)
            .expire(&load_key, LOAD_TTL_SECS as i64)
            .set_ex(&last_used_key, now, LOAD_TTL_SECS);
        let _: () = run_with_cancel(cancel, pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn get_batch(
        &self,
        cancel: &CancellationToken,
        keys: &[(i64, String)],
    ) -> Result<HashMap<i64, ModelLoadInfo>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let mut pipe = redis::pipe();
        for (id, model) in keys {
            pipe.get(Self::load_key(*id, model)).get(Self::last_used_key(*id, model));
        }
        let values: Vec<Option<String>> =
            run_with_cancel(cancel, pipe.query_async(&mut conn)).await?;

        let mut out = HashMap::new();
        for (index, &(id, _)) in keys.iter().enumerate() {
            let call_count = values
                .get(index * 2)
                .and_then(|v| v.as_deref())
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let last_used_at: Option<DateTime<Utc>> = values
                .get(index * 2 + 1)
                .and_then(|v| v.as_deref())
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc));
            if call_count > 0 || last_used_at.is_some() {
                out.insert(id, ModelLoadInfo { call_count, last_used_at });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_redis_url() -> Option<String> {
        std::env::var("REDIS_URL").ok().filter(|value| !value.trim().is_empty())
    }

    #[tokio::test]
    async fn record_then_batch_read() {
        let Some(url) = env_redis_url() else { return };
        let store = RedisLoadStore::new(RedisStore::new(url).expect("client"));
        let cancel = CancellationToken::new();
        let account_id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64;

        store.record_call(&cancel, account_id, "claude-sonnet-4-5").await.expect("record");
        store.record_call(&cancel, account_id, "claude-sonnet-4-5").await.expect("record");

        let batch = store
            .get_batch(
                &cancel,
                &[
                    (account_id, "claude-sonnet-4-5".to_string()),
                    (account_id + 1, "claude-sonnet-4-5".to_string()),
                ],
            )
            .await
            .expect("batch");
        let info = batch.get(&account_id).expect("recorded entry");
        assert_eq!(info.call_count, 2);
        assert!(info.last_used_at.is_some());
        assert!(!batch.contains_key(&(account_id + 1)), "missing entries imply zero");
    }
}

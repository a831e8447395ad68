//! Redis-backed sticky-session store.
//!
//! Flat bindings live at `sticky_session:{group_id}:{session_hash}`.
//! The digest trie is a hash per (group_id, prefix_hash); both lookup
//! and insert run as server-side Lua so a longest-prefix walk costs one
//! round-trip and hits refresh the container TTL atomically.

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use crate::redis_store::{run_with_cancel, RedisStore, StoreError};

use super::{format_session_value, parse_session_value, SessionBinding, SessionStore};

const STICKY_SESSION_PREFIX: &str = "sticky_session:";

// Walk from the full chain toward the first segment, stripping one
// "-"-delimited segment per step; the first hit wins and refreshes TTL.
const TRIE_FIND_SCRIPT: &str = r#"
local chain = ARGV[1]
local ttl = tonumber(ARGV[2])

local val = redis.call('HGET', KEYS[1], chain)
if val and val ~= "" then
    redis.call('EXPIRE', KEYS[1], ttl)
    return val
end

local path = chain
while true do
    local i = string.find(path, "-[^-]*$")
    if not i or i <= 1 then
        break
    end
    path = string.sub(path, 1, i - 1)
    val = redis.call('HGET', KEYS[1], path)
    if val and val ~= "" then
        redis.call('EXPIRE', KEYS[1], ttl)
        return val
    end
end

return nil
"#;

const TRIE_SAVE_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
return "OK"
"#;

pub struct RedisSessionStore {
    store: RedisStore,
    ttl_secs: u64,
    find_script: redis::Script,
    save_script: redis::Script,
}

impl RedisSessionStore {
    pub fn new(store: RedisStore, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl_secs,
            find_script: redis::Script::new(TRIE_FIND_SCRIPT),
            save_script: redis::Script::new(TRIE_SAVE_SCRIPT),
        }
    }

    fn session_key(group_id: i64, session_hash: &str) -> String {
        format!("{STICKY_SESSION_PREFIX}{group_id}:{session_hash}")
    }

    fn trie_key(group_id: i64, prefix_hash: &str) -> String {
        format!("{STICKY_SESSION_PREFIX}trie:{group_id}:{prefix_hash}")
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        session_hash: &str,
    ) -> Result<Option<i64>, StoreError> {
        let key = Self::session_key(group_id, session_hash);
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        run_with_cancel(cancel, conn.get(key)).await
    }

    async fn set(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        session_hash: &str,
        account_id: i64,
    ) -> Result<(), StoreError> {
        let key = Self::session_key(group_id, session_hash);
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        run_with_cancel(cancel, conn.set_ex(key, account_id, self.ttl_secs)).await
    }

    async fn refresh(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        session_hash: &str,
    ) -> Result<(), StoreError> {
        let key = Self::session_key(group_id, session_hash);
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let _: bool = run_with_cancel(cancel, conn.expire(key, self.ttl_secs as i64)).await?;
        Ok(())
    }

    async fn delete(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        session_hash: &str,
    ) -> Result<(), StoreError> {
        let key = Self::session_key(group_id, session_hash);
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let _: u64 = run_with_cancel(cancel, conn.del(key)).await?;
        Ok(())
    }

    async fn find(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        prefix_hash: &str,
        digest_chain: &str,
    ) -> Result<Option<SessionBinding>, StoreError> {
        if digest_chain.is_empty() {
            return Ok(None);
        }
        let key = Self::trie_key(group_id, prefix_hash);
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let value: Option<String> = run_with_cancel(
            cancel,
            self.find_script
                .key(key)
                .arg(digest_chain)
                .arg(self.ttl_secs)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(value.as_deref().and_then(parse_session_value))
    }

    async fn save(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        prefix_hash: &str,
        digest_chain: &str,
        binding: &SessionBinding,
    ) -> Result<(), StoreError> {
        if digest_chain.is_empty() {
            return Ok(());
        }
        let key = Self::trie_key(group_id, prefix_hash);
        let value = format_session_value(&binding.uuid, binding.account_id);
        let mut conn = run_with_cancel(cancel, self.store.connection()).await?;
        let _: String = run_with_cancel(
            cancel,
            self.save_script
                .key(key)
                .arg(digest_chain)
                .arg(value)
                .arg(self.ttl_secs)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(())
    }
}

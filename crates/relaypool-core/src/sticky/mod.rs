//! Sticky sessions: binding conversation-prefix digests to the account
//! that served earlier turns.

mod digest;
mod store;

pub use digest::{build_digest_chain, generate_session_hash, prefix_hash};
pub use store::RedisSessionStore;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::StoreError;

/// A trie hit: the conversation uuid and bound account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub uuid: String,
    pub account_id: i64,
}

/// Encode a binding as stored in the trie.
pub fn format_session_value(uuid: &str, account_id: i64) -> String {
    format!("{uuid}:{account_id}")
}

/// Decode a trie value. The account id follows the last `:`; uuids
/// contain none.
pub fn parse_session_value(value: &str) -> Option<SessionBinding> {
    let (uuid, account_id) = value.rsplit_once(':')?;
    if uuid.is_empty() {
        return None;
    }
    let account_id = account_id.parse().ok()?;
    Some(SessionBinding { uuid: uuid.to_string(), account_id })
}

/// Store operations the orchestrator depends on; Redis in production,
/// an in-memory fake in tests.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        session_hash: &str,
    ) -> Result<Option<i64>, StoreError>;

    async fn set(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        session_hash: &str,
        account_id: i64,
    ) -> Result<(), StoreError>;

    async fn refresh(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        session_hash: &str,
    ) -> Result<(), StoreError>;

    /// Called when a bound account is observed unavailable, so the next
    /// request rebinds.
    async fn delete(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        session_hash: &str,
    ) -> Result<(), StoreError>;

    /// Longest-prefix lookup in the digest trie; a hit refreshes the
    /// container TTL.
    async fn find(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        prefix_hash: &str,
        digest_chain: &str,
    ) -> Result<Option<SessionBinding>, StoreError>;

    /// Insert the binding at the full digest chain and refresh TTL.
    async fn save(
        &self,
        cancel: &CancellationToken,
        group_id: i64,
        prefix_hash: &str,
        digest_chain: &str,
        binding: &SessionBinding,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_value_round_trip() {
        let value = format_session_value("conv-uuid-1", 42);
        let binding = parse_session_value(&value).unwrap();
        assert_eq!(binding.uuid, "conv-uuid-1");
        assert_eq!(binding.account_id, 42);
    }

    #[test]
    fn malformed_values_parse_to_none() {
        assert!(parse_session_value("").is_none());
        assert!(parse_session_value("no-separator").is_none());
        assert!(parse_session_value(":42").is_none());
        assert!(parse_session_value("uuid:not-a-number").is_none());
    }
}

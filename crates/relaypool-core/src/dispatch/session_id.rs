//! Session-id derivation for the composite upstream.
//!
//! OAuth accounts share one upstream identity across many gateway
//! users, so the client's sessionId is re-derived per account: the
//! same conversation keeps a stable id on its bound account while two
//! accounts never collide on one id.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derive a per-account session id: `-` followed by 19 decimal digits.
/// Deterministic in both inputs; empty input passes through empty.
pub fn derive_session_id(original: &str, account_id: i64) -> String {
    if original.is_empty() {
        return String::new();
    }
    let combined = format!("{original}:{account_id}");
    let digest = Sha256::digest(combined.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let n = (i64::from_be_bytes(prefix)) & 0x7FFF_FFFF_FFFF_FFFF;
    format!("-{n}")
}

/// Rewrite `request.sessionId` in a v1internal body for an OAuth
/// account. Bodies without a sessionId pass through unchanged; a
/// sessionId is never added.
pub fn replace_session_id_for_oauth(body: &[u8], account_id: i64) -> Result<Vec<u8>, serde_json::Error> {
    let mut outer: Value = serde_json::from_slice(body)?;

    let Some(inner) = outer.get_mut("request").and_then(Value::as_object_mut) else {
        return Ok(body.to_vec());
    };
    let Some(original) = inner.get("sessionId").and_then(Value::as_str) else {
        return Ok(body.to_vec());
    };
    if original.is_empty() {
        return Ok(body.to_vec());
    }

    let derived = derive_session_id(original, account_id);
    inner.insert("sessionId".into(), Value::String(derived));
    serde_json::to_vec(&outer)
}

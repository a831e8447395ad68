//! Digest derivation for sticky sessions.
//!
//! The trie key space is scoped by a system-prompt digest
//! (`prefix_hash`); within it, conversations are addressed by a chain
//! of per-turn digests `u:<hash>-m:<hash>-…` so a follow-up turn finds
//! its ancestor by longest-prefix match.

use serde_json::Value;
use sha2::{Digest, Sha256};

const TURN_DIGEST_LEN: usize = 12;
const PREFIX_HASH_LEN: usize = 16;
const SESSION_HASH_LEN: usize = 32;
const METADATA_SESSION_PREFIX: &str = "session_";

fn short_sha256(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(len);
    hex
}

fn message_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Build the digest chain for a message list. User turns contribute
/// `u:` segments, everything else `m:`.
pub fn build_digest_chain(messages: &[Value]) -> String {
    messages
        .iter()
        .map(|message| {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("");
            let kind = if role == "user" { 'u' } else { 'm' };
            let text = message.get("content").map(message_text).unwrap_or_default();
            format!("{kind}:{}", short_sha256(&text, TURN_DIGEST_LEN))
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Scope digest over the system prompt; conversations with different
/// system prompts never share a trie.
pub fn prefix_hash(system: &str) -> String {
    short_sha256(system, PREFIX_HASH_LEN)
}

/// Derive the flat session hash for a request.
///
/// An explicit metadata session id wins (its `session_` prefix is
/// stripped); otherwise the hash covers system prompt and message
/// digests together, so the same client tool with the same conversation
/// sticks while different conversations spread across accounts.
pub fn generate_session_hash(
    metadata_session_id: Option<&str>,
    system: Option<&str>,
    messages: &[Value],
) -> Option<String> {
    if let Some(id) = metadata_session_id {
        let id = id.trim();
        if !id.is_empty() {
            return Some(id.strip_prefix(METADATA_SESSION_PREFIX).unwrap_or(id).to_string());
        }
    }

    if system.is_none() && messages.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    if let Some(system) = system {
        hasher.update(system.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(build_digest_chain(messages).as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(SESSION_HASH_LEN);
    Some(hex)
}

//! Warmup interception.
//!
//! Some client tools fire a short "Warmup" message before real traffic.
//! Accounts flagged with `intercept_warmup_requests` answer these with
//! a canned response instead of spending an upstream call.

use serde_json::Value;

use super::request::ParsedRequest;

const WARMUP_TEXT: &str = "Warmup";
const WARMUP_MAX_MESSAGES: usize = 2;

fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Whether the request matches the well-known warmup shape: a short
/// conversation whose last user message is exactly "Warmup".
pub fn is_warmup_request(parsed: &ParsedRequest) -> bool {
    if parsed.messages.is_empty() || parsed.messages.len() > WARMUP_MAX_MESSAGES {
        return false;
    }
    let Some(last_user) = parsed
        .messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
    else {
        return false;
    };
    message_text(last_user).trim() == WARMUP_TEXT
}

/// Canned warmup reply, echoing the requested model.
pub fn warmup_response(model: &str) -> Value {
    serde_json::json!({
        "id": "msg_mock_warmup",
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": "New Conversation"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 0, "output_tokens": 0},
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    fn parsed(messages: Value) -> ParsedRequest {
        let body = serde_json::to_vec(&json!({
            "model": "claude-sonnet-4-5",
            "messages": messages,
        }))
        .unwrap();
        ParsedRequest::from_claude(Bytes::from(body)).unwrap()
    }

    #[test]
    fn plain_warmup_matches() {
        assert!(is_warmup_request(&parsed(json!([
            {"role": "user", "content": "Warmup"}
        ]))));
    }

    #[test]
    fn warmup_in_text_blocks_matches() {
        assert!(is_warmup_request(&parsed(json!([
            {"role": "user", "content": [{"type": "text", "text": " Warmup "}]}
        ]))));
    }

    #[test]
    fn real_traffic_does_not_match() {
        assert!(!is_warmup_request(&parsed(json!([
            {"role": "user", "content": "Warmup please explain lifetimes"}
        ]))));
        assert!(!is_warmup_request(&parsed(json!([
            {"role": "user", "content": "warmup"}
        ]))));
        assert!(!is_warmup_request(&parsed(json!([]))));
    }

    #[test]
    fn long_conversations_do_not_match() {
        assert!(!is_warmup_request(&parsed(json!([
            {"role": "user", "content": "hello"},
            {"role": "assistant", "content": "hi"},
            {"role": "user", "content": "Warmup"},
        ]))));
    }

    #[test]
    fn canned_response_echoes_model() {
        let response = warmup_response("claude-opus-4-5");
        assert_eq!(response["id"], "msg_mock_warmup");
        assert_eq!(response["model"], "claude-opus-4-5");
        assert_eq!(response["content"][0]["text"], "New Conversation");
    }
}

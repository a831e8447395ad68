//! Normalized view of an inference request, shared by the Anthropic and
//! Gemini-native ingress shapes.

use bytes::Bytes;
use serde_json::Value;

use relaypool_types::GatewayError;

use crate::sticky::{build_digest_chain, generate_session_hash, prefix_hash};

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub model: String,
    pub stream: bool,
    pub metadata_session_id: Option<String>,
    pub system: Option<String>,
    /// Normalized `{role, content}` messages.
    pub messages: Vec<Value>,
    /// Original body, forwarded upstream untouched (modulo session-id
    /// rewriting for OAuth accounts).
    pub body: Bytes,
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

impl ParsedRequest {
    /// Parse an Anthropic-compatible `/v1/messages` body.
    pub fn from_claude(body: Bytes) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::InvalidRequest { message: err.to_string() })?;

        let model = value
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidRequest { message: "missing model".into() })?
            .to_string();
        let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let metadata_session_id = value
            .pointer("/metadata/user_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty());
        let system = value.get("system").map(text_of).filter(|s| !s.is_empty());
        let messages = value
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(Self { model, stream, metadata_session_id, system, messages, body })
    }

    /// Parse a Gemini-native `:generateContent` body; the model and
    /// stream flag come from the path.
    pub fn from_gemini(model: &str, stream: bool, body: Bytes) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::InvalidRequest { message: err.to_string() })?;

        let system = value
            .pointer("/systemInstruction/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|s| !s.is_empty());

        let messages = value
            .get("contents")
            .and_then(Value::as_array)
            .map(|contents| {
                contents
                    .iter()
                    .map(|content| {
                        let role = match content.get("role").and_then(Value::as_str) {
                            Some("user") => "user",
                            _ => "assistant",
                        };
                        let text = content
                            .pointer("/parts")
                            .and_then(Value::as_array)
                            .map(|parts| {
                                parts
                                    .iter()
                                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                                    .collect::<Vec<_>>()
                                    .join(" ")
                            })
                            .unwrap_or_default();
                        serde_json::json!({"role": role, "content": text})
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            model: model.to_string(),
            stream,
            metadata_session_id: None,
            system,
            messages,
            body,
        })
    }

    pub fn session_hash(&self) -> Option<String> {
        generate_session_hash(
            self.metadata_session_id.as_deref(),
            self.system.as_deref(),
            &self.messages,
        )
    }

    pub fn digest_chain(&self) -> String {
        build_digest_chain(&self.messages)
    }

    pub fn prefix_hash(&self) -> String {
        prefix_hash(self.system.as_deref().unwrap_or(""))
    }
}

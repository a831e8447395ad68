//! Cache-billing simulation.
//!
//! The composite upstream reports Gemini-style usage
//! (promptTokenCount / cachedContentTokenCount); Claude clients expect
//! input / cache_read / cache_creation. The split estimates how many of
//! the uncached prompt tokens sit after the last cache breakpoint
//! (billable as plain input) versus before it (cache creation). The
//! estimate is best-effort; bit-exact tokenizer parity is a non-goal.

use serde_json::Value;

/// Rough token estimate: ~4 chars per token for ASCII-heavy text, ~1
/// rune per token for CJK-heavy text. Deterministic and whitespace-safe.
pub fn estimate_tokens_for_text(text: &str) -> i64 {
    let text = text.trim();
    if text.is_empty() {
        return 0;
    }
    let runes: Vec<char> = text.chars().collect();
    let ascii = runes.iter().filter(|c| c.is_ascii()).count();
    let ascii_ratio = ascii as f64 / runes.len() as f64;
    if ascii_ratio >= 0.8 {
        ((runes.len() + 3) / 4) as i64
    } else {
        runes.len() as i64
    }
}

/// Split uncached prompt tokens into (input, cache_creation).
///
/// `estimated_input` is clamped into [0, uncached]; non-positive
/// uncached totals split to (0, 0).
pub fn split_usage_for_cache_billing(
    uncached_prompt_tokens: i64,
    estimated_input_tokens: i64,
) -> (i64, i64) {
    if uncached_prompt_tokens <= 0 {
        return (0, 0);
    }
    let input = estimated_input_tokens.clamp(0, uncached_prompt_tokens);
    (input, uncached_prompt_tokens - input)
}

fn has_cache_control(block: &Value) -> bool {
    block.get("cache_control").is_some_and(|cc| !cc.is_null())
}

fn estimate_tokens_for_block(block: &Value) -> i64 {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => {
            estimate_tokens_for_text(block.get("text").and_then(Value::as_str).unwrap_or(""))
        },
        Some("thinking") => {
            estimate_tokens_for_text(block.get("thinking").and_then(Value::as_str).unwrap_or(""))
        },
        Some("tool_use") => {
            let mut total =
                estimate_tokens_for_text(block.get("name").and_then(Value::as_str).unwrap_or(""));
            if let Some(input) = block.get("input") {
                if !input.is_null() {
                    total += estimate_tokens_for_text(&input.to_string());
                }
            }
            total
        },
        Some("tool_result") => {
            let content = block.get("content").map(|c| match c {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            estimate_tokens_for_text(content.as_deref().unwrap_or(""))
        },
        _ => 0,
    }
}

fn estimate_tokens_for_content(content: &Value, start_block_index: usize) -> i64 {
    match content {
        Value::String(text) => {
            if start_block_index > 0 {
                0
            } else {
                estimate_tokens_for_text(text)
            }
        },
        Value::Array(blocks) => blocks
            .iter()
            .skip(start_block_index)
            .map(estimate_tokens_for_block)
            .sum::<i64>()
            .max(0),
        _ => 0,
    }
}

/// Estimate the tokens after the last cache breakpoint across the
/// message list. Returns `None` when no block carries `cache_control`.
pub fn estimate_input_tokens_after_last_cache_breakpoint(messages: &[Value]) -> Option<i64> {
    let mut breakpoint: Option<(usize, usize)> = None;
    'outer: for (mi, message) in messages.iter().enumerate().rev() {
        let Some(blocks) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for (bi, block) in blocks.iter().enumerate().rev() {
            if has_cache_control(block) {
                breakpoint = Some((mi, bi));
                break 'outer;
            }
        }
    }
    let (mi, bi) = breakpoint?;

    let mut total = 0;
    if let Some(content) = messages[mi].get("content") {
        total += estimate_tokens_for_content(content, bi + 1);
    }
    for message in &messages[mi + 1..] {
        if let Some(content) = message.get("content") {
            total += estimate_tokens_for_content(content, 0);
        }
    }
    Some(total.max(0))
}

/// Convert input tokens to cache-read billing on a response usage
/// object. Applied when a sticky session had to rebind: the rebind
/// misses the upstream prompt cache, and the user is still billed at
/// cache-read rates for the prefix.
pub fn force_cache_read_billing(usage: &mut Value, estimated_input_tokens: i64) {
    let Some(usage) = usage.as_object_mut() else {
        return;
    };
    let input = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let cache_read = usage.get("cache_read_input_tokens").and_then(Value::as_i64).unwrap_or(0);

    let (kept_input, to_cache_read) = split_usage_for_cache_billing(input, estimated_input_tokens);
    usage.insert("input_tokens".into(), Value::from(kept_input));
    usage.insert("cache_read_input_tokens".into(), Value::from(cache_read + to_cache_read));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_clamps_estimate_into_range() {
        assert_eq!(split_usage_for_cache_billing(100, 30), (30, 70));
        assert_eq!(split_usage_for_cache_billing(100, 0), (0, 100));
        assert_eq!(split_usage_for_cache_billing(100, 100), (100, 0));
        assert_eq!(split_usage_for_cache_billing(100, 150), (100, 0));
        assert_eq!(split_usage_for_cache_billing(100, -5), (0, 100));
    }

    #[test]
    fn split_non_positive_totals() {
        assert_eq!(split_usage_for_cache_billing(0, 10), (0, 0));
        assert_eq!(split_usage_for_cache_billing(-7, 10), (0, 0));
    }

    #[test]
    fn ascii_text_estimates_four_chars_per_token() {
        assert_eq!(estimate_tokens_for_text(""), 0);
        assert_eq!(estimate_tokens_for_text("   "), 0);
        assert_eq!(estimate_tokens_for_text("abcd"), 1);
        assert_eq!(estimate_tokens_for_text("abcde"), 2);
        assert_eq!(estimate_tokens_for_text(&"a".repeat(400)), 100);
    }

    #[test]
    fn cjk_text_estimates_one_rune_per_token() {
        let text = "你好世界你好世界";
        assert_eq!(estimate_tokens_for_text(text), 8);
    }

    #[test]
    fn no_breakpoint_returns_none() {
        let messages = vec![json!({
            "role": "user",
            "content": [{"type": "text", "text": "hello there"}],
        })];
        assert_eq!(estimate_input_tokens_after_last_cache_breakpoint(&messages), None);
    }

    #[test]
    fn estimates_only_content_after_last_breakpoint() {
        let messages = vec![
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "long cached prefix that does not count"},
                    {"type": "text", "text": "before", "cache_control": {"type": "ephemeral"}},
                    {"type": "text", "text": "abcdefgh"},
                ],
            }),
            json!({
                "role": "assistant",
                "content": [{"type": "text", "text": "abcd"}],
            }),
        ];
        // 8 ascii chars → 2 tokens, plus 4 chars → 1 token.
        assert_eq!(estimate_input_tokens_after_last_cache_breakpoint(&messages), Some(3));
    }

    #[test]
    fn string_content_after_breakpoint_message_counts_fully() {
        let messages = vec![
            json!({
                "role": "user",
                "content": [{"type": "text", "text": "prefix", "cache_control": {"type": "ephemeral"}}],
            }),
            json!({"role": "user", "content": "abcdefghijkl"}),
        ];
        assert_eq!(estimate_input_tokens_after_last_cache_breakpoint(&messages), Some(3));
    }

    #[test]
    fn force_billing_moves_input_to_cache_read() {
        let mut usage = json!({
            "input_tokens": 100,
            "output_tokens": 7,
            "cache_read_input_tokens": 20,
        });
        force_cache_read_billing(&mut usage, 30);
        assert_eq!(usage["input_tokens"], 30);
        assert_eq!(usage["cache_read_input_tokens"], 90);
        assert_eq!(usage["output_tokens"], 7, "output untouched");
    }

    #[test]
    fn force_billing_with_no_estimate_moves_everything() {
        let mut usage = json!({"input_tokens": 50});
        force_cache_read_billing(&mut usage, 0);
        assert_eq!(usage["input_tokens"], 0);
        assert_eq!(usage["cache_read_input_tokens"], 50);
    }
}

//! Token-usage extraction and static-table cost calculation.
//!
//! Providers report token counts in several shapes (OpenAI snake_case,
//! Claude input/output, nested `tokenUsage`/`token_usage` records, bare
//! top-level fields). Extraction tries each shape in order and validates
//! every number before trusting it; any failure yields `None` rather than
//! an error, since call sites treat missing usage as "no data".

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on a plausible token count. Anything larger is treated as
/// corrupt provider output.
const MAX_TOKEN_COUNT: f64 = 1e9;

/// Validated token usage for one completed turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// USD cost, when the (provider, model) pair is in the pricing table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

// ─── Pricing Table ──────────────────────────────────────────────────────

/// (provider, model) → (prompt USD, completion USD) per 1M tokens.
/// Static and read-only; unknown pairs yield no cost.
const PRICING: &[(&str, &str, f64, f64)] = &[
    ("codex", "gpt-4o", 2.50, 10.00),
    ("codex", "gpt-4o-mini", 0.15, 0.60),
    ("codex", "o3-mini", 1.10, 4.40),
    ("copilot", "gpt-4o", 2.50, 10.00),
    ("copilot", "gpt-4o-mini", 0.15, 0.60),
    ("claude", "claude-3-5-sonnet-20241022", 3.00, 15.00),
    ("claude", "claude-3-5-haiku-20241022", 0.80, 4.00),
    ("claude", "claude-sonnet-4-20250514", 3.00, 15.00),
    ("claude_mcp", "claude-3-5-sonnet-20241022", 3.00, 15.00),
    ("claude_mcp", "claude-sonnet-4-20250514", 3.00, 15.00),
    ("opencode", "claude-sonnet-4-20250514", 3.00, 15.00),
    ("opencode", "gpt-4o", 2.50, 10.00),
];

/// Look up the static pricing row and compute the USD cost, rounded to six
/// decimal places. Returns `None` when the (provider, model) pair is not in
/// the table or a count fails validation.
pub fn calculate_cost(
    provider: &str,
    model: &str,
    prompt_tokens: u64,
    completion_tokens: u64,
) -> Option<f64> {
    // Defense in depth: counts are validated again even though extraction
    // already did, since callers may pass counts from elsewhere.
    if prompt_tokens as f64 > MAX_TOKEN_COUNT || completion_tokens as f64 > MAX_TOKEN_COUNT {
        return None;
    }

    let (_, _, prompt_rate, completion_rate) = PRICING
        .iter()
        .find(|(p, m, _, _)| *p == provider && *m == model)?;

    let cost = (prompt_tokens as f64 / 1_000_000.0) * prompt_rate
        + (completion_tokens as f64 / 1_000_000.0) * completion_rate;
    Some((cost * 1_000_000.0).round() / 1_000_000.0)
}

// ─── Extraction ─────────────────────────────────────────────────────────

/// Validate a raw JSON number as a token count.
///
/// Rejects NaN, ±Infinity, negatives, non-numbers, and values above 1e9.
fn validate_token_count(value: &Value) -> Option<u64> {
    let n = value.as_f64()?;
    if !n.is_finite() || n < 0.0 || n > MAX_TOKEN_COUNT {
        return None;
    }
    Some(n as u64)
}

/// Read a (prompt, completion) pair from a record using the given key names.
fn read_pair(record: &Value, prompt_key: &str, completion_key: &str) -> Option<(u64, u64)> {
    let prompt = validate_token_count(record.get(prompt_key)?)?;
    let completion = validate_token_count(record.get(completion_key)?)?;
    Some((prompt, completion))
}

/// Extract validated token usage from a raw provider event.
///
/// Tries, in order: OpenAI-style `usage.prompt_tokens`/`completion_tokens`,
/// Claude-style `usage.input_tokens`/`output_tokens`, a camelCase
/// `tokenUsage` record, a snake_case `token_usage` record, then top-level
/// fields. Returns `None` if either count is missing or invalid.
pub fn extract_token_usage(raw: &Value, provider: &str, model: Option<&str>) -> Option<TokenUsage> {
    let candidates: [(&Value, &str, &str); 6] = match raw.get("usage") {
        Some(usage) => [
            (usage, "prompt_tokens", "completion_tokens"),
            (usage, "input_tokens", "output_tokens"),
            (raw.get("tokenUsage").unwrap_or(&Value::Null), "promptTokens", "completionTokens"),
            (raw.get("token_usage").unwrap_or(&Value::Null), "prompt_tokens", "completion_tokens"),
            (raw, "prompt_tokens", "completion_tokens"),
            (raw, "input_tokens", "output_tokens"),
        ],
        None => [
            (raw.get("tokenUsage").unwrap_or(&Value::Null), "promptTokens", "completionTokens"),
            (raw.get("tokenUsage").unwrap_or(&Value::Null), "prompt_tokens", "completion_tokens"),
            (raw.get("token_usage").unwrap_or(&Value::Null), "prompt_tokens", "completion_tokens"),
            (raw.get("token_usage").unwrap_or(&Value::Null), "input_tokens", "output_tokens"),
            (raw, "prompt_tokens", "completion_tokens"),
            (raw, "input_tokens", "output_tokens"),
        ],
    };

    let (prompt_tokens, completion_tokens) = candidates
        .iter()
        .find_map(|(record, pk, ck)| read_pair(record, pk, ck))?;

    let cost_usd = model.and_then(|m| calculate_cost(provider, m, prompt_tokens, completion_tokens));

    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        cost_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cost_anchor_row() {
        assert_eq!(calculate_cost("codex", "gpt-4o", 1000, 1000), Some(0.0125));
        assert_eq!(calculate_cost("codex", "gpt-4o", 0, 0), Some(0.0));
    }

    #[test]
    fn test_cost_unknown_pair_is_none() {
        assert_eq!(calculate_cost("codex", "no-such-model", 1000, 1000), None);
        assert_eq!(calculate_cost("no-such-provider", "gpt-4o", 1000, 1000), None);
    }

    #[test]
    fn test_cost_rejects_absurd_counts() {
        assert_eq!(calculate_cost("codex", "gpt-4o", 2_000_000_000, 0), None);
    }

    #[test]
    fn test_extract_openai_shape() {
        let raw = json!({"usage": {"prompt_tokens": 120, "completion_tokens": 30}});
        let usage = extract_token_usage(&raw, "codex", Some("gpt-4o")).unwrap();
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(usage.cost_usd, Some(0.0006));
    }

    #[test]
    fn test_extract_claude_shape() {
        let raw = json!({"usage": {"input_tokens": 50, "output_tokens": 10}});
        let usage = extract_token_usage(&raw, "claude", None).unwrap();
        assert_eq!(usage.prompt_tokens, 50);
        assert_eq!(usage.cost_usd, None);
    }

    #[test]
    fn test_extract_nested_and_top_level_shapes() {
        let camel = json!({"tokenUsage": {"promptTokens": 5, "completionTokens": 7}});
        assert_eq!(extract_token_usage(&camel, "codex", None).unwrap().total_tokens, 12);

        let snake = json!({"token_usage": {"prompt_tokens": 3, "completion_tokens": 4}});
        assert_eq!(extract_token_usage(&snake, "codex", None).unwrap().total_tokens, 7);

        let top = json!({"prompt_tokens": 1, "completion_tokens": 2});
        assert_eq!(extract_token_usage(&top, "codex", None).unwrap().total_tokens, 3);
    }

    #[test]
    fn test_extract_rejects_invalid_numbers() {
        for bad in [
            json!({"usage": {"prompt_tokens": -1, "completion_tokens": 5}}),
            json!({"usage": {"prompt_tokens": 2_000_000_000.0, "completion_tokens": 5}}),
            json!({"usage": {"prompt_tokens": "NaN", "completion_tokens": 5}}),
            json!({"usage": {"prompt_tokens": 5}}),
            json!({"usage": null}),
            json!({}),
        ] {
            assert!(extract_token_usage(&bad, "codex", None).is_none(), "{bad}");
        }
    }
}

//! Token counting for cost estimation.
//!
//! Providers that return a `usage` block are authoritative; this module is
//! the fallback for responses without one and for prompt-side estimates
//! before dispatch. Encoders are BPE instances keyed by model family and
//! built lazily on first use, then cached for the process lifetime.

use dashmap::DashMap;
use lazy_static::lazy_static;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

lazy_static! {
    static ref BPE_CACHE: DashMap<String, Arc<tiktoken_rs::CoreBPE>> = DashMap::new();
}

/// Map a model name onto the encoder family it tokenizes with.
///
/// Azure deployments reuse the underlying OpenAI model's encoder. Claude
/// models have no published BPE; the cl100k approximation is close enough
/// for estimation and keeps counting local.
fn encoder_key(model: &str) -> String {
    let lower = model.to_lowercase();
    if lower.contains("gpt-4o") || lower.starts_with("o1") || lower.starts_with("o3") {
        "o200k_base".to_string()
    } else if lower.starts_with("gpt-") {
        lower
    } else {
        "cl100k_base".to_string()
    }
}

fn get_cached_bpe(model: &str) -> Option<Arc<tiktoken_rs::CoreBPE>> {
    let key = encoder_key(model);
    if let Some(bpe) = BPE_CACHE.get(&key) {
        return Some(bpe.clone());
    }

    let built = match key.as_str() {
        "o200k_base" => tiktoken_rs::o200k_base(),
        "cl100k_base" => tiktoken_rs::cl100k_base(),
        other => tiktoken_rs::get_bpe_from_model(other).or_else(|_| tiktoken_rs::cl100k_base()),
    };

    match built {
        Ok(bpe) => {
            let bpe = Arc::new(bpe);
            BPE_CACHE.insert(key, bpe.clone());
            Some(bpe)
        }
        Err(e) => {
            warn!(model, error = %e, "failed to build BPE encoder");
            None
        }
    }
}

/// Count tokens in `text` with the encoder for `model`. Returns 0 when no
/// encoder can be built, which callers treat as "unknown".
pub fn count_tokens(text: &str, model: &str) -> usize {
    match get_cached_bpe(model) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => 0,
    }
}

/// Per-message overhead applied by chat completion endpoints.
const TOKENS_PER_MESSAGE: usize = 3;
const REPLY_PRIMER_TOKENS: usize = 3;

/// Estimate prompt tokens for a chat-completion request body.
///
/// Walks `messages[*].content` (string or content-part array) and applies
/// the per-message framing overhead.
pub fn count_chat_prompt_tokens(body: &Value, model: &str) -> usize {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return 0;
    };

    let mut total = REPLY_PRIMER_TOKENS;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        if let Some(role) = message.get("role").and_then(Value::as_str) {
            total += count_tokens(role, model);
        }
        match message.get("content") {
            Some(Value::String(text)) => total += count_tokens(text, model),
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        total += count_tokens(text, model);
                    }
                }
            }
            _ => {}
        }
    }
    total
}

/// Estimate completion tokens from a chat-completion response body by
/// tokenizing each choice's message content.
pub fn count_chat_completion_tokens(body: &Value, model: &str) -> usize {
    let Some(choices) = body.get("choices").and_then(Value::as_array) else {
        return 0;
    };

    choices
        .iter()
        .filter_map(|choice| {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
        })
        .map(|text| count_tokens(text, model))
        .sum()
}

/// Estimate prompt tokens for an embeddings request (`input` may be a
/// string or an array of strings).
pub fn count_embeddings_input_tokens(body: &Value, model: &str) -> usize {
    match body.get("input") {
        Some(Value::String(text)) => count_tokens(text, model),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|text| count_tokens(text, model))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encoder_key_families() {
        assert_eq!(encoder_key("gpt-4o-mini"), "o200k_base");
        assert_eq!(encoder_key("o1-preview"), "o200k_base");
        assert_eq!(encoder_key("gpt-4"), "gpt-4");
        assert_eq!(encoder_key("claude-3-opus"), "cl100k_base");
        assert_eq!(encoder_key("text-embedding-ada-002"), "cl100k_base");
    }

    #[test]
    fn test_count_tokens_nonzero_for_text() {
        assert!(count_tokens("Hello, world!", "gpt-4") > 0);
        assert!(count_tokens("Hello, world!", "claude-3-opus") > 0);
    }

    #[test]
    fn test_count_tokens_empty_text() {
        assert_eq!(count_tokens("", "gpt-4"), 0);
    }

    #[test]
    fn test_count_chat_prompt_tokens() {
        let body = json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "You are helpful."},
                {"role": "user", "content": "hi"}
            ]
        });
        let counted = count_chat_prompt_tokens(&body, "gpt-4");
        // Two messages of framing plus the primer plus content.
        assert!(counted > 2 * TOKENS_PER_MESSAGE);
    }

    #[test]
    fn test_count_chat_prompt_tokens_content_parts() {
        let body = json!({
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "describe this"}]}
            ]
        });
        assert!(count_chat_prompt_tokens(&body, "gpt-4") > 0);
    }

    #[test]
    fn test_count_chat_prompt_tokens_no_messages() {
        assert_eq!(count_chat_prompt_tokens(&json!({}), "gpt-4"), 0);
    }

    #[test]
    fn test_count_completion_tokens() {
        let body = json!({
            "choices": [
                {"message": {"role": "assistant", "content": "Hello there, how can I help?"}}
            ]
        });
        assert!(count_chat_completion_tokens(&body, "gpt-4") > 0);
    }

    #[test]
    fn test_count_embeddings_input_tokens_string_and_array() {
        let single = json!({"input": "some text"});
        let multi = json!({"input": ["one", "two"]});
        assert!(count_embeddings_input_tokens(&single, "text-embedding-ada-002") > 0);
        assert!(
            count_embeddings_input_tokens(&multi, "text-embedding-ada-002")
                >= count_embeddings_input_tokens(&single, "text-embedding-ada-002")
        );
    }
}

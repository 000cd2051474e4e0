//! Token counting and cost estimation on successful responses.
//!
//! Accounting runs after the client's bytes are already in hand and is
//! purely CPU-bound. Provider-reported usage wins; the tokenizer fallback
//! only runs when a provider omits the `usage` block. Failures here never
//! fail the request.

use serde_json::Value;

use crate::api::models::{
    AnthropicMessagesResponse, ChatCompletionResponse, EmbeddingResponse, EmbeddingResponseBase64,
};
use crate::core::database::ProviderKind;
use crate::core::tokenizer::{
    count_chat_completion_tokens, count_chat_prompt_tokens, count_embeddings_input_tokens,
};
use crate::services::pricing::{cost_micro_usd, price_for};

/// Expected shape of a 2xx response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Chat,
    /// Embeddings; `base64` reflects the request's `encoding_format` hint.
    Embeddings { base64: bool },
}

impl ResponseShape {
    /// Derive the shape from a request body's `encoding_format` hint.
    pub fn embeddings_from_request(request_body: &Value) -> Self {
        let base64 = request_body
            .get("encoding_format")
            .and_then(Value::as_str)
            .map(|f| f == "base64")
            .unwrap_or(false);
        ResponseShape::Embeddings { base64 }
    }
}

/// Accounting outcome attached to the request context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accounting {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// `None` when the model has no price; flagged below.
    pub cost_micro_usd: Option<i64>,
    pub unknown_model_price: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    #[error("cannot parse upstream response body: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Compute usage and cost for one successful response.
///
/// `model` is the model the dispatcher actually addressed; a `model` field
/// in the response body takes precedence for pricing (Azure reports the
/// underlying model there).
pub fn account(
    shape: ResponseShape,
    provider: &ProviderKind,
    model: &str,
    request_body: &Value,
    response_body: &[u8],
) -> Result<Accounting, AccountingError> {
    let (prompt_tokens, completion_tokens, response_model) = match shape {
        ResponseShape::Chat => chat_tokens(provider, model, request_body, response_body)?,
        ResponseShape::Embeddings { base64 } => {
            embeddings_tokens(base64, model, request_body, response_body)?
        }
    };

    let pricing_model = response_model.as_deref().unwrap_or(model);
    let accounting = match price_for(provider, pricing_model) {
        Some(price) => Accounting {
            prompt_tokens,
            completion_tokens,
            cost_micro_usd: Some(cost_micro_usd(price, prompt_tokens, completion_tokens)),
            unknown_model_price: false,
        },
        None => Accounting {
            prompt_tokens,
            completion_tokens,
            cost_micro_usd: None,
            unknown_model_price: true,
        },
    };
    Ok(accounting)
}

fn chat_tokens(
    provider: &ProviderKind,
    model: &str,
    request_body: &Value,
    response_body: &[u8],
) -> Result<(i64, i64, Option<String>), AccountingError> {
    if matches!(provider, ProviderKind::Anthropic) {
        let parsed: AnthropicMessagesResponse = serde_json::from_slice(response_body)?;
        if let Some(usage) = parsed.usage {
            if usage.input_tokens > 0 || usage.output_tokens > 0 {
                return Ok((usage.input_tokens, usage.output_tokens, parsed.model));
            }
        }
        let (prompt, completion) = estimate_chat_tokens(model, request_body, response_body)?;
        return Ok((prompt, completion, parsed.model));
    }

    let parsed: ChatCompletionResponse = serde_json::from_slice(response_body)?;
    if let Some(usage) = parsed.usage {
        if usage.prompt_tokens > 0 || usage.completion_tokens > 0 {
            return Ok((usage.prompt_tokens, usage.completion_tokens, parsed.model));
        }
    }
    let (prompt, completion) = estimate_chat_tokens(model, request_body, response_body)?;
    Ok((prompt, completion, parsed.model))
}

/// Tokenizer fallback for providers that omit usage.
fn estimate_chat_tokens(
    model: &str,
    request_body: &Value,
    response_body: &[u8],
) -> Result<(i64, i64), AccountingError> {
    let response_json: Value = serde_json::from_slice(response_body)?;
    let prompt = count_chat_prompt_tokens(request_body, model) as i64;
    let completion = count_chat_completion_tokens(&response_json, model) as i64;
    Ok((prompt, completion))
}

fn embeddings_tokens(
    base64: bool,
    model: &str,
    request_body: &Value,
    response_body: &[u8],
) -> Result<(i64, i64, Option<String>), AccountingError> {
    let (usage, response_model) = if base64 {
        let parsed: EmbeddingResponseBase64 = serde_json::from_slice(response_body)?;
        (parsed.usage, parsed.model)
    } else {
        let parsed: EmbeddingResponse = serde_json::from_slice(response_body)?;
        (parsed.usage, parsed.model)
    };

    let prompt = match usage {
        Some(u) if u.prompt_tokens > 0 => u.prompt_tokens,
        _ => count_embeddings_input_tokens(request_body, model) as i64,
    };
    // Embeddings have no completion side.
    Ok((prompt, 0, response_model))
}

//! Wire models for the provider surfaces the gateway fronts.
//!
//! Parse-side structs are tolerant: every field the accountant does not
//! need is defaulted or skipped so an upstream adding fields never breaks
//! accounting.

use serde::{Deserialize, Serialize};

/// Token usage block returned by chat completion endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// Anthropic's usage block uses input/output naming.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

/// The slice of a chat completion response the accountant reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// The slice of an Anthropic messages response the accountant reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnthropicMessagesResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// Embeddings response with float-array vectors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddingResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub data: Vec<EmbeddingFloat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddingFloat {
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// Embeddings response when the client requested `encoding_format=base64`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddingResponseBase64 {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub data: Vec<EmbeddingBase64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddingBase64 {
    #[serde(default)]
    pub embedding: String,
}

//! API layer for the gateway.
//!
//! HTTP handlers, authentication, upstream dispatch, and the wire models
//! for the provider surfaces the proxy fronts.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod upstream;

// Re-export commonly used types
pub use auth::{hash_key, AuthOutcome, Authenticator};
pub use handlers::{build_router, ProxyState};
pub use models::{
    AnthropicMessagesResponse, AnthropicUsage, ChatCompletionResponse, EmbeddingResponse,
    EmbeddingResponseBase64, Usage,
};
pub use upstream::{build_upstream_request, DispatchError, Dispatcher, Endpoint, UpstreamAuth};

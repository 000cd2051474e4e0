//! llm-gateway - an authenticating, policy-enforcing reverse proxy for LLM
//! provider APIs.
//!
//! Client applications address a single endpoint with a tenant-issued API
//! key. Per request, the gateway:
//!
//! - **Authenticates** the key against an in-memory replica of the key
//!   table and resolves its provider settings and (optionally) a route
//! - **Admits** the request against per-key rate, token, and spend limits
//!   held in shared atomic counter stores
//! - **Dispatches** upstream, either directly to a provider family or
//!   through a route's failover step sequence
//! - **Accounts** tokens and cost from the response, and
//! - **Emits** one usage event for asynchronous recording
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: infrastructure (config, stores, replicas, errors, metrics,
//!   telemetry, cancellation, token counting)
//! - [`api`]: HTTP surface (router, authentication, upstream dispatch)
//! - [`services`]: request-lifecycle logic (admission, routing,
//!   accounting, events, caching)

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, Authenticator, Dispatcher, ProxyState};
pub use core::{AppConfig, AppError, Result};
pub use services::{EventBus, ResponseCache, RoutePlanner, Validator};

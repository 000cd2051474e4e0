//! Business logic services for the gateway.
//!
//! Admission control, route execution, accounting, pricing, the event bus,
//! and the response cache.

pub mod accountant;
pub mod event_bus;
pub mod pricing;
pub mod response_cache;
pub mod route_planner;
pub mod validator;

// Re-export commonly used types
pub use accountant::{account, Accounting, ResponseShape};
pub use event_bus::{
    EventBus, EventConsumer, EventHandler, EventStore, MemoryEventStore, RecordingHandler,
    UsageEvent, EVENT_TOPIC,
};
pub use pricing::{cheapest_prompt_cost_micro_usd, cost_micro_usd, price_for, ModelPrice};
pub use response_cache::{fingerprint, ResponseCache};
pub use route_planner::{RouteError, RouteOutcome, RoutePlanner, RouteState};
pub use validator::{cost_key, rate_key, token_key, window_bucket, Validator};

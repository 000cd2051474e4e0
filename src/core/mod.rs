//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the
//! application:
//! - Configuration management
//! - Relational-store access and authoritative record types
//! - Redis-backed counter and cache stores
//! - In-memory replicas
//! - Error handling, logging context, metrics, telemetry
//! - Cancellation plumbing and token counting

pub mod cancel;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod redis_store;
pub mod replica;
pub mod telemetry;
pub mod tokenizer;

// Re-export commonly used types
pub use cancel::CancelHandle;
pub use config::{AppConfig, PostgresConfig, RedisConfig, ServerConfig};
pub use database::{
    AuthParamLocation, CostLimitSpec, CustomProviderEntity, CustomRouteConfig, EventEntity,
    KeyEntity, ProviderKind, ProviderSettingEntity, RateLimitSpec, RouteCacheConfig, RouteEntity,
    RouteStepSpec, Store,
};
pub use error::{AppError, Result};
pub use logging::{correlation_id, generate_correlation_id, PrivacyMode, CORRELATION_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use redis_store::{
    AccessCache, ByteCache, CounterStore, MemoryByteCache, MemoryCounterStore, RedisByteCache,
    RedisCounterStore, StoreError,
};
pub use replica::{Replica, ReplicaSet, SnapshotSource};

//! Relational store access and the authoritative record types.
//!
//! PostgreSQL only. The hot path never queries this store directly: the
//! replicas pull full table listings on their refresh interval, and the
//! event consumers append usage rows. Migrations are managed externally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::time::Duration;

use crate::core::config::PostgresConfig;

/// Upstream provider family a setting or route step addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Azure,
    Custom(String),
}

impl ProviderKind {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Azure => "azure",
            ProviderKind::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Custom(name) => write!(f, "custom:{}", name),
            other => f.write_str(other.as_str()),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "azure" => Ok(ProviderKind::Azure),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(ProviderKind::Custom(name.to_string())),
                _ => Err(format!("unknown provider kind: {}", other)),
            },
        }
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> String {
        kind.to_string()
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Requests/tokens-per-window limits attached to a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub requests_per_window: Option<i64>,
    pub tokens_per_window: Option<i64>,
    pub window_secs: u64,
}

/// Rolling spend ceiling attached to a key, in micro-USD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLimitSpec {
    pub limit_micro_usd: i64,
    pub window_secs: u64,
}

/// Tenant credential and policy record.
#[derive(Debug, Clone, FromRow)]
pub struct KeyEntity {
    pub key_id: String,
    pub name: String,
    /// SHA-256 hex of the presented secret. The plaintext is never stored.
    pub key_hash: String,
    pub tags: Vec<String>,
    /// Prefix patterns; empty means every path is allowed.
    pub allowed_paths: Vec<String>,
    /// Ordered provider-setting references.
    pub setting_ids: Vec<String>,
    pub rate_limits: Option<Json<RateLimitSpec>>,
    pub cost_limit: Option<Json<CostLimitSpec>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KeyEntity {
    pub fn rate_limits(&self) -> Option<&RateLimitSpec> {
        self.rate_limits.as_ref().map(|j| &j.0)
    }

    pub fn cost_limit(&self) -> Option<&CostLimitSpec> {
        self.cost_limit.as_ref().map(|j| &j.0)
    }

    /// Prefix match with a `*` suffix wildcard; an empty list allows all.
    pub fn path_allowed(&self, path: &str) -> bool {
        if self.allowed_paths.is_empty() {
            return true;
        }
        self.allowed_paths.iter().any(|pattern| {
            match pattern.strip_suffix('*') {
                Some(prefix) => path.starts_with(prefix),
                None => path == pattern,
            }
        })
    }
}

/// Server-side credential and addressing material for one upstream account.
#[derive(Debug, Clone, FromRow)]
pub struct ProviderSettingEntity {
    pub setting_id: String,
    /// `openai`, `anthropic`, `azure`, or `custom:<name>`.
    pub provider: String,
    /// Opaque upstream credential; read-only on the hot path. Rotation is a
    /// replace-and-publish through the replica.
    pub credential: String,
    pub allowed_models: Vec<String>,
    pub api_base: Option<String>,
    pub azure_resource: Option<String>,
    pub azure_api_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderSettingEntity {
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        self.provider.parse().ok()
    }
}

/// One exposed path of a custom provider and how to reach its upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRouteConfig {
    pub path: String,
    pub method: String,
    /// Target URL; `{model}` is substituted from the request.
    pub target_url: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

/// Where a custom provider expects its credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthParamLocation {
    Header,
    Query,
}

/// Operator-defined upstream outside the built-in provider families.
#[derive(Debug, Clone, FromRow)]
pub struct CustomProviderEntity {
    pub name: String,
    pub route_configs: Json<Vec<CustomRouteConfig>>,
    pub auth_param_location: Json<AuthParamLocation>,
    /// Header or query-parameter name carrying the credential.
    pub auth_param_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomProviderEntity {
    pub fn find_route_config(&self, path: &str) -> Option<&CustomRouteConfig> {
        self.route_configs.0.iter().find(|rc| rc.path == path)
    }
}

/// One upstream attempt within a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStepSpec {
    pub provider: ProviderKind,
    pub model: String,
    pub setting_id: String,
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retries: u32,
}

fn default_step_timeout_secs() -> u64 {
    30
}

/// Per-route response cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

/// Ordered failover sequence bound to a public path.
#[derive(Debug, Clone, FromRow)]
pub struct RouteEntity {
    pub route_id: String,
    pub name: String,
    pub path: String,
    pub steps: Json<Vec<RouteStepSpec>>,
    pub cache_config: Option<Json<RouteCacheConfig>>,
    /// Steps return embedding-shaped responses instead of chat completions.
    pub run_embeddings: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RouteEntity {
    pub fn steps(&self) -> &[RouteStepSpec] {
        &self.steps.0
    }

    pub fn cache_config(&self) -> Option<&RouteCacheConfig> {
        self.cache_config.as_ref().map(|j| &j.0)
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_config().map(|c| c.enabled).unwrap_or(false)
    }
}

/// Persisted usage event, one per completed (or rejected past admission,
/// or cancelled) request.
#[derive(Debug, Clone, FromRow)]
pub struct EventEntity {
    pub event_id: String,
    pub correlation_id: String,
    pub key_id: String,
    pub path: String,
    pub provider: String,
    pub model: String,
    pub status_code: i32,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_micro_usd: Option<i64>,
    pub unknown_model_price: bool,
    pub latency_ms: i64,
    pub error_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Connection handle over the relational store.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(config: &PostgresConfig) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(config.write_timeout_secs.max(1)))
            .connect(&config.connection_url())
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyEntity>, sqlx::Error> {
        sqlx::query_as::<_, KeyEntity>(
            "SELECT key_id, name, key_hash, tags, allowed_paths, setting_ids, \
             rate_limits, cost_limit, revoked, created_at, updated_at FROM keys",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_provider_settings(
        &self,
    ) -> Result<Vec<ProviderSettingEntity>, sqlx::Error> {
        sqlx::query_as::<_, ProviderSettingEntity>(
            "SELECT setting_id, provider, credential, allowed_models, api_base, \
             azure_resource, azure_api_version, created_at, updated_at \
             FROM provider_settings",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_routes(&self) -> Result<Vec<RouteEntity>, sqlx::Error> {
        sqlx::query_as::<_, RouteEntity>(
            "SELECT route_id, name, path, steps, cache_config, run_embeddings, \
             created_at, updated_at FROM routes",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_custom_providers(
        &self,
    ) -> Result<Vec<CustomProviderEntity>, sqlx::Error> {
        sqlx::query_as::<_, CustomProviderEntity>(
            "SELECT name, route_configs, auth_param_location, auth_param_name, \
             created_at, updated_at FROM custom_providers",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn insert_event(&self, event: &EventEntity) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO events (event_id, correlation_id, key_id, path, provider, model, \
             status_code, prompt_tokens, completion_tokens, cost_micro_usd, \
             unknown_model_price, latency_ms, error_tag, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&event.event_id)
        .bind(&event.correlation_id)
        .bind(&event.key_id)
        .bind(&event.path)
        .bind(&event.provider)
        .bind(&event.model)
        .bind(event.status_code)
        .bind(event.prompt_tokens)
        .bind(event.completion_tokens)
        .bind(event.cost_micro_usd)
        .bind(event.unknown_model_price)
        .bind(event.latency_ms)
        .bind(&event.error_tag)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

//! Shared test harness: a fully wired proxy over in-memory stores and
//! fixed replica snapshots, with mock upstreams supplied by the caller.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use sqlx::types::Json;
use std::sync::Arc;
use std::time::Duration;

use llm_gateway::api::auth::{hash_key, Authenticator};
use llm_gateway::api::handlers::{build_router, ProxyState};
use llm_gateway::api::upstream::Dispatcher;
use llm_gateway::core::database::{
    CostLimitSpec, CustomProviderEntity, EventEntity, KeyEntity, ProviderSettingEntity,
    RateLimitSpec, RouteCacheConfig, RouteEntity, RouteStepSpec,
};
use llm_gateway::core::logging::PrivacyMode;
use llm_gateway::core::metrics::init_metrics;
use llm_gateway::core::redis_store::{AccessCache, MemoryByteCache, MemoryCounterStore};
use llm_gateway::core::replica::{Replica, SnapshotSource};
use llm_gateway::services::event_bus::{
    EventBus, EventConsumer, MemoryEventStore, RecordingHandler, EVENT_TOPIC,
};
use llm_gateway::services::response_cache::ResponseCache;
use llm_gateway::services::route_planner::RoutePlanner;
use llm_gateway::services::validator::Validator;

pub struct FixedSource<T: Clone>(pub Vec<T>);

#[async_trait]
impl<T: Clone + Send + Sync + 'static> SnapshotSource<T> for FixedSource<T> {
    async fn load(&self) -> anyhow::Result<Vec<T>> {
        Ok(self.0.clone())
    }
}

pub struct Harness {
    pub router: Router,
    pub events: Arc<MemoryEventStore>,
    pub rate_store: Arc<MemoryCounterStore>,
    pub cost_store: Arc<MemoryCounterStore>,
    pub consumer: EventConsumer,
}

impl Harness {
    /// Stop the consumers (draining the bus) and return every recorded
    /// event.
    pub async fn drain_events(self) -> Vec<EventEntity> {
        self.consumer.stop(Duration::from_secs(2)).await;
        self.events.drain()
    }
}

pub struct HarnessConfig {
    pub keys: Vec<KeyEntity>,
    pub settings: Vec<ProviderSettingEntity>,
    pub routes: Vec<RouteEntity>,
    pub custom_providers: Vec<CustomProviderEntity>,
    pub proxy_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            keys: vec![],
            settings: vec![],
            routes: vec![],
            custom_providers: vec![],
            proxy_timeout: Duration::from_secs(30),
        }
    }
}

pub async fn build_harness(config: HarnessConfig) -> Harness {
    init_metrics();
    let interval = Duration::from_secs(3600);

    let keys = Arc::new(Replica::new(
        "keys",
        Arc::new(FixedSource(config.keys)) as Arc<dyn SnapshotSource<KeyEntity>>,
        |k: &KeyEntity| k.key_hash.clone(),
        interval,
    ));
    let settings = Arc::new(Replica::new(
        "provider_settings",
        Arc::new(FixedSource(config.settings)) as Arc<dyn SnapshotSource<ProviderSettingEntity>>,
        |s: &ProviderSettingEntity| s.setting_id.clone(),
        interval,
    ));
    let routes = Arc::new(Replica::new(
        "routes",
        Arc::new(FixedSource(config.routes)) as Arc<dyn SnapshotSource<RouteEntity>>,
        |r: &RouteEntity| r.path.clone(),
        interval,
    ));
    let custom_providers = Arc::new(Replica::new(
        "custom_providers",
        Arc::new(FixedSource(config.custom_providers))
            as Arc<dyn SnapshotSource<CustomProviderEntity>>,
        |c: &CustomProviderEntity| c.name.clone(),
        interval,
    ));
    keys.refresh_once().await.unwrap();
    settings.refresh_once().await.unwrap();
    routes.refresh_once().await.unwrap();
    custom_providers.refresh_once().await.unwrap();

    let rate_store = Arc::new(MemoryCounterStore::new());
    let cost_store = Arc::new(MemoryCounterStore::new());
    let events = Arc::new(MemoryEventStore::new());

    let event_bus = Arc::new(EventBus::new(256));
    let receiver = event_bus.subscribe(EVENT_TOPIC);
    let handler = Arc::new(RecordingHandler::new(
        cost_store.clone(),
        rate_store.clone(),
        events.clone(),
    ));
    let consumer = EventConsumer::new(receiver, handler, 2);
    consumer.start();

    let dispatcher = Dispatcher::new(reqwest::Client::new());
    let state = Arc::new(ProxyState {
        privacy: PrivacyMode::Strict,
        authenticator: Arc::new(Authenticator::new(
            keys,
            settings,
            routes,
            Arc::new(AccessCache::new(
                Box::new(MemoryByteCache::new()),
                Duration::from_secs(30),
            )),
        )),
        validator: Arc::new(Validator::new(rate_store.clone(), cost_store.clone(), false)),
        planner: Arc::new(RoutePlanner::new(dispatcher.clone(), 2 * 1024 * 1024)),
        dispatcher,
        response_cache: Arc::new(ResponseCache::new(Arc::new(MemoryByteCache::new()))),
        event_bus,
        custom_providers,
        proxy_timeout: config.proxy_timeout,
    });

    Harness {
        router: build_router(state),
        events,
        rate_store,
        cost_store,
        consumer,
    }
}

// ============================================================================
// Entity builders
// ============================================================================

pub fn test_key(secret: &str, setting_ids: Vec<&str>) -> KeyEntity {
    KeyEntity {
        key_id: "k1".to_string(),
        name: "test-key".to_string(),
        key_hash: hash_key(secret),
        tags: vec![],
        allowed_paths: vec![],
        setting_ids: setting_ids.iter().map(|s| s.to_string()).collect(),
        rate_limits: None,
        cost_limit: None,
        revoked: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn with_rate_limit(mut key: KeyEntity, requests: i64, window_secs: u64) -> KeyEntity {
    key.rate_limits = Some(Json(RateLimitSpec {
        requests_per_window: Some(requests),
        tokens_per_window: None,
        window_secs,
    }));
    key
}

pub fn with_cost_limit(mut key: KeyEntity, limit_micro_usd: i64, window_secs: u64) -> KeyEntity {
    key.cost_limit = Some(Json(CostLimitSpec {
        limit_micro_usd,
        window_secs,
    }));
    key
}

pub fn openai_setting(setting_id: &str, api_base: &str) -> ProviderSettingEntity {
    ProviderSettingEntity {
        setting_id: setting_id.to_string(),
        provider: "openai".to_string(),
        credential: "sk-upstream-openai".to_string(),
        allowed_models: vec![],
        api_base: Some(api_base.to_string()),
        azure_resource: None,
        azure_api_version: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn anthropic_setting(setting_id: &str, api_base: &str) -> ProviderSettingEntity {
    ProviderSettingEntity {
        setting_id: setting_id.to_string(),
        provider: "anthropic".to_string(),
        credential: "sk-upstream-anthropic".to_string(),
        allowed_models: vec![],
        api_base: Some(api_base.to_string()),
        azure_resource: None,
        azure_api_version: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn azure_setting(setting_id: &str, api_base: &str) -> ProviderSettingEntity {
    ProviderSettingEntity {
        setting_id: setting_id.to_string(),
        provider: "azure".to_string(),
        credential: "sk-upstream-azure".to_string(),
        allowed_models: vec![],
        api_base: Some(api_base.to_string()),
        azure_resource: None,
        azure_api_version: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn test_route(
    path: &str,
    steps: Vec<RouteStepSpec>,
    cache_ttl_secs: Option<u64>,
) -> RouteEntity {
    RouteEntity {
        route_id: "r1".to_string(),
        name: "test-route".to_string(),
        path: path.to_string(),
        steps: Json(steps),
        cache_config: cache_ttl_secs.map(|ttl_secs| {
            Json(RouteCacheConfig {
                enabled: true,
                ttl_secs,
            })
        }),
        run_embeddings: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

// ============================================================================
// Request helpers
// ============================================================================

pub fn chat_request(uri: &str, secret: &str, body: serde_json::Value) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", secret))
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

pub async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn response_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Cost-limit seeding needs the same bucket the validator will read.
pub async fn seed_spend(
    cost_store: &Arc<MemoryCounterStore>,
    key_id: &str,
    window_secs: u64,
    amount: i64,
) {
    use llm_gateway::core::redis_store::CounterStore;
    use llm_gateway::services::validator::{cost_key, window_bucket};
    let bucket = window_bucket(Utc::now().timestamp(), window_secs);
    let key = cost_key(key_id, window_secs, bucket);
    cost_store
        .increment_by(&key, amount, Duration::from_secs(window_secs))
        .await
        .unwrap();
}

pub fn chat_completion_body(model: &str, content: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": content}]
    })
}

pub fn upstream_chat_response(model: &str, prompt_tokens: i64, completion_tokens: i64) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello!"},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

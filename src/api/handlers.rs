//! Proxy front-end: the axum router and the per-request pipeline.
//!
//! Every request walks the same spine: authenticate, probe the cache (route
//! requests only), admit against rate and spend limits, dispatch (directly
//! or through the route state machine), pass the upstream answer through,
//! account tokens and cost, and publish one usage event. Admission failures
//! stop before any upstream work and emit nothing beyond a rejection
//! counter; everything past admission emits exactly one event, including
//! cancellations.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, warn};

use crate::api::auth::{AuthOutcome, Authenticator};
use crate::api::upstream::{DispatchError, Dispatcher, Endpoint};
use crate::core::cancel::CancelHandle;
use crate::core::database::{CustomProviderEntity, KeyEntity, ProviderKind};
use crate::core::error::AppError;
use crate::core::logging::{generate_correlation_id, PrivacyMode};
use crate::core::metrics::get_metrics;
use crate::core::replica::Replica;
use crate::core::tokenizer::{count_chat_prompt_tokens, count_embeddings_input_tokens};
use crate::services::accountant::{account, Accounting, ResponseShape};
use crate::services::event_bus::{EventBus, UsageEvent, EVENT_TOPIC};
use crate::services::pricing::{cheapest_prompt_cost_micro_usd, price_for, usd_to_micro};
use crate::services::response_cache::{fingerprint, ResponseCache};
use crate::services::route_planner::{RouteError, RoutePlanner, RouteState};
use crate::services::validator::Validator;
use crate::with_correlation_id;

/// Everything the pipeline needs, wired once at startup.
pub struct ProxyState {
    pub privacy: PrivacyMode,
    pub authenticator: Arc<Authenticator>,
    pub validator: Arc<Validator>,
    pub planner: Arc<RoutePlanner>,
    pub dispatcher: Dispatcher,
    pub response_cache: Arc<ResponseCache>,
    pub event_bus: Arc<EventBus>,
    pub custom_providers: Arc<Replica<CustomProviderEntity>>,
    pub proxy_timeout: Duration,
}

/// Assemble the proxy router.
pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/v1/messages", post(messages))
        .route(
            "/azure/deployments/:deployment/chat/completions",
            post(azure_chat_completions),
        )
        .route(
            "/azure/deployments/:deployment/embeddings",
            post(azure_embeddings),
        )
        .fallback(route_or_custom)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

// ============================================================================
// Direct provider surfaces
// ============================================================================

async fn chat_completions(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_direct(
        state,
        headers,
        "/v1/chat/completions",
        body,
        ProviderKind::OpenAi,
        Endpoint::ChatCompletions,
        None,
    )
    .await
}

async fn embeddings(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_direct(
        state,
        headers,
        "/v1/embeddings",
        body,
        ProviderKind::OpenAi,
        Endpoint::Embeddings,
        None,
    )
    .await
}

async fn list_models(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    handle_direct(
        state,
        headers,
        "/v1/models",
        Bytes::new(),
        ProviderKind::OpenAi,
        Endpoint::Models,
        None,
    )
    .await
}

async fn messages(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_direct(
        state,
        headers,
        "/v1/messages",
        body,
        ProviderKind::Anthropic,
        Endpoint::Messages,
        None,
    )
    .await
}

async fn azure_chat_completions(
    State(state): State<Arc<ProxyState>>,
    Path(deployment): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = format!("/azure/deployments/{}/chat/completions", deployment);
    handle_direct(
        state,
        headers,
        &path,
        body,
        ProviderKind::Azure,
        Endpoint::ChatCompletions,
        Some(deployment),
    )
    .await
}

async fn azure_embeddings(
    State(state): State<Arc<ProxyState>>,
    Path(deployment): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = format!("/azure/deployments/{}/embeddings", deployment);
    handle_direct(
        state,
        headers,
        &path,
        body,
        ProviderKind::Azure,
        Endpoint::Embeddings,
        Some(deployment),
    )
    .await
}

// ============================================================================
// Pipeline plumbing
// ============================================================================

/// Publishes the armed event on drop, so a client disconnect mid-flight
/// still records partial usage with a cancelled outcome.
struct EventGuard {
    bus: Arc<EventBus>,
    cancel: CancelHandle,
    started: Instant,
    slot: Option<UsageEvent>,
}

impl EventGuard {
    fn arm(bus: Arc<EventBus>, cancel: CancelHandle, started: Instant, event: UsageEvent) -> Self {
        Self {
            bus,
            cancel,
            started,
            slot: Some(event),
        }
    }

    /// Take the event back for a normal completion path.
    fn complete(&mut self) -> Option<UsageEvent> {
        self.cancel.mark_completed();
        self.slot.take()
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        if let Some(mut event) = self.slot.take() {
            self.cancel.cancel();
            event.status_code = 499;
            event.error_tag = Some("cancelled".to_string());
            event.latency_ms = self.started.elapsed().as_millis() as i64;
            event.created_at = Utc::now();
            self.bus.publish(EVENT_TOPIC, event);
        }
    }
}

/// Decrements the active-request gauge on scope exit.
struct ActiveGuard(&'static str);

impl ActiveGuard {
    fn enter(path_label: &'static str) -> Self {
        get_metrics()
            .active_requests
            .with_label_values(&[path_label])
            .inc();
        Self(path_label)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        get_metrics()
            .active_requests
            .with_label_values(&[self.0])
            .dec();
    }
}

fn new_event(correlation_id: &str, key: &KeyEntity, path: &str) -> UsageEvent {
    UsageEvent {
        correlation_id: correlation_id.to_string(),
        key_id: key.key_id.clone(),
        path: path.to_string(),
        provider: String::new(),
        model: String::new(),
        status_code: 0,
        prompt_tokens: 0,
        completion_tokens: 0,
        cost_micro_usd: None,
        unknown_model_price: false,
        latency_ms: 0,
        error_tag: None,
        token_window_secs: key
            .rate_limits()
            .and_then(|l| l.tokens_per_window.map(|_| l.window_secs)),
        cost_window_secs: key.cost_limit().map(|c| c.window_secs),
        created_at: Utc::now(),
    }
}

fn record_request_metrics(path: &str, provider: &str, model: &str, status: u16, started: Instant) {
    let status_label = status.to_string();
    let metrics = get_metrics();
    metrics
        .request_count
        .with_label_values(&[path, provider, model, status_label.as_str()])
        .inc();
    metrics
        .request_duration
        .with_label_values(&[path, provider, model])
        .observe(started.elapsed().as_secs_f64());
}

/// Copy the upstream response through: status and headers preserved, body
/// verbatim, `Content-Type: application/json` pinned.
fn passthrough_response(
    status: reqwest::StatusCode,
    upstream_headers: &reqwest::header::HeaderMap,
    body: Vec<u8>,
) -> Response {
    let status =
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(axum::body::Body::from(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in upstream_headers {
        let lowered = name.as_str().to_ascii_lowercase();
        if matches!(
            lowered.as_str(),
            "connection" | "transfer-encoding" | "content-length" | "content-encoding"
        ) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn parse_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return json!({});
    }
    serde_json::from_slice(body).unwrap_or_else(|_| json!({}))
}

fn model_from_body(body: &Value) -> String {
    body.get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn encoding_format_from_body(body: &Value) -> String {
    body.get("encoding_format")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn shape_for(endpoint: Endpoint, body: &Value) -> Option<ResponseShape> {
    match endpoint {
        Endpoint::ChatCompletions | Endpoint::Messages => Some(ResponseShape::Chat),
        Endpoint::Embeddings => Some(ResponseShape::embeddings_from_request(body)),
        Endpoint::Models => None,
    }
}

/// Minimum plausible cost of a direct request: prompt tokens only, against
/// the cheapest model the key's setting allows.
fn expected_min_cost(
    outcome: &AuthOutcome,
    kind: &ProviderKind,
    endpoint: Endpoint,
    body: &Value,
    model: &str,
) -> Option<i64> {
    let prompt_tokens = match endpoint {
        Endpoint::ChatCompletions | Endpoint::Messages => {
            count_chat_prompt_tokens(body, model) as i64
        }
        Endpoint::Embeddings => count_embeddings_input_tokens(body, model) as i64,
        Endpoint::Models => return None,
    };
    if prompt_tokens == 0 {
        return None;
    }

    let setting = outcome.setting_for_provider(kind.as_str());
    let models: Vec<String> = match setting {
        Some(s) if !s.allowed_models.is_empty() => s.allowed_models.clone(),
        _ => vec![model.to_string()],
    };
    cheapest_prompt_cost_micro_usd(kind, &models, prompt_tokens)
}

/// Minimum plausible cost of a route request: cheapest prompt-side price
/// across the route's declared steps.
fn expected_min_route_cost(
    route: &crate::core::database::RouteEntity,
    body: &Value,
) -> Option<i64> {
    route
        .steps()
        .iter()
        .filter_map(|step| {
            let prompt_tokens = if route.run_embeddings {
                count_embeddings_input_tokens(body, &step.model) as i64
            } else {
                count_chat_prompt_tokens(body, &step.model) as i64
            };
            if prompt_tokens == 0 {
                return None;
            }
            price_for(&step.provider, &step.model)
                .map(|price| usd_to_micro((prompt_tokens as f64 / 1000.0) * price.prompt_per_1k))
        })
        .min()
}

// ============================================================================
// Direct dispatch pipeline
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn handle_direct(
    state: Arc<ProxyState>,
    headers: HeaderMap,
    path: &str,
    body: Bytes,
    kind: ProviderKind,
    endpoint: Endpoint,
    model_override: Option<String>,
) -> Response {
    let correlation_id = generate_correlation_id();
    let path = path.to_string();
    with_correlation_id!(correlation_id.clone(), async move {
        let started = Instant::now();
        let _active = ActiveGuard::enter(endpoint_label(endpoint));

        let outcome = match state.authenticator.authenticate(&headers, &path).await {
            Ok(outcome) => outcome,
            Err(e) => return error_response(&path, started, e),
        };

        let body_value = parse_body(&body);
        if state.privacy.allows_body_logging() {
            debug!(body = %body_value, "inbound request body");
        }
        let model = model_override.unwrap_or_else(|| model_from_body(&body_value));

        let floor = expected_min_cost(&outcome, &kind, endpoint, &body_value, &model);
        if let Err(e) = state.validator.admit(&outcome.key, floor).await {
            return error_response(&path, started, e);
        }

        let Some(setting) = outcome.setting_for_provider(kind.as_str()).cloned() else {
            return error_response(
                &path,
                started,
                AppError::NotFound(format!("no provider setting for {}", kind)),
            );
        };

        let cancel = CancelHandle::new();
        let mut event = new_event(&correlation_id, &outcome.key, &path);
        event.provider = kind.to_string();
        event.model = model.clone();
        let mut guard = EventGuard::arm(state.event_bus.clone(), cancel.clone(), started, event);

        let dispatch = async {
            let response = state
                .dispatcher
                .dispatch(
                    &kind,
                    &setting,
                    &model,
                    endpoint,
                    &body_value,
                    &headers,
                    state.proxy_timeout,
                )
                .await?;
            let status = response.status();
            let upstream_headers = response.headers().clone();
            let bytes = response
                .bytes()
                .await
                .map_err(DispatchError::Unreachable)?;
            Ok::<_, DispatchError>((status, upstream_headers, bytes))
        };

        let dispatched = match tokio::time::timeout(state.proxy_timeout, dispatch).await {
            Ok(result) => result,
            Err(_) => {
                return fail_with_event(
                    &state, &mut guard, &path, started, AppError::RequestTimeout,
                );
            }
        };

        let (status, upstream_headers, bytes) = match dispatched {
            Ok(parts) => parts,
            Err(DispatchError::Timeout) => {
                return fail_with_event(&state, &mut guard, &path, started, AppError::RequestTimeout);
            }
            Err(DispatchError::Unreachable(e)) => {
                warn!(error = %e, "upstream unreachable");
                return fail_with_event(
                    &state,
                    &mut guard,
                    &path,
                    started,
                    AppError::Internal("upstream unreachable".to_string()),
                );
            }
            Err(DispatchError::InvalidTarget(reason)) => {
                return fail_with_event(
                    &state,
                    &mut guard,
                    &path,
                    started,
                    AppError::Internal(reason),
                );
            }
        };

        let accounting = if status.is_success() {
            run_accounting(endpoint, &kind, &model, &body_value, &bytes, &state)
        } else {
            Accounting::default()
        };

        if let Some(mut event) = guard.complete() {
            event.status_code = status.as_u16();
            event.prompt_tokens = accounting.prompt_tokens;
            event.completion_tokens = accounting.completion_tokens;
            event.cost_micro_usd = status.is_success().then_some(accounting.cost_micro_usd).flatten();
            event.unknown_model_price = accounting.unknown_model_price;
            event.error_tag = (!status.is_success()).then(|| "upstream_error".to_string());
            event.latency_ms = started.elapsed().as_millis() as i64;
            event.created_at = Utc::now();
            state.event_bus.publish(EVENT_TOPIC, event);
        }

        record_request_metrics(&path, kind.as_str(), &model, status.as_u16(), started);
        passthrough_response(status, &upstream_headers, bytes.to_vec())
    })
    .await
}

fn endpoint_label(endpoint: Endpoint) -> &'static str {
    match endpoint {
        Endpoint::ChatCompletions => "chat_completions",
        Endpoint::Embeddings => "embeddings",
        Endpoint::Models => "models",
        Endpoint::Messages => "messages",
    }
}

fn run_accounting(
    endpoint: Endpoint,
    kind: &ProviderKind,
    model: &str,
    body_value: &Value,
    bytes: &[u8],
    state: &ProxyState,
) -> Accounting {
    let Some(shape) = shape_for(endpoint, body_value) else {
        return Accounting {
            cost_micro_usd: Some(0),
            ..Accounting::default()
        };
    };
    match account(shape, kind, model, body_value, bytes) {
        Ok(accounting) => accounting,
        Err(e) => {
            // Accounting failures never fail the response the client is
            // about to receive.
            if state.privacy.allows_body_logging() {
                warn!(error = %e, body = %String::from_utf8_lossy(bytes), "accounting failed");
            } else {
                warn!(error = %e, "accounting failed");
            }
            Accounting::default()
        }
    }
}

fn error_response(path: &str, started: Instant, error: AppError) -> Response {
    record_request_metrics(path, "", "", error.status().as_u16(), started);
    error.into_response()
}

/// Publish the armed event with the error outcome, then respond with it.
fn fail_with_event(
    state: &ProxyState,
    guard: &mut EventGuard,
    path: &str,
    started: Instant,
    error: AppError,
) -> Response {
    if let Some(mut event) = guard.complete() {
        event.status_code = error.status().as_u16();
        event.error_tag = Some(error.tag().to_string());
        event.latency_ms = started.elapsed().as_millis() as i64;
        event.created_at = Utc::now();
        state.event_bus.publish(EVENT_TOPIC, event);
    }
    error_response(path, started, error)
}

// ============================================================================
// Route and custom-provider fallback
// ============================================================================

async fn route_or_custom(
    State(state): State<Arc<ProxyState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let correlation_id = generate_correlation_id();
    with_correlation_id!(correlation_id.clone(), async move {
        let started = Instant::now();
        let _active = ActiveGuard::enter("route");

        let outcome = match state.authenticator.authenticate(&headers, &path).await {
            Ok(outcome) => outcome,
            Err(e) => return error_response(&path, started, e),
        };

        if let Some(route) = outcome.route.clone() {
            return handle_route(state, outcome, route, headers, body, &path, started, &correlation_id)
                .await;
        }

        // Custom providers bind arbitrary paths through their route
        // configs; scan the replica snapshot for a match.
        let custom = state
            .custom_providers
            .snapshot()
            .values()
            .find(|p| p.find_route_config(&path).is_some())
            .cloned();
        if let Some(provider) = custom {
            return handle_custom(state, outcome, provider, body, &path, started, &correlation_id)
                .await;
        }

        error_response(
            &path,
            started,
            AppError::NotFound("route not found".to_string()),
        )
    })
    .await
}

#[allow(clippy::too_many_arguments)]
async fn handle_route(
    state: Arc<ProxyState>,
    outcome: AuthOutcome,
    route: Arc<crate::core::database::RouteEntity>,
    headers: HeaderMap,
    body: Bytes,
    path: &str,
    started: Instant,
    correlation_id: &str,
) -> Response {
    let body_value = parse_body(&body);
    let model = model_from_body(&body_value);
    let encoding_format = encoding_format_from_body(&body_value);

    // Cache probe before any admission: a hit skips the limits, the
    // dispatch, the accounting, and the event on purpose.
    let cache_key = route
        .cache_enabled()
        .then(|| fingerprint(&route.path, &body_value, &model, &encoding_format));
    if let Some(cache_key) = &cache_key {
        if let Some(bytes) = state.response_cache.get_bytes(cache_key).await {
            record_request_metrics(path, "cached", &model, 200, started);
            return passthrough_response(
                reqwest::StatusCode::OK,
                &reqwest::header::HeaderMap::new(),
                bytes,
            );
        }
    }

    if let Err(e) = state
        .validator
        .admit(&outcome.key, expected_min_route_cost(&route, &body_value))
        .await
    {
        return error_response(path, started, e);
    }

    let cancel = CancelHandle::new();
    let event = new_event(correlation_id, &outcome.key, path);
    let mut guard = EventGuard::arm(state.event_bus.clone(), cancel.clone(), started, event);

    let settings_map = outcome.settings_map();
    let run = state.planner.run_steps(&route, &settings_map, &body, &headers, &cancel);
    let run_result = match tokio::time::timeout(state.proxy_timeout, run).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            return fail_with_event(&state, &mut guard, path, started, AppError::RequestTimeout);
        }
    };

    let route_outcome = match run_result {
        Ok(outcome) => outcome,
        Err(RouteError::Timeout) => {
            return fail_with_event(&state, &mut guard, path, started, AppError::RequestTimeout);
        }
        Err(RouteError::Cancelled) => {
            // The guard publishes the cancelled event on drop.
            return AppError::RequestTimeout.into_response();
        }
        Err(RouteError::BodyTooLarge) => {
            return fail_with_event(&state, &mut guard, path, started, AppError::PayloadTooLarge);
        }
        Err(RouteError::InvalidBody(_)) => {
            return fail_with_event(
                &state,
                &mut guard,
                path,
                started,
                AppError::Internal("route request body is not valid JSON".to_string()),
            );
        }
        Err(RouteError::StepsExhausted(cause)) => {
            warn!(cause = %cause, "cannot run route steps");
            return fail_with_event(
                &state,
                &mut guard,
                path,
                started,
                AppError::Internal("cannot run route steps".to_string()),
            );
        }
    };

    let provider = route_outcome.provider.clone();
    let step_model = route_outcome.model.clone();
    let status = route_outcome.response.status();
    let upstream_headers = route_outcome.response.headers().clone();
    let bytes = match tokio::time::timeout(state.proxy_timeout, route_outcome.response.bytes()).await
    {
        Ok(Ok(bytes)) => bytes,
        _ => {
            return fail_with_event(
                &state,
                &mut guard,
                path,
                started,
                AppError::Internal("failed to read route response body".to_string()),
            );
        }
    };

    let accounting = if route_outcome.state == RouteState::Succeeded {
        if let Some(cache_key) = &cache_key {
            if let Some(cache_config) = route.cache_config() {
                state
                    .response_cache
                    .store_bytes(cache_key, &bytes, Duration::from_secs(cache_config.ttl_secs))
                    .await;
            }
        }
        let shape = if route.run_embeddings {
            ResponseShape::embeddings_from_request(&body_value)
        } else {
            ResponseShape::Chat
        };
        match account(shape, &provider, &step_model, &body_value, &bytes) {
            Ok(accounting) => accounting,
            Err(e) => {
                warn!(error = %e, "route accounting failed");
                Accounting::default()
            }
        }
    } else {
        Accounting::default()
    };

    if let Some(mut event) = guard.complete() {
        event.provider = provider.to_string();
        event.model = step_model.clone();
        event.status_code = status.as_u16();
        event.prompt_tokens = accounting.prompt_tokens;
        event.completion_tokens = accounting.completion_tokens;
        event.cost_micro_usd = accounting.cost_micro_usd;
        event.unknown_model_price = accounting.unknown_model_price;
        event.error_tag =
            (route_outcome.state == RouteState::Failed).then(|| "upstream_error".to_string());
        event.latency_ms = started.elapsed().as_millis() as i64;
        event.created_at = Utc::now();
        state.event_bus.publish(EVENT_TOPIC, event);
    }

    record_request_metrics(path, &provider.to_string(), &step_model, status.as_u16(), started);
    passthrough_response(status, &upstream_headers, bytes.to_vec())
}

async fn handle_custom(
    state: Arc<ProxyState>,
    outcome: AuthOutcome,
    provider: Arc<CustomProviderEntity>,
    body: Bytes,
    path: &str,
    started: Instant,
    correlation_id: &str,
) -> Response {
    let kind = ProviderKind::Custom(provider.name.clone());
    let kind_str = kind.to_string();
    let Some(setting) = outcome
        .settings
        .iter()
        .find(|s| s.provider == kind_str)
        .cloned()
    else {
        return error_response(
            path,
            started,
            AppError::NotFound(format!("no provider setting for {}", kind_str)),
        );
    };

    let body_value = parse_body(&body);
    let model = model_from_body(&body_value);

    // Custom providers carry no price table; spend admission runs with no
    // cost floor.
    if let Err(e) = state.validator.admit(&outcome.key, None).await {
        return error_response(path, started, e);
    }

    let cancel = CancelHandle::new();
    let mut event = new_event(correlation_id, &outcome.key, path);
    event.provider = kind_str.clone();
    event.model = model.clone();
    let mut guard = EventGuard::arm(state.event_bus.clone(), cancel.clone(), started, event);

    let dispatch = async {
        let response = state
            .dispatcher
            .dispatch_custom(
                &provider,
                &setting,
                path,
                &model,
                &body_value,
                state.proxy_timeout,
            )
            .await?;
        let status = response.status();
        let upstream_headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(DispatchError::Unreachable)?;
        Ok::<_, DispatchError>((status, upstream_headers, bytes))
    };

    let dispatched = match tokio::time::timeout(state.proxy_timeout, dispatch).await {
        Ok(result) => result,
        Err(_) => {
            return fail_with_event(&state, &mut guard, path, started, AppError::RequestTimeout)
        }
    };

    let (status, upstream_headers, bytes) = match dispatched {
        Ok(parts) => parts,
        Err(DispatchError::Timeout) => {
            return fail_with_event(&state, &mut guard, path, started, AppError::RequestTimeout)
        }
        Err(DispatchError::Unreachable(e)) => {
            warn!(error = %e, "custom upstream unreachable");
            return fail_with_event(
                &state,
                &mut guard,
                path,
                started,
                AppError::Internal("upstream unreachable".to_string()),
            );
        }
        Err(DispatchError::InvalidTarget(reason)) => {
            return fail_with_event(&state, &mut guard, path, started, AppError::Internal(reason))
        }
    };

    let accounting = if status.is_success() {
        match account(ResponseShape::Chat, &kind, &model, &body_value, &bytes) {
            Ok(accounting) => accounting,
            Err(_) => Accounting::default(),
        }
    } else {
        Accounting::default()
    };

    if let Some(mut event) = guard.complete() {
        event.status_code = status.as_u16();
        event.prompt_tokens = accounting.prompt_tokens;
        event.completion_tokens = accounting.completion_tokens;
        event.cost_micro_usd = accounting.cost_micro_usd;
        event.unknown_model_price = accounting.unknown_model_price;
        event.error_tag = (!status.is_success()).then(|| "upstream_error".to_string());
        event.latency_ms = started.elapsed().as_millis() as i64;
        event.created_at = Utc::now();
        state.event_bus.publish(EVENT_TOPIC, event);
    }

    record_request_metrics(path, &kind_str, &model, status.as_u16(), started);
    passthrough_response(status, &upstream_headers, bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_tolerates_empty_and_garbage() {
        assert_eq!(parse_body(&Bytes::new()), json!({}));
        assert_eq!(parse_body(&Bytes::from_static(b"not json")), json!({}));
        assert_eq!(
            parse_body(&Bytes::from_static(br#"{"model":"gpt-4"}"#)),
            json!({"model": "gpt-4"})
        );
    }

    #[test]
    fn test_model_and_encoding_extraction() {
        let body = json!({"model": "gpt-4", "encoding_format": "base64"});
        assert_eq!(model_from_body(&body), "gpt-4");
        assert_eq!(encoding_format_from_body(&body), "base64");
        assert_eq!(model_from_body(&json!({})), "");
        assert_eq!(encoding_format_from_body(&json!({})), "");
    }

    #[test]
    fn test_shape_selection() {
        let chat_body = json!({"model": "gpt-4"});
        assert_eq!(
            shape_for(Endpoint::ChatCompletions, &chat_body),
            Some(ResponseShape::Chat)
        );
        assert_eq!(
            shape_for(Endpoint::Messages, &chat_body),
            Some(ResponseShape::Chat)
        );
        assert_eq!(shape_for(Endpoint::Models, &chat_body), None);
        let b64_body = json!({"encoding_format": "base64"});
        assert_eq!(
            shape_for(Endpoint::Embeddings, &b64_body),
            Some(ResponseShape::Embeddings { base64: true })
        );
    }

    #[test]
    fn test_passthrough_preserves_status_and_filters_hop_headers() {
        let mut upstream = reqwest::header::HeaderMap::new();
        upstream.insert("x-request-id", "abc".parse().unwrap());
        upstream.insert("transfer-encoding", "chunked".parse().unwrap());
        let response =
            passthrough_response(reqwest::StatusCode::BAD_GATEWAY, &upstream, b"body".to_vec());
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("x-request-id").unwrap(), "abc");
        assert!(response.headers().get("transfer-encoding").is_none());
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}

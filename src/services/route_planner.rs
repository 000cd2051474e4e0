//! Route execution: an ordered step sequence run as a failover state
//! machine.
//!
//! Steps run strictly one at a time so cost accounting stays unambiguous.
//! A retryable failure (transport error, timeout, 5xx with failover left)
//! advances to the next attempt or step; a non-retryable status or an
//! exhausted final step surfaces the upstream response verbatim. External
//! cancellation aborts the in-flight call from any state.

use axum::http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::upstream::{DispatchError, Dispatcher, Endpoint};
use crate::core::cancel::CancelHandle;
use crate::core::database::{ProviderKind, ProviderSettingEntity, RouteEntity};

/// Failover state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Idle,
    Running(usize),
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum RouteError {
    /// Buffered body exceeded the configured bound.
    #[error("route request body too large")]
    BodyTooLarge,

    #[error("route request body is not valid JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),

    /// The final step timed out with no failover remaining.
    #[error("route timed out")]
    Timeout,

    #[error("route was cancelled")]
    Cancelled,

    /// Every step failed without producing an HTTP response to surface.
    #[error("cannot run route steps: {0}")]
    StepsExhausted(String),
}

/// Result of a finished route run. `state` is `Succeeded` for 2xx and
/// `Failed` when a non-2xx response is surfaced for pass-through.
pub struct RouteOutcome {
    pub response: reqwest::Response,
    pub provider: ProviderKind,
    pub model: String,
    pub step_index: usize,
    pub state: RouteState,
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
}

/// Executes routes against the dispatcher.
pub struct RoutePlanner {
    dispatcher: Dispatcher,
    max_body_bytes: usize,
}

impl RoutePlanner {
    pub fn new(dispatcher: Dispatcher, max_body_bytes: usize) -> Self {
        Self {
            dispatcher,
            max_body_bytes,
        }
    }

    /// Run the route's steps in order until one produces a response to
    /// surface.
    ///
    /// The body is buffered once on entry and re-shaped per step, so every
    /// failover attempt sends the full request.
    pub async fn run_steps(
        &self,
        route: &RouteEntity,
        settings: &HashMap<String, Arc<ProviderSettingEntity>>,
        body_bytes: &[u8],
        headers: &HeaderMap,
        cancel: &CancelHandle,
    ) -> Result<RouteOutcome, RouteError> {
        if body_bytes.len() > self.max_body_bytes {
            return Err(RouteError::BodyTooLarge);
        }
        let body: Value = serde_json::from_slice(body_bytes)?;

        let endpoint = if route.run_embeddings {
            Endpoint::Embeddings
        } else {
            Endpoint::ChatCompletions
        };

        let steps = route.steps();
        let mut state = RouteState::Idle;
        let mut last_cause = String::from("route has no steps");

        for (index, step) in steps.iter().enumerate() {
            state = RouteState::Running(index);
            debug!(route = %route.name, ?state, provider = %step.provider, "route step starting");
            let is_last_step = index + 1 == steps.len();

            let Some(setting) = settings.get(&step.setting_id) else {
                warn!(
                    route = %route.name,
                    step = index,
                    setting_id = %step.setting_id,
                    "route step references an unresolved setting, skipping"
                );
                last_cause = format!("setting {} not resolved", step.setting_id);
                continue;
            };

            let timeout = Duration::from_secs(step.timeout_secs.max(1));
            let attempts = 1 + step.retries as usize;

            for attempt in 0..attempts {
                if cancel.is_cancelled() {
                    return Err(RouteError::Cancelled);
                }

                let dispatched = tokio::select! {
                    _ = cancel.cancelled() => return Err(RouteError::Cancelled),
                    result = self.dispatcher.dispatch(
                        &step.provider,
                        setting,
                        &step.model,
                        endpoint,
                        &body,
                        headers,
                        timeout,
                    ) => result,
                };

                match dispatched {
                    Ok(response) if response.status().is_success() => {
                        debug!(route = %route.name, step = index, "route step succeeded");
                        return Ok(RouteOutcome {
                            response,
                            provider: step.provider.clone(),
                            model: step.model.clone(),
                            step_index: index,
                            state: RouteState::Succeeded,
                        });
                    }
                    Ok(response) => {
                        let status = response.status();
                        let retryable = is_retryable_status(status);
                        let has_fallback = !is_last_step || attempt + 1 < attempts;
                        if retryable && has_fallback {
                            debug!(
                                route = %route.name,
                                step = index,
                                attempt,
                                status = status.as_u16(),
                                "retryable upstream status, advancing"
                            );
                            last_cause = format!("step {} returned {}", index, status);
                            if attempt + 1 < attempts {
                                continue;
                            }
                            break;
                        }
                        // Non-retryable status, or a 5xx with nothing left:
                        // surface the upstream response verbatim.
                        return Ok(RouteOutcome {
                            response,
                            provider: step.provider.clone(),
                            model: step.model.clone(),
                            step_index: index,
                            state: RouteState::Failed,
                        });
                    }
                    Err(DispatchError::Timeout) => {
                        last_cause = format!("step {} timed out", index);
                        if is_last_step && attempt + 1 == attempts {
                            return Err(RouteError::Timeout);
                        }
                    }
                    Err(DispatchError::Unreachable(e)) => {
                        warn!(
                            route = %route.name,
                            step = index,
                            attempt,
                            error = %e,
                            "upstream unreachable"
                        );
                        last_cause = format!("step {} unreachable: {}", index, e);
                    }
                    Err(DispatchError::InvalidTarget(reason)) => {
                        warn!(route = %route.name, step = index, reason, "invalid step target");
                        last_cause = format!("step {} invalid: {}", index, reason);
                        // A misconfigured step cannot succeed on retry.
                        break;
                    }
                }
            }
        }

        state = RouteState::Failed;
        debug!(route = %route.name, ?state, cause = %last_cause, "route exhausted");
        Err(RouteError::StepsExhausted(last_cause))
    }
}

//! Admission control on rate and spend.
//!
//! Two independent dimensions, each backed by its own counter store. Rate
//! admission must be increment-then-compare in a single atomic round-trip:
//! two concurrent requests at the boundary both increment, and only the
//! one that observes a post-increment value within the limit passes. A
//! rejected increment is not rolled back; the counter over-counts by at
//! most the reject rate.
//!
//! Token-per-window limits read the counter here but are debited by the
//! event consumer after the response is accounted, so enforcement lags by
//! the in-flight request count.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::core::database::KeyEntity;
use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use crate::core::redis_store::CounterStore;
use crate::core::telemetry;

/// Integer floor of `now / window_length`, the rate-limit sub-key.
pub fn window_bucket(now_unix: i64, window_secs: u64) -> i64 {
    now_unix / window_secs.max(1) as i64
}

pub fn rate_key(key_id: &str, window_secs: u64, bucket: i64) -> String {
    format!("rate:{}:{}:{}", key_id, window_secs, bucket)
}

pub fn token_key(key_id: &str, window_secs: u64, bucket: i64) -> String {
    format!("tokens:{}:{}:{}", key_id, window_secs, bucket)
}

pub fn cost_key(key_id: &str, window_secs: u64, bucket: i64) -> String {
    format!("cost:{}:{}:{}", key_id, window_secs, bucket)
}

/// Admission gate evaluated after authentication, before any upstream work.
pub struct Validator {
    rate_store: Arc<dyn CounterStore>,
    cost_store: Arc<dyn CounterStore>,
    /// When true, a limit-backend failure admits instead of returning 503.
    fail_open: bool,
}

impl Validator {
    pub fn new(
        rate_store: Arc<dyn CounterStore>,
        cost_store: Arc<dyn CounterStore>,
        fail_open: bool,
    ) -> Self {
        Self {
            rate_store,
            cost_store,
            fail_open,
        }
    }

    /// Admit or reject a request for `key`.
    ///
    /// `expected_min_cost` is the minimum plausible cost of the request in
    /// micro-USD (prompt side only, cheapest allowed model); `None` when no
    /// lower bound could be computed.
    pub async fn admit(&self, key: &KeyEntity, expected_min_cost: Option<i64>) -> Result<()> {
        self.admit_at(key, expected_min_cost, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn admit_at(
        &self,
        key: &KeyEntity,
        expected_min_cost: Option<i64>,
        now_unix: i64,
    ) -> Result<()> {
        if let Some(limits) = key.rate_limits() {
            let bucket = window_bucket(now_unix, limits.window_secs);
            let ttl = Duration::from_secs(limits.window_secs.max(1));

            if let Some(max_requests) = limits.requests_per_window {
                let counter_key = rate_key(&key.key_id, limits.window_secs, bucket);
                match self.rate_store.increment(&counter_key, ttl).await {
                    Ok(count) if count > max_requests => {
                        return Err(self.reject(AppError::RateExceeded));
                    }
                    Ok(_) => {}
                    Err(e) => self.backend_failure("rate", e)?,
                }
            }

            if let Some(max_tokens) = limits.tokens_per_window {
                let counter_key = token_key(&key.key_id, limits.window_secs, bucket);
                match self.rate_store.get(&counter_key).await {
                    Ok(spent) if spent >= max_tokens => {
                        return Err(self.reject(AppError::RateExceeded));
                    }
                    Ok(_) => {}
                    Err(e) => self.backend_failure("rate", e)?,
                }
            }
        }

        if let Some(cost_limit) = key.cost_limit() {
            let bucket = window_bucket(now_unix, cost_limit.window_secs);
            let counter_key = cost_key(&key.key_id, cost_limit.window_secs, bucket);
            match self.cost_store.get(&counter_key).await {
                Ok(spent) => {
                    let floor = expected_min_cost.unwrap_or(0);
                    if spent + floor >= cost_limit.limit_micro_usd {
                        return Err(self.reject(AppError::CostExceeded));
                    }
                }
                Err(e) => self.backend_failure("cost", e)?,
            }
        }

        Ok(())
    }

    fn reject(&self, error: AppError) -> AppError {
        get_metrics().rejections.with_label_values(&[error.tag()]).inc();
        telemetry::incr(&format!("gateway.admission.{}", error.tag()), 1);
        error
    }

    fn backend_failure(
        &self,
        dimension: &str,
        error: crate::core::redis_store::StoreError,
    ) -> Result<()> {
        warn!(dimension, error = %error, "limit backend unavailable");
        telemetry::incr("gateway.admission.limit_backend_unavailable", 1);
        if self.fail_open {
            get_metrics()
                .rejections
                .with_label_values(&["limit_backend_fail_open"])
                .inc();
            Ok(())
        } else {
            Err(AppError::LimitBackendUnavailable)
        }
    }
}

//! Keyed caching of successful response bytes.
//!
//! The fingerprint covers everything that could change the upstream answer:
//! the public path, the normalized request body, the model, and the
//! embeddings encoding format. Both lookup and store are best-effort; a
//! cache backend failure is a miss, never a request failure.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::metrics::get_metrics;
use crate::core::redis_store::ByteCache;

/// Fingerprint for one cacheable request.
///
/// The body is round-tripped through `serde_json::Value` so key order and
/// whitespace differences between clients hash identically.
pub fn fingerprint(path: &str, body: &Value, model: &str, encoding_format: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0x1f]);
    hasher.update(body.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(model.as_bytes());
    hasher.update([0x1f]);
    hasher.update(encoding_format.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Best-effort response cache over a byte store.
pub struct ResponseCache {
    store: Arc<dyn ByteCache>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn ByteCache>) -> Self {
        Self { store }
    }

    fn storage_key(cache_key: &str) -> String {
        format!("response:{}", cache_key)
    }

    /// Look up cached bytes. Any backend error is a miss.
    pub async fn get_bytes(&self, cache_key: &str) -> Option<Vec<u8>> {
        match self.store.get_bytes(&Self::storage_key(cache_key)).await {
            Ok(Some(bytes)) => {
                get_metrics().cache_lookups.with_label_values(&["hit"]).inc();
                Some(bytes)
            }
            Ok(None) => {
                get_metrics().cache_lookups.with_label_values(&["miss"]).inc();
                None
            }
            Err(e) => {
                debug!(error = %e, "response cache lookup failed, treating as miss");
                get_metrics().cache_lookups.with_label_values(&["miss"]).inc();
                None
            }
        }
    }

    /// Store response bytes. Never fails the request.
    pub async fn store_bytes(&self, cache_key: &str, value: &[u8], ttl: Duration) {
        if let Err(e) = self
            .store
            .store_bytes(&Self::storage_key(cache_key), value, ttl)
            .await
        {
            debug!(error = %e, "response cache store failed");
        }
    }
}

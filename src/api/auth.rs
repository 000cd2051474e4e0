//! Authentication: resolving a presented API key into its policy record,
//! provider settings, and (when the path matches) a route.
//!
//! The presented secret is hashed and looked up against the keys replica,
//! so authentication never touches the relational store on the hot path.
//! Stale setting references are skipped, not fatal: a key keeps working
//! while an operator rotates its settings.

use axum::http::HeaderMap;
use dashmap::DashSet;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::database::{KeyEntity, ProviderSettingEntity, RouteEntity};
use crate::core::error::{AppError, Result};
use crate::core::redis_store::AccessCache;
use crate::core::replica::Replica;

/// Hash an API key with SHA-256. Only hashes are ever stored or compared.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract the presented secret. `Authorization: Bearer` is the default;
/// `x-api-key` is accepted for Anthropic-style clients and wins when both
/// are present.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
}

/// Everything the pipeline needs to know about an authenticated request.
pub struct AuthOutcome {
    pub key: Arc<KeyEntity>,
    /// The key's settings in declaration order.
    pub settings: Vec<Arc<ProviderSettingEntity>>,
    /// Set when the request path is bound to a route.
    pub route: Option<Arc<RouteEntity>>,
}

impl AuthOutcome {
    /// Settings keyed by id, for route-step resolution.
    pub fn settings_map(&self) -> HashMap<String, Arc<ProviderSettingEntity>> {
        self.settings
            .iter()
            .map(|s| (s.setting_id.clone(), s.clone()))
            .collect()
    }

    /// First setting whose provider kind matches `kind_str`.
    pub fn setting_for_provider(&self, kind_str: &str) -> Option<&Arc<ProviderSettingEntity>> {
        self.settings.iter().find(|s| s.provider == kind_str)
    }
}

/// Resolves API keys against the in-memory replicas.
pub struct Authenticator {
    keys: Arc<Replica<KeyEntity>>,
    settings: Arc<Replica<ProviderSettingEntity>>,
    routes: Arc<Replica<RouteEntity>>,
    access_cache: Arc<AccessCache>,
    /// Setting ids already warned about, so a stale reference logs once.
    warned_settings: DashSet<String>,
}

impl Authenticator {
    pub fn new(
        keys: Arc<Replica<KeyEntity>>,
        settings: Arc<Replica<ProviderSettingEntity>>,
        routes: Arc<Replica<RouteEntity>>,
        access_cache: Arc<AccessCache>,
    ) -> Self {
        Self {
            keys,
            settings,
            routes,
            access_cache,
            warned_settings: DashSet::new(),
        }
    }

    /// Authenticate a request and annotate it with key, settings, and
    /// route.
    pub async fn authenticate(&self, headers: &HeaderMap, path: &str) -> Result<AuthOutcome> {
        let secret = extract_api_key(headers).ok_or(AppError::Unauthenticated)?;
        let key = self
            .keys
            .get(&hash_key(secret))
            .ok_or(AppError::Unauthenticated)?;

        if key.revoked {
            return Err(AppError::Revoked);
        }

        // The access cache is advisory: a hit skips the path check, a miss
        // re-runs it. Either way the key and settings resolve fresh.
        if !self.access_cache.is_allowed(&key.key_id, path).await {
            if !key.path_allowed(path) {
                return Err(AppError::PathNotAllowed);
            }
            self.access_cache.set_allowed(&key.key_id, path).await;
        }

        // One snapshot for all setting lookups, so every reference resolves
        // against the same generation.
        let snapshot = self.settings.snapshot();
        let mut settings = Vec::with_capacity(key.setting_ids.len());
        for setting_id in &key.setting_ids {
            match snapshot.get(setting_id) {
                Some(setting) => settings.push(setting.clone()),
                None => {
                    if self.warned_settings.insert(setting_id.clone()) {
                        warn!(
                            key_id = %key.key_id,
                            setting_id = %setting_id,
                            "key references a setting absent from the replica, skipping"
                        );
                    }
                }
            }
        }

        let route = self.routes.get(path);
        if route.is_some() {
            debug!(key_id = %key.key_id, path, "request path matched a route");
        }

        Ok(AuthOutcome {
            key,
            settings,
            route,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::redis_store::MemoryByteCache;
    use crate::core::replica::SnapshotSource;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct FixedSource<T: Clone>(Vec<T>);

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> SnapshotSource<T> for FixedSource<T> {
        async fn load(&self) -> anyhow::Result<Vec<T>> {
            Ok(self.0.clone())
        }
    }

    fn key_entity(secret: &str, revoked: bool, allowed_paths: Vec<String>) -> KeyEntity {
        KeyEntity {
            key_id: "k1".to_string(),
            name: "test".to_string(),
            key_hash: hash_key(secret),
            tags: vec![],
            allowed_paths,
            setting_ids: vec!["s1".to_string(), "s-stale".to_string()],
            rate_limits: None,
            cost_limit: None,
            revoked,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn setting_entity(id: &str) -> ProviderSettingEntity {
        ProviderSettingEntity {
            setting_id: id.to_string(),
            provider: "openai".to_string(),
            credential: "sk-upstream".to_string(),
            allowed_models: vec![],
            api_base: None,
            azure_resource: None,
            azure_api_version: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn make_authenticator(keys: Vec<KeyEntity>, routes: Vec<RouteEntity>) -> Authenticator {
        let interval = Duration::from_secs(3600);
        let keys_replica = Arc::new(Replica::new(
            "keys",
            Arc::new(FixedSource(keys)) as Arc<dyn SnapshotSource<KeyEntity>>,
            |k: &KeyEntity| k.key_hash.clone(),
            interval,
        ));
        let settings_replica = Arc::new(Replica::new(
            "provider_settings",
            Arc::new(FixedSource(vec![setting_entity("s1")]))
                as Arc<dyn SnapshotSource<ProviderSettingEntity>>,
            |s: &ProviderSettingEntity| s.setting_id.clone(),
            interval,
        ));
        let routes_replica = Arc::new(Replica::new(
            "routes",
            Arc::new(FixedSource(routes)) as Arc<dyn SnapshotSource<RouteEntity>>,
            |r: &RouteEntity| r.path.clone(),
            interval,
        ));
        keys_replica.refresh_once().await.unwrap();
        settings_replica.refresh_once().await.unwrap();
        routes_replica.refresh_once().await.unwrap();

        Authenticator::new(
            keys_replica,
            settings_replica,
            routes_replica,
            Arc::new(AccessCache::new(
                Box::new(MemoryByteCache::new()),
                Duration::from_secs(30),
            )),
        )
    }

    fn bearer_headers(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {}", secret).parse().unwrap());
        headers
    }

    #[test]
    fn test_hash_key_is_sha256_hex() {
        let hash = hash_key("sk-test");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_key("sk-test"));
        assert_ne!(hash, hash_key("sk-other"));
    }

    #[test]
    fn test_extract_api_key_prefers_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-bearer".parse().unwrap());
        headers.insert("x-api-key", "sk-anthropic".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("sk-anthropic"));
    }

    #[test]
    fn test_extract_api_key_bearer_fallback() {
        let headers = bearer_headers("sk-bearer");
        assert_eq!(extract_api_key(&headers), Some("sk-bearer"));
        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_authenticate_happy_path_resolves_settings() {
        let auth = make_authenticator(vec![key_entity("sk-test", false, vec![])], vec![]).await;
        let outcome = auth
            .authenticate(&bearer_headers("sk-test"), "/v1/chat/completions")
            .await
            .unwrap();
        assert_eq!(outcome.key.key_id, "k1");
        // s-stale is skipped, s1 resolves.
        assert_eq!(outcome.settings.len(), 1);
        assert_eq!(outcome.settings[0].setting_id, "s1");
        assert!(outcome.route.is_none());
    }

    #[tokio::test]
    async fn test_authenticate_unknown_key() {
        let auth = make_authenticator(vec![key_entity("sk-test", false, vec![])], vec![]).await;
        let result = auth
            .authenticate(&bearer_headers("sk-wrong"), "/v1/chat/completions")
            .await;
        assert!(matches!(result, Err(AppError::Unauthenticated)));
    }

    #[tokio::test]
    async fn test_authenticate_missing_credential() {
        let auth = make_authenticator(vec![key_entity("sk-test", false, vec![])], vec![]).await;
        let result = auth
            .authenticate(&HeaderMap::new(), "/v1/chat/completions")
            .await;
        assert!(matches!(result, Err(AppError::Unauthenticated)));
    }

    #[tokio::test]
    async fn test_authenticate_revoked_key() {
        let auth = make_authenticator(vec![key_entity("sk-test", true, vec![])], vec![]).await;
        let result = auth
            .authenticate(&bearer_headers("sk-test"), "/v1/chat/completions")
            .await;
        assert!(matches!(result, Err(AppError::Revoked)));
    }

    #[tokio::test]
    async fn test_authenticate_path_not_allowed() {
        let auth = make_authenticator(
            vec![key_entity(
                "sk-test",
                false,
                vec!["/v1/embeddings".to_string()],
            )],
            vec![],
        )
        .await;
        let result = auth
            .authenticate(&bearer_headers("sk-test"), "/v1/chat/completions")
            .await;
        assert!(matches!(result, Err(AppError::PathNotAllowed)));
        assert!(auth
            .authenticate(&bearer_headers("sk-test"), "/v1/embeddings")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_authenticate_matches_route() {
        let route = RouteEntity {
            route_id: "r1".to_string(),
            name: "chat".to_string(),
            path: "/api/routes/chat".to_string(),
            steps: sqlx::types::Json(vec![]),
            cache_config: None,
            run_embeddings: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let auth =
            make_authenticator(vec![key_entity("sk-test", false, vec![])], vec![route]).await;
        let outcome = auth
            .authenticate(&bearer_headers("sk-test"), "/api/routes/chat")
            .await
            .unwrap();
        assert!(outcome.route.is_some());
        assert_eq!(outcome.route.unwrap().route_id, "r1");
    }

    #[tokio::test]
    async fn test_access_cache_short_circuits_path_check() {
        let auth = make_authenticator(vec![key_entity("sk-test", false, vec![])], vec![]).await;
        // First authentication populates the access cache.
        auth.authenticate(&bearer_headers("sk-test"), "/v1/chat/completions")
            .await
            .unwrap();
        // Second one is served with the cached allow verdict.
        let outcome = auth
            .authenticate(&bearer_headers("sk-test"), "/v1/chat/completions")
            .await
            .unwrap();
        assert_eq!(outcome.key.key_id, "k1");
    }
}

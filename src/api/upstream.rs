//! Upstream dispatch: per-provider request shaping and forwarding.
//!
//! For each provider family the dispatcher knows the URL layout, where the
//! credential goes, and which extra headers the provider requires. It
//! returns the open response with whatever status the upstream produced;
//! classifying that status is the route planner's job.

use axum::http::HeaderMap;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::core::database::{
    AuthParamLocation, CustomProviderEntity, ProviderKind, ProviderSettingEntity,
};

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com";
const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_DEFAULT_VERSION: &str = "2023-06-01";
const AZURE_DEFAULT_API_VERSION: &str = "2024-02-01";

/// Which upstream surface a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Embeddings,
    Models,
    /// Anthropic messages surface.
    Messages,
}

/// Credential placement per provider family.
#[derive(Clone, Copy)]
pub enum UpstreamAuth<'a> {
    /// `Authorization: Bearer` (OpenAI and custom providers).
    Bearer(&'a str),
    /// `x-api-key` (Anthropic).
    XApiKey(&'a str),
    /// `api-key` (Azure OpenAI).
    AzureApiKey(&'a str),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("upstream unreachable: {0}")]
    Unreachable(reqwest::Error),
    #[error("upstream call timed out")]
    Timeout,
    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),
}

fn is_safe_path_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains('/') && !s.contains('\\') && s != ".." && s != "."
}

/// Replace the body's `model` field with the model the step declares.
pub fn override_model(body: &Value, model: &str) -> Value {
    let mut shaped = body.clone();
    if let Some(obj) = shaped.as_object_mut() {
        if !model.is_empty() {
            obj.insert("model".to_string(), Value::String(model.to_string()));
        }
    }
    shaped
}

fn anthropic_version<'a>(headers: &'a HeaderMap) -> &'a str {
    headers
        .get("anthropic-version")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(ANTHROPIC_DEFAULT_VERSION)
}

/// Build the target URL for a built-in provider family.
pub fn build_url(
    kind: &ProviderKind,
    setting: &ProviderSettingEntity,
    model: &str,
    endpoint: Endpoint,
) -> Result<String, DispatchError> {
    match kind {
        ProviderKind::OpenAi => {
            let base = setting.api_base.as_deref().unwrap_or(OPENAI_DEFAULT_BASE);
            let path = match endpoint {
                Endpoint::ChatCompletions => "/v1/chat/completions",
                Endpoint::Embeddings => "/v1/embeddings",
                Endpoint::Models => "/v1/models",
                Endpoint::Messages => {
                    return Err(DispatchError::InvalidTarget(
                        "openai settings cannot serve the messages surface".to_string(),
                    ))
                }
            };
            Ok(format!("{}{}", base.trim_end_matches('/'), path))
        }
        ProviderKind::Anthropic => {
            let base = setting.api_base.as_deref().unwrap_or(ANTHROPIC_DEFAULT_BASE);
            match endpoint {
                Endpoint::Messages | Endpoint::ChatCompletions => {
                    Ok(format!("{}/v1/messages", base.trim_end_matches('/')))
                }
                _ => Err(DispatchError::InvalidTarget(
                    "anthropic settings only serve the messages surface".to_string(),
                )),
            }
        }
        ProviderKind::Azure => {
            let api_version = setting
                .azure_api_version
                .as_deref()
                .unwrap_or(AZURE_DEFAULT_API_VERSION);
            // The deployment name is the step's declared model.
            if !is_safe_path_segment(model) {
                return Err(DispatchError::InvalidTarget(
                    "azure deployment must not contain path separators".to_string(),
                ));
            }
            let base = match setting.api_base.as_deref() {
                Some(base) => base.trim_end_matches('/').to_string(),
                None => {
                    let resource = setting.azure_resource.as_deref().ok_or_else(|| {
                        DispatchError::InvalidTarget("azure setting has no resource".to_string())
                    })?;
                    if !is_safe_path_segment(resource) {
                        return Err(DispatchError::InvalidTarget(
                            "azure resource must not contain path separators".to_string(),
                        ));
                    }
                    format!("https://{}.openai.azure.com", resource)
                }
            };
            let path = match endpoint {
                Endpoint::ChatCompletions | Endpoint::Messages => "chat/completions",
                Endpoint::Embeddings => "embeddings",
                Endpoint::Models => {
                    return Err(DispatchError::InvalidTarget(
                        "azure settings cannot list models".to_string(),
                    ))
                }
            };
            Ok(format!(
                "{}/openai/deployments/{}/{}?api-version={}",
                base, model, path, api_version
            ))
        }
        ProviderKind::Custom(name) => Err(DispatchError::InvalidTarget(format!(
            "custom provider {} requires a route config",
            name
        ))),
    }
}

fn apply_auth(request: reqwest::RequestBuilder, auth: UpstreamAuth<'_>) -> reqwest::RequestBuilder {
    match auth {
        UpstreamAuth::Bearer(credential) => {
            request.header("Authorization", format!("Bearer {}", credential))
        }
        UpstreamAuth::XApiKey(credential) => request.header("x-api-key", credential),
        UpstreamAuth::AzureApiKey(credential) => request.header("api-key", credential),
    }
}

/// Build a provider request with unified auth placement and required
/// provider headers.
pub fn build_upstream_request(
    client: &reqwest::Client,
    url: &str,
    payload: &Value,
    auth: UpstreamAuth<'_>,
    anthropic_version_header: Option<&str>,
    timeout: Duration,
) -> reqwest::RequestBuilder {
    let mut request = apply_auth(client.post(url).timeout(timeout), auth);

    if let Some(version) = anthropic_version_header {
        request = request.header("anthropic-version", version);
    }

    request.json(payload)
}

/// Per-provider forwarding of one shaped request.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Forward to a built-in provider family.
    ///
    /// Returns the open response whatever its status; transport failures
    /// and timeouts are the only errors.
    pub async fn dispatch(
        &self,
        kind: &ProviderKind,
        setting: &ProviderSettingEntity,
        model: &str,
        endpoint: Endpoint,
        body: &Value,
        inbound_headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<reqwest::Response, DispatchError> {
        if let ProviderKind::Custom(_) = kind {
            return Err(DispatchError::InvalidTarget(
                "custom providers dispatch through dispatch_custom".to_string(),
            ));
        }

        let url = build_url(kind, setting, model, endpoint)?;

        let (auth, version) = match kind {
            ProviderKind::OpenAi => (UpstreamAuth::Bearer(&setting.credential), None),
            ProviderKind::Anthropic => (
                UpstreamAuth::XApiKey(&setting.credential),
                Some(anthropic_version(inbound_headers)),
            ),
            ProviderKind::Azure => (UpstreamAuth::AzureApiKey(&setting.credential), None),
            ProviderKind::Custom(_) => unreachable!(),
        };

        let request = if endpoint == Endpoint::Models {
            apply_auth(self.client.get(&url).timeout(timeout), auth)
        } else {
            let shaped = override_model(body, model);
            build_upstream_request(&self.client, &url, &shaped, auth, version, timeout)
        };
        request.send().await.map_err(classify_transport_error)
    }

    /// Forward to an operator-defined custom provider.
    pub async fn dispatch_custom(
        &self,
        provider: &CustomProviderEntity,
        setting: &ProviderSettingEntity,
        path: &str,
        model: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, DispatchError> {
        let route_config = provider.find_route_config(path).ok_or_else(|| {
            DispatchError::InvalidTarget(format!(
                "custom provider {} has no route for {}",
                provider.name, path
            ))
        })?;

        let mut url = route_config.target_url.replace("{model}", model);
        let method = route_config
            .method
            .parse::<reqwest::Method>()
            .map_err(|_| {
                DispatchError::InvalidTarget(format!(
                    "invalid method {} on custom provider {}",
                    route_config.method, provider.name
                ))
            })?;

        if provider.auth_param_location.0 == AuthParamLocation::Query {
            let separator = if url.contains('?') { '&' } else { '?' };
            url = format!(
                "{}{}{}={}",
                url, separator, provider.auth_param_name, setting.credential
            );
        }

        let mut request = self
            .client
            .request(method, &url)
            .timeout(timeout)
            .json(&override_model(body, model));

        if provider.auth_param_location.0 == AuthParamLocation::Header {
            let value = if provider.auth_param_name.eq_ignore_ascii_case("authorization") {
                format!("Bearer {}", setting.credential)
            } else {
                setting.credential.clone()
            };
            request = request.header(provider.auth_param_name.as_str(), value);
        }
        for (name, value) in &route_config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        request.send().await.map_err(classify_transport_error)
    }
}

fn classify_transport_error(error: reqwest::Error) -> DispatchError {
    if error.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Unreachable(error)
    }
}

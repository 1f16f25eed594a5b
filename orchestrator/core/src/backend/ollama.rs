//! Ollama Backend Implementation
//!
//! Fleet client for Ollama instances.
//!
//! # Ollama API
//!
//! - `GET /api/tags` - models the instance can serve (name, size in bytes)
//! - `GET /api/ps` - models currently loaded in memory
//! - `POST /api/generate` - run a prompt (`stream: false`)
//!
//! Response parsing is split into pure functions so it can be tested without
//! a server.

use std::time::Duration;

use async_trait::async_trait;

use super::traits::{
    AdvertisedModel, BackendError, GenerateRequest, GenerateResponse, InferenceBackend,
};
use crate::registry::InstanceId;

/// Longest error body kept in a `Status` error
const MAX_ERROR_BODY: usize = 512;

/// Ollama fleet client
#[derive(Clone, Debug)]
pub struct OllamaClient {
    /// HTTP client shared across instances
    http_client: reqwest::Client,
}

impl OllamaClient {
    /// Create a client
    ///
    /// Timeouts are applied per request, so the client itself has none.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Setup`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::Setup(e.to_string()))?;
        Ok(Self { http_client })
    }

    /// Wrap an existing HTTP client
    #[must_use]
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    fn tags_url(instance: &InstanceId) -> String {
        format!("{}/api/tags", instance.base_url())
    }

    fn ps_url(instance: &InstanceId) -> String {
        format!("{}/api/ps", instance.base_url())
    }

    fn generate_url(instance: &InstanceId) -> String {
        format!("{}/api/generate", instance.base_url())
    }

    async fn get_json(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, BackendError> {
        let response = self
            .http_client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;
        read_json(response, timeout).await
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn list_models(
        &self,
        instance: &InstanceId,
        timeout: Duration,
    ) -> Result<Vec<AdvertisedModel>, BackendError> {
        let data = self.get_json(&Self::tags_url(instance), timeout).await?;
        parse_tags(&data)
    }

    async fn running_models(
        &self,
        instance: &InstanceId,
        timeout: Duration,
    ) -> Result<Vec<String>, BackendError> {
        let data = self.get_json(&Self::ps_url(instance), timeout).await?;
        Ok(parse_running(&data))
    }

    async fn generate(
        &self,
        instance: &InstanceId,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<GenerateResponse, BackendError> {
        let body = generate_body(request);

        let response = self
            .http_client
            .post(Self::generate_url(instance))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;

        let data = read_json(response, timeout).await?;
        parse_generate(&data, &request.model)
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

fn map_reqwest_error(error: &reqwest::Error, timeout: Duration) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(timeout)
    } else if error.is_decode() {
        BackendError::Decode(error.to_string())
    } else {
        BackendError::Transport(error.to_string())
    }
}

async fn read_json(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<serde_json::Value, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Status {
            status: status.as_u16(),
            body: truncate_body(body, MAX_ERROR_BODY),
        });
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| map_reqwest_error(&e, timeout))
}

/// Cut `body` to at most `max` bytes without splitting a character
fn truncate_body(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// JSON body for `/api/generate`
#[must_use]
pub fn generate_body(request: &GenerateRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": request.model,
        "prompt": request.prompt,
        "stream": false,
    });
    if let Some(ref options) = request.options {
        body["options"] = options.clone();
    }
    body
}

/// Parse an `/api/tags` response
///
/// # Errors
///
/// Returns [`BackendError::Decode`] if the `models` array is missing.
pub fn parse_tags(data: &serde_json::Value) -> Result<Vec<AdvertisedModel>, BackendError> {
    let models = data
        .get("models")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| BackendError::Decode("missing 'models' array".to_string()))?;

    Ok(models
        .iter()
        .filter_map(|m| {
            let name = m.get("name")?.as_str()?;
            let size = m.get("size").and_then(serde_json::Value::as_u64).unwrap_or(0);
            Some(AdvertisedModel::from_bytes(name, size))
        })
        .collect())
}

/// Parse an `/api/ps` response into model names
///
/// A missing or malformed list means nothing is loaded.
#[must_use]
pub fn parse_running(data: &serde_json::Value) -> Vec<String> {
    data.get("models")
        .and_then(serde_json::Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Parse an `/api/generate` response
///
/// # Errors
///
/// Returns [`BackendError::Decode`] if there is no `response` field, or
/// [`BackendError::Status`] if the server embedded an `error` field.
pub fn parse_generate(
    data: &serde_json::Value,
    model: &str,
) -> Result<GenerateResponse, BackendError> {
    if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
        return Err(BackendError::Status {
            status: 500,
            body: error.to_string(),
        });
    }

    let response = data
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| BackendError::Decode("missing 'response' field".to_string()))?
        .to_string();

    Ok(GenerateResponse {
        response,
        model: data
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string(),
        eval_count: data.get("eval_count").and_then(serde_json::Value::as_u64),
        total_duration: data
            .get("total_duration")
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_nanos),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_urls() {
        let id = InstanceId::new("192.168.0.224", 11435);
        assert_eq!(
            OllamaClient::tags_url(&id),
            "http://192.168.0.224:11435/api/tags"
        );
        assert_eq!(OllamaClient::ps_url(&id), "http://192.168.0.224:11435/api/ps");
        assert_eq!(
            OllamaClient::generate_url(&id),
            "http://192.168.0.224:11435/api/generate"
        );
    }

    #[test]
    fn test_parse_tags() {
        let data = json!({
            "models": [
                {
                    "name": "phi4",
                    "size": 2_800_000_000u64,
                    "details": { "parameter_size": "14B" }
                },
                { "name": "llama3.1:8b", "size": 8_000_000_000u64 },
                { "size": 1 },
                { "name": "nosize" }
            ]
        });

        let models = parse_tags(&data).unwrap();
        let names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["phi4", "llama3.1:8b", "nosize"]);
        assert!((models[0].size_gb - 2.8).abs() < 1e-9);
        assert!((models[1].size_gb - 8.0).abs() < 1e-9);
        assert_eq!(models[2].size_gb, 0.0);
    }

    #[test]
    fn test_parse_tags_missing_models() {
        let err = parse_tags(&json!({ "status": "ok" })).unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[test]
    fn test_parse_running() {
        let data = json!({ "models": [ { "name": "phi4" }, { "model": "x" } ] });
        assert_eq!(parse_running(&data), vec!["phi4".to_string()]);
        assert!(parse_running(&json!({})).is_empty());
    }

    #[test]
    fn test_parse_generate() {
        let data = json!({
            "model": "phi4",
            "response": "Hello there",
            "done": true,
            "eval_count": 12,
            "total_duration": 1_500_000_000u64
        });
        let parsed = parse_generate(&data, "fallback").unwrap();
        assert_eq!(parsed.response, "Hello there");
        assert_eq!(parsed.model, "phi4");
        assert_eq!(parsed.eval_count, Some(12));
        assert_eq!(parsed.total_duration, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_parse_generate_embedded_error() {
        let err = parse_generate(&json!({ "error": "model 'x' not found" }), "x").unwrap_err();
        assert_eq!(
            err,
            BackendError::Status {
                status: 500,
                body: "model 'x' not found".to_string()
            }
        );
    }

    #[test]
    fn test_error_body_truncated_on_char_boundary() {
        let body = format!("{}é tail", "x".repeat(MAX_ERROR_BODY - 1));
        let cut = truncate_body(body, MAX_ERROR_BODY);
        assert_eq!(cut.len(), MAX_ERROR_BODY - 1);
        assert!(cut.chars().all(|c| c == 'x'));

        assert_eq!(truncate_body("short".to_string(), MAX_ERROR_BODY), "short");
        assert_eq!(truncate_body("ééé".to_string(), 3), "é");
    }

    #[test]
    fn test_generate_body() {
        let body = generate_body(&GenerateRequest::new("phi4", "hi"));
        assert_eq!(
            body,
            json!({ "model": "phi4", "prompt": "hi", "stream": false })
        );

        let body = generate_body(
            &GenerateRequest::new("phi4", "hi").with_options(json!({ "num_predict": 64 })),
        );
        assert_eq!(body["options"]["num_predict"], 64);
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_transport_or_timeout() {
        let client = OllamaClient::new().unwrap();
        // Port 9 (discard) on localhost is almost never served by Ollama
        let result = client
            .list_models(&InstanceId::new("127.0.0.1", 9), Duration::from_millis(500))
            .await;
        let err = result.unwrap_err();
        assert!(err.is_instance_fault(), "unexpected error: {err:?}");
    }
}

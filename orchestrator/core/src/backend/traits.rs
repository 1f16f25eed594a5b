//! Inference Backend Traits
//!
//! Trait definitions for the model-serving instances the orchestrator talks
//! to. Every instance is a black box with a small HTTP surface:
//!
//! - list-models: which models it can serve, with their sizes
//! - running-models: which of those are resident in memory (optional)
//! - generate: run one prompt against one model
//!
//! Implementations handle wire formats; the orchestrator only sees the types
//! below.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::InstanceId;

/// Bytes per GB as reported by model servers (decimal)
pub const BYTES_PER_GB: f64 = 1_000_000_000.0;

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by backend calls
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The call did not finish within its timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Connection refused, reset, DNS failure, ...
    #[error("transport error: {0}")]
    Transport(String),

    /// The instance answered with a non-success status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// The response body could not be understood
    #[error("malformed response: {0}")]
    Decode(String),

    /// The client itself could not be built
    #[error("client setup failed: {0}")]
    Setup(String),
}

impl BackendError {
    /// Whether the failure says something about the instance's reachability
    ///
    /// Timeouts and transport errors do; a status code means the instance is
    /// up but refused this particular request.
    #[must_use]
    pub fn is_instance_fault(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// A model advertised by an instance
#[derive(Clone, Debug, PartialEq)]
pub struct AdvertisedModel {
    /// Model identifier
    pub name: String,
    /// Size in GB
    pub size_gb: f64,
}

impl AdvertisedModel {
    /// Create from a name and a size in bytes
    pub fn from_bytes(name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            size_gb: size_bytes as f64 / BYTES_PER_GB,
        }
    }
}

/// One generation request
#[derive(Clone, Debug, PartialEq)]
pub struct GenerateRequest {
    /// Model to run
    pub model: String,
    /// Prompt text
    pub prompt: String,
    /// Backend-specific generation options (temperature, `num_predict`, ...)
    pub options: Option<serde_json::Value>,
}

impl GenerateRequest {
    /// Create a request with no options
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            options: None,
        }
    }

    /// Attach generation options
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }
}

/// Result of a generation request
#[derive(Clone, Debug, PartialEq)]
pub struct GenerateResponse {
    /// Generated text
    pub response: String,
    /// Model that produced it
    pub model: String,
    /// Tokens generated, if reported
    pub eval_count: Option<u64>,
    /// Server-side duration, if reported
    pub total_duration: Option<Duration>,
}

// ============================================================================
// Backend Trait
// ============================================================================

/// A fleet-wide client for inference instances
///
/// One backend value talks to every instance; the target is passed per call.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logs (e.g. "ollama")
    fn name(&self) -> &'static str;

    /// Models the instance can serve
    async fn list_models(
        &self,
        instance: &InstanceId,
        timeout: Duration,
    ) -> Result<Vec<AdvertisedModel>, BackendError>;

    /// Models currently resident in memory
    ///
    /// Backends without this notion report none.
    async fn running_models(
        &self,
        _instance: &InstanceId,
        _timeout: Duration,
    ) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }

    /// Run one generation request
    async fn generate(
        &self,
        instance: &InstanceId,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<GenerateResponse, BackendError>;
}

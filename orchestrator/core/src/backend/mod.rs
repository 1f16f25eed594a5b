//! Inference Backend Integration
//!
//! Access to model-serving instances through a common trait.
//!
//! # Available Backends
//!
//! - **Ollama**: `/api/tags`, `/api/ps`, `/api/generate`
//!
//! # Usage
//!
//! ```ignore
//! use orchestrator_core::backend::{GenerateRequest, InferenceBackend, OllamaClient};
//! use orchestrator_core::registry::InstanceId;
//!
//! let client = OllamaClient::new()?;
//! let instance = InstanceId::new("localhost", 11434);
//! let models = client.list_models(&instance, Duration::from_secs(2)).await?;
//! ```

mod ollama;
mod traits;

pub use ollama::{generate_body, parse_generate, parse_running, parse_tags, OllamaClient};
pub use traits::{
    AdvertisedModel, BackendError, GenerateRequest, GenerateResponse, InferenceBackend,
    BYTES_PER_GB,
};

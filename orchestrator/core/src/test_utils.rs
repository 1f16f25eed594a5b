//! Mock Fleet
//!
//! A scriptable in-memory fleet implementing [`InferenceBackend`], for
//! testing discovery, routing and failover without real servers.
//!
//! # Usage
//!
//! ```ignore
//! let fleet = MockFleet::new();
//! fleet.add_instance(InstanceId::new("localhost", 11434), &[("phi4", 2.8)]);
//!
//! // Simulate a hung instance
//! fleet.set_generate(&id, GenerateBehavior::Hang);
//!
//! // After the test, verify which instances were called
//! assert_eq!(fleet.calls_to(&id), 1);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{
    AdvertisedModel, BackendError, GenerateRequest, GenerateResponse, InferenceBackend,
};
use crate::registry::InstanceId;

/// How a mock instance answers generate calls
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerateBehavior {
    /// Answer with `"<model>@<instance>: <prompt>"`
    Respond,
    /// Never answer
    Hang,
    /// Answer with an error status
    Status(u16),
    /// Fail with a transport error
    Transport,
}

#[derive(Clone, Debug)]
struct MockInstance {
    models: Vec<AdvertisedModel>,
    warm: Vec<String>,
    down: bool,
    hang: bool,
    hang_running: bool,
    generate: GenerateBehavior,
}

#[derive(Debug, Default)]
struct FleetState {
    instances: BTreeMap<InstanceId, MockInstance>,
    calls: Vec<(InstanceId, String)>,
}

/// In-memory fleet
#[derive(Clone, Debug, Default)]
pub struct MockFleet {
    state: Arc<Mutex<FleetState>>,
}

impl MockFleet {
    /// Empty fleet
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance serving `(model, size_gb)` pairs
    pub fn add_instance(&self, id: InstanceId, models: &[(&str, f64)]) {
        let models = models
            .iter()
            .map(|(name, size_gb)| AdvertisedModel {
                name: (*name).to_string(),
                size_gb: *size_gb,
            })
            .collect();
        self.state.lock().instances.insert(
            id,
            MockInstance {
                models,
                warm: Vec::new(),
                down: false,
                hang: false,
                hang_running: false,
                generate: GenerateBehavior::Respond,
            },
        );
    }

    /// Remove an instance entirely
    pub fn remove_instance(&self, id: &InstanceId) {
        self.state.lock().instances.remove(id);
    }

    /// Set the models resident in memory
    pub fn set_warm(&self, id: &InstanceId, models: &[&str]) {
        if let Some(instance) = self.state.lock().instances.get_mut(id) {
            instance.warm = models.iter().map(|m| (*m).to_string()).collect();
        }
    }

    /// Make every call to the instance fail with a transport error
    pub fn set_down(&self, id: &InstanceId, down: bool) {
        if let Some(instance) = self.state.lock().instances.get_mut(id) {
            instance.down = down;
        }
    }

    /// Make list-models calls hang
    pub fn set_hang(&self, id: &InstanceId, hang: bool) {
        if let Some(instance) = self.state.lock().instances.get_mut(id) {
            instance.hang = hang;
        }
    }

    /// Make running-model calls hang
    pub fn set_hang_running(&self, id: &InstanceId, hang: bool) {
        if let Some(instance) = self.state.lock().instances.get_mut(id) {
            instance.hang_running = hang;
        }
    }

    /// Script generate calls
    pub fn set_generate(&self, id: &InstanceId, behavior: GenerateBehavior) {
        if let Some(instance) = self.state.lock().instances.get_mut(id) {
            instance.generate = behavior;
        }
    }

    /// Every generate call as (instance, model), in order
    pub fn calls(&self) -> Vec<(InstanceId, String)> {
        self.state.lock().calls.clone()
    }

    /// Generate calls made to one instance
    pub fn calls_to(&self, id: &InstanceId) -> usize {
        self.state.lock().calls.iter().filter(|(i, _)| i == id).count()
    }

    fn instance(&self, id: &InstanceId) -> Result<MockInstance, BackendError> {
        match self.state.lock().instances.get(id) {
            Some(instance) if !instance.down => Ok(instance.clone()),
            _ => Err(BackendError::Transport(format!("connection refused: {id}"))),
        }
    }
}

#[async_trait]
impl InferenceBackend for MockFleet {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn list_models(
        &self,
        instance: &InstanceId,
        _timeout: Duration,
    ) -> Result<Vec<AdvertisedModel>, BackendError> {
        let mock = self.instance(instance)?;
        if mock.hang {
            return std::future::pending().await;
        }
        Ok(mock.models)
    }

    async fn running_models(
        &self,
        instance: &InstanceId,
        _timeout: Duration,
    ) -> Result<Vec<String>, BackendError> {
        let mock = self.instance(instance)?;
        if mock.hang_running {
            return std::future::pending().await;
        }
        Ok(mock.warm)
    }

    async fn generate(
        &self,
        instance: &InstanceId,
        request: &GenerateRequest,
        _timeout: Duration,
    ) -> Result<GenerateResponse, BackendError> {
        self.state
            .lock()
            .calls
            .push((instance.clone(), request.model.clone()));
        let mock = self.instance(instance)?;
        match mock.generate {
            GenerateBehavior::Respond => Ok(GenerateResponse {
                response: format!("{}@{}: {}", request.model, instance, request.prompt),
                model: request.model.clone(),
                eval_count: None,
                total_duration: None,
            }),
            GenerateBehavior::Hang => std::future::pending().await,
            GenerateBehavior::Status(status) => Err(BackendError::Status {
                status,
                body: "mock error".to_string(),
            }),
            GenerateBehavior::Transport => {
                Err(BackendError::Transport("connection reset".to_string()))
            }
        }
    }
}

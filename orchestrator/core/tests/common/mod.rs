//! Shared fixtures for integration tests
//!
//! [`Fleet`] is an in-memory stand-in for a set of Ollama servers. Each node
//! can be taken down, made to hang or made to answer with an error status.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use orchestrator_core::backend::{
    AdvertisedModel, BackendError, GenerateRequest, GenerateResponse, InferenceBackend,
};
use orchestrator_core::capability::{LatencyEnvelope, TierLatencies};
use orchestrator_core::discovery::{AddressSpace, DiscoveryTarget, PortRange};
use orchestrator_core::registry::Locality;
use orchestrator_core::{InstanceId, OrchestratorConfig};

/// How a node answers generate calls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Echo the prompt
    Answer,
    /// Never answer
    Hang,
    /// HTTP error status
    Status(u16),
}

#[derive(Clone, Debug)]
struct Node {
    models: Vec<(String, f64)>,
    up: bool,
    reply: Reply,
}

/// In-memory fleet of nodes
#[derive(Clone, Debug, Default)]
pub struct Fleet {
    nodes: Arc<Mutex<BTreeMap<InstanceId, Node>>>,
    generated: Arc<Mutex<Vec<InstanceId>>>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: &InstanceId, models: &[(&str, f64)]) {
        self.nodes.lock().insert(
            id.clone(),
            Node {
                models: models.iter().map(|(m, s)| ((*m).to_string(), *s)).collect(),
                up: true,
                reply: Reply::Answer,
            },
        );
    }

    pub fn set_up(&self, id: &InstanceId, up: bool) {
        if let Some(node) = self.nodes.lock().get_mut(id) {
            node.up = up;
        }
    }

    pub fn set_reply(&self, id: &InstanceId, reply: Reply) {
        if let Some(node) = self.nodes.lock().get_mut(id) {
            node.reply = reply;
        }
    }

    /// Instances that received generate calls, in order
    pub fn generated(&self) -> Vec<InstanceId> {
        self.generated.lock().clone()
    }

    fn node(&self, id: &InstanceId) -> Result<Node, BackendError> {
        match self.nodes.lock().get(id) {
            Some(node) if node.up => Ok(node.clone()),
            _ => Err(BackendError::Transport(format!("connection refused: {id}"))),
        }
    }
}

#[async_trait]
impl InferenceBackend for Fleet {
    fn name(&self) -> &'static str {
        "fleet"
    }

    async fn list_models(
        &self,
        instance: &InstanceId,
        _timeout: Duration,
    ) -> Result<Vec<AdvertisedModel>, BackendError> {
        let node = self.node(instance)?;
        Ok(node
            .models
            .into_iter()
            .map(|(name, size_gb)| AdvertisedModel { name, size_gb })
            .collect())
    }

    async fn generate(
        &self,
        instance: &InstanceId,
        request: &GenerateRequest,
        _timeout: Duration,
    ) -> Result<GenerateResponse, BackendError> {
        self.generated.lock().push(instance.clone());
        let node = self.node(instance)?;
        match node.reply {
            Reply::Answer => Ok(GenerateResponse {
                response: format!("{instance}: {}", request.prompt),
                model: request.model.clone(),
                eval_count: None,
                total_duration: None,
            }),
            Reply::Hang => std::future::pending().await,
            Reply::Status(status) => Err(BackendError::Status {
                status,
                body: "scripted failure".to_string(),
            }),
        }
    }
}

pub fn local(port: u16) -> InstanceId {
    InstanceId::new("localhost", port)
}

pub fn remote(host: &str) -> InstanceId {
    InstanceId::new(host, 11434)
}

/// Configuration over `instances` with millisecond-scale tier latencies
pub fn config_for(instances: &[(&InstanceId, Locality)]) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.discovery.address_space = AddressSpace::new(
        instances
            .iter()
            .map(|(id, locality)| {
                DiscoveryTarget::new(id.host.clone(), PortRange::single(id.port))
                    .with_locality(*locality)
            })
            .collect(),
    );
    config.discovery.probe_timeout = Duration::from_millis(200);
    config.capability.latencies = TierLatencies {
        fast: LatencyEnvelope::new(0.01, 0.05),
        balanced: LatencyEnvelope::new(0.05, 0.2),
        powerful: LatencyEnvelope::new(0.2, 1.0),
    };
    config
}

//! Workflow execution over [`Orchestrator::route_request`]

use std::time::Instant;

use futures::future::join_all;
use uuid::Uuid;

use super::{
    AutoOutcome, ModelChoice, StepOutcome, WorkflowRun, WorkflowStatus, WorkflowStep,
    WorkflowTemplate,
};
use crate::orchestrator::{Orchestrator, OrchestratorError, RouteParams};

impl Orchestrator {
    /// Every workflow template, in detection order
    #[must_use]
    pub fn list_workflows(&self) -> &[WorkflowTemplate] {
        self.workflows().templates()
    }

    /// Run the template `name` over `input`
    ///
    /// Steps run in order and each step's output is the next step's input.
    /// A failed step does not make this an error: the run comes back with
    /// [`WorkflowStatus::Failed`], the steps completed so far and the
    /// reason.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::UnknownWorkflow`] if no template has that name.
    pub async fn execute_workflow(
        &self,
        name: &str,
        input: &str,
        context: Option<&serde_json::Value>,
    ) -> Result<WorkflowRun, OrchestratorError> {
        let workflows = self.workflows();
        let template = workflows
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow {
                name: name.to_string(),
                available: workflows.names().join(", "),
            })?;
        Ok(self.run_workflow(template, input, context).await)
    }

    /// Run the first template whose triggers appear in `prompt`, or route
    /// the prompt once if none does
    ///
    /// # Errors
    ///
    /// Only when no template matched, the errors of
    /// [`Orchestrator::route_request`].
    pub async fn auto_orchestrate(&self, prompt: &str) -> Result<AutoOutcome, OrchestratorError> {
        if let Some(template) = self.workflows().detect(prompt) {
            tracing::debug!(template = %template.name, "Prompt matched workflow");
            return Ok(AutoOutcome::Workflow(
                self.run_workflow(template, prompt, None).await,
            ));
        }
        let response = self.route_request(RouteParams::new(prompt)).await?;
        Ok(AutoOutcome::Single(response))
    }

    async fn run_workflow(
        &self,
        template: &WorkflowTemplate,
        input: &str,
        context: Option<&serde_json::Value>,
    ) -> WorkflowRun {
        let workflow_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        tracing::info!(
            workflow_id = %workflow_id,
            template = %template.name,
            steps = template.steps.len(),
            "Workflow started"
        );

        let mut current = input.to_string();
        let mut steps = Vec::with_capacity(template.steps.len());
        let mut error = None;

        for (index, step) in template.steps.iter().enumerate() {
            let outcome = self.run_step(index + 1, step, &current, context).await;
            if outcome.success {
                tracing::info!(
                    workflow_id = %workflow_id,
                    step = outcome.step_number,
                    kind = %step.kind,
                    models = ?outcome.models_used,
                    latency_secs = outcome.latency_secs,
                    "Workflow step complete"
                );
                current.clone_from(&outcome.output);
                steps.push(outcome);
            } else {
                let reason = format!(
                    "step {} ({}) failed: {}",
                    outcome.step_number,
                    step.kind,
                    outcome.error.as_deref().unwrap_or("no response")
                );
                tracing::warn!(workflow_id = %workflow_id, "{reason}");
                error = Some(reason);
                steps.push(outcome);
                break;
            }
        }

        let status = if error.is_none() {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        self.metrics().record_workflow(error.is_none());
        let total_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            workflow_id = %workflow_id,
            template = %template.name,
            status = %status,
            total_secs,
            "Workflow finished"
        );

        WorkflowRun {
            workflow_id,
            template: template.name.clone(),
            status,
            steps,
            final_output: current,
            error,
            total_secs,
        }
    }

    async fn run_step(
        &self,
        step_number: usize,
        step: &WorkflowStep,
        input: &str,
        context: Option<&serde_json::Value>,
    ) -> StepOutcome {
        let prompt = step.kind.prompt(input, context);
        let (labels, requests): (Vec<String>, Vec<RouteParams>) = match &step.model {
            ModelChoice::Tier(tier) => (
                vec![step.model.to_string()],
                vec![RouteParams::new(prompt).with_tier(*tier)],
            ),
            ModelChoice::Model(model) => (
                vec![model.clone()],
                vec![RouteParams::new(prompt).with_model(model.clone())],
            ),
            ModelChoice::Parallel(models) => models
                .iter()
                .map(|m| (m.clone(), RouteParams::new(prompt.clone()).with_model(m.clone())))
                .unzip(),
        };
        let parallel = matches!(step.model, ModelChoice::Parallel(_));

        let started = Instant::now();
        let results = join_all(requests.into_iter().map(|p| self.route_request(p))).await;

        let mut sections = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        let mut models_used = Vec::new();
        let mut instances_used = Vec::new();
        for (label, result) in labels.iter().zip(results) {
            match result {
                Ok(response) => {
                    if parallel {
                        sections.push(format!(
                            "=== {} ===\n{}",
                            response.model_used, response.response
                        ));
                    } else {
                        sections.push(response.response);
                    }
                    models_used.push(response.model_used);
                    instances_used.push(response.instance_used);
                }
                Err(err) => errors.push(format!("{label}: {err}")),
            }
        }

        let success = errors.is_empty();
        StepOutcome {
            step_number,
            kind: step.kind,
            description: step.description.clone(),
            requested: step.model.to_string(),
            models_used,
            instances_used,
            success,
            output: if success {
                sections.join("\n\n")
            } else {
                String::new()
            },
            error: (!success).then(|| errors.join("; ")),
            latency_secs: started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::capability::{LatencyEnvelope, Tier, TierLatencies};
    use crate::config::OrchestratorConfig;
    use crate::discovery::{AddressSpace, DiscoveryTarget, PortRange};
    use crate::registry::InstanceId;
    use crate::test_utils::{GenerateBehavior, MockFleet};
    use crate::workflow::{StepKind, WorkflowCatalogue};
    use pretty_assertions::assert_eq;

    fn local() -> InstanceId {
        InstanceId::new("localhost", 11434)
    }

    fn remote() -> InstanceId {
        InstanceId::new("gpu-box", 11434)
    }

    fn setup() -> (MockFleet, Orchestrator) {
        let mut config = OrchestratorConfig::default();
        config.discovery.address_space = AddressSpace::new(vec![
            DiscoveryTarget::new("localhost", PortRange::single(11434)),
            DiscoveryTarget::new("gpu-box", PortRange::single(11434)),
        ]);
        config.discovery.probe_timeout = Duration::from_millis(200);
        config.capability.latencies = TierLatencies {
            fast: LatencyEnvelope::new(0.01, 0.05),
            balanced: LatencyEnvelope::new(0.05, 0.2),
            powerful: LatencyEnvelope::new(0.2, 1.0),
        };

        let fleet = MockFleet::new();
        fleet.add_instance(local(), &[("phi4", 2.8), ("qwen2.5:7b", 4.7)]);
        fleet.add_instance(remote(), &[("phi4", 2.8), ("gpt-oss:20b", 20.0)]);
        let orchestrator = Orchestrator::new(config, Arc::new(fleet.clone()));
        (fleet, orchestrator)
    }

    fn custom(steps: Vec<WorkflowStep>) -> WorkflowCatalogue {
        WorkflowCatalogue::new(vec![WorkflowTemplate {
            name: "custom".to_string(),
            title: "Custom".to_string(),
            description: "test template".to_string(),
            steps,
            estimated_secs: 1,
            required_tags: std::collections::BTreeSet::new(),
            triggers: vec!["custom please".to_string()],
        }])
    }

    #[tokio::test]
    async fn test_step_output_feeds_next_step() {
        let (_fleet, orchestrator) = setup();
        let context = serde_json::json!({"topic": "rust"});
        let run = orchestrator
            .execute_workflow("research_and_summarize", "tokio", Some(&context))
            .await
            .unwrap();

        assert_eq!(run.status, WorkflowStatus::Completed);
        assert!(run.succeeded());
        assert_eq!(run.error, None);
        let models: Vec<&str> = run
            .steps
            .iter()
            .flat_map(|s| s.models_used.iter().map(String::as_str))
            .collect();
        assert_eq!(models, vec!["phi4", "qwen2.5:7b", "phi4"]);

        // The mock echoes its prompt, so every output embeds the previous one
        let first = &run.steps[0].output;
        assert!(first.starts_with("phi4@localhost:11434: Research the following"));
        assert!(first.contains("tokio"));
        assert!(first.contains("Context: {\"topic\":\"rust\"}"));
        assert!(run.steps[1].output.contains(first.as_str()));
        assert!(run.steps[2].output.contains(run.steps[1].output.as_str()));
        assert_eq!(run.final_output, run.steps[2].output);
        assert_eq!(orchestrator.metrics().workflow_runs.get(), 1);
        assert_eq!(orchestrator.metrics().workflow_failures.get(), 0);
    }

    #[tokio::test]
    async fn test_failed_step_stops_workflow() {
        let (fleet, orchestrator) = setup();
        let orchestrator = orchestrator.with_workflows(custom(vec![
            WorkflowStep::tier(StepKind::Generate, Tier::Fast, "draft"),
            WorkflowStep::model(StepKind::Refine, "mistral", "unknown model"),
            WorkflowStep::tier(StepKind::Summarize, Tier::Fast, "never runs"),
        ]));

        let run = orchestrator
            .execute_workflow("custom", "input", None)
            .await
            .unwrap();

        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.steps.len(), 2);
        assert!(run.steps[0].success);
        assert!(!run.steps[1].success);
        assert!(run.steps[1].error.as_deref().unwrap().starts_with("mistral: "));
        assert!(run.error.as_deref().unwrap().starts_with("step 2 (refine) failed"));
        assert_eq!(run.final_output, run.steps[0].output);
        assert_eq!(fleet.calls().len(), 1);
        assert_eq!(orchestrator.metrics().workflow_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_parallel_step_combines_outputs() {
        let (_fleet, orchestrator) = setup();
        let orchestrator = orchestrator.with_workflows(custom(vec![WorkflowStep::parallel(
            StepKind::Compare,
            &["phi4", "qwen2.5:7b", "gpt-oss:20b"],
            "perspectives",
        )]));

        let run = orchestrator
            .execute_workflow("custom", "tabs or spaces", None)
            .await
            .unwrap();

        assert!(run.succeeded());
        let step = &run.steps[0];
        assert_eq!(step.models_used, vec!["phi4", "qwen2.5:7b", "gpt-oss:20b"]);
        assert_eq!(step.instances_used, vec![local(), local(), remote()]);
        let phi = step.output.find("=== phi4 ===").unwrap();
        let qwen = step.output.find("=== qwen2.5:7b ===").unwrap();
        let oss = step.output.find("=== gpt-oss:20b ===").unwrap();
        assert!(phi < qwen && qwen < oss);
    }

    #[tokio::test]
    async fn test_parallel_step_fails_if_any_model_fails() {
        let (fleet, orchestrator) = setup();
        fleet.set_generate(&remote(), GenerateBehavior::Status(500));
        let orchestrator = orchestrator.with_workflows(custom(vec![WorkflowStep::parallel(
            StepKind::Compare,
            &["qwen2.5:7b", "gpt-oss:20b"],
            "perspectives",
        )]));

        let run = orchestrator
            .execute_workflow("custom", "x", None)
            .await
            .unwrap();

        assert_eq!(run.status, WorkflowStatus::Failed);
        let step = &run.steps[0];
        assert_eq!(step.models_used, vec!["qwen2.5:7b"]);
        assert!(step.error.as_deref().unwrap().starts_with("gpt-oss:20b: "));
        assert_eq!(step.output, "");
        assert_eq!(run.final_output, "x");
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let (_fleet, orchestrator) = setup();
        let err = orchestrator
            .execute_workflow("nope", "x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_workflow");
        assert!(err.to_string().contains("code_review"));
    }

    #[tokio::test]
    async fn test_auto_orchestrate() {
        let (_fleet, orchestrator) = setup();
        let orchestrator = orchestrator.with_workflows(custom(vec![WorkflowStep::tier(
            StepKind::Summarize,
            Tier::Fast,
            "summary",
        )]));

        match orchestrator.auto_orchestrate("Custom please: hello").await.unwrap() {
            AutoOutcome::Workflow(run) => {
                assert_eq!(run.template, "custom");
                assert!(run.succeeded());
            }
            AutoOutcome::Single(_) => panic!("expected a workflow run"),
        }

        match orchestrator.auto_orchestrate("hello").await.unwrap() {
            AutoOutcome::Single(response) => assert!(response.response.contains("hello")),
            AutoOutcome::Workflow(_) => panic!("expected a single request"),
        }
    }

    #[tokio::test]
    async fn test_list_workflows_defaults_to_builtins() {
        let (_fleet, orchestrator) = setup();
        assert_eq!(orchestrator.list_workflows().len(), 5);
    }
}

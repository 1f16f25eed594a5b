//! Multi-Step Workflows
//!
//! A workflow template is an ordered list of steps. Each step routes one
//! request through the orchestrator, or several in parallel, and its
//! output becomes the next step's input:
//!
//! ```text
//! input ──▶ [research: fast] ──▶ [analyze: balanced] ──▶ [summarize: fast] ──▶ final output
//!                 │                      │                       │
//!            route_request          route_request           route_request
//! ```
//!
//! A failed step stops the run; the run keeps every completed step and the
//! last successful output. Templates are matched against free-text prompts
//! by whole-word trigger phrases for `auto_orchestrate`.

mod runner;
mod templates;

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::capability::Tier;
use crate::keywords::Words;
use crate::orchestrator::RouteResponse;
use crate::registry::InstanceId;

pub use templates::builtin_templates;

// ============================================================================
// Steps
// ============================================================================

/// What a step asks the model to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Gather information on a topic
    Research,
    /// Extract insights
    Analyze,
    /// Combine pieces into a whole
    Synthesize,
    /// Produce new content
    Generate,
    /// Check accuracy and quality
    Validate,
    /// Condense
    Summarize,
    /// Contrast perspectives
    Compare,
    /// Improve a draft
    Refine,
}

impl StepKind {
    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Analyze => "analyze",
            Self::Synthesize => "synthesize",
            Self::Generate => "generate",
            Self::Validate => "validate",
            Self::Summarize => "summarize",
            Self::Compare => "compare",
            Self::Refine => "refine",
        }
    }

    fn instruction(self) -> &'static str {
        match self {
            Self::Research => "Research the following topic and gather relevant information:",
            Self::Analyze => "Analyze the following data and provide insights:",
            Self::Synthesize => "Synthesize the following information into a coherent whole:",
            Self::Generate => "Generate content based on:",
            Self::Validate => "Validate and check the following for accuracy and quality:",
            Self::Summarize => "Provide a concise summary of:",
            Self::Compare => "Compare and contrast perspectives on:",
            Self::Refine => "Refine and improve the following:",
        }
    }

    /// Prompt for this step over `input`, with optional caller context
    #[must_use]
    pub fn prompt(&self, input: &str, context: Option<&serde_json::Value>) -> String {
        let mut prompt = format!("{}\n{input}", self.instruction());
        if let Some(context) = context {
            prompt.push_str(&format!("\n\nContext: {context}"));
        }
        prompt
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a step picks its model
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelChoice {
    /// Best model of a tier
    Tier(Tier),
    /// One named model
    Model(String),
    /// Several named models at once; outputs are concatenated
    Parallel(Vec<String>),
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tier(tier) => write!(f, "tier {tier}"),
            Self::Model(model) => f.write_str(model),
            Self::Parallel(models) => write!(f, "{} in parallel", models.join(", ")),
        }
    }
}

/// One step of a template
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowStep {
    /// Instruction given to the model
    pub kind: StepKind,
    /// Model selection
    pub model: ModelChoice,
    /// Human-readable purpose
    pub description: String,
}

impl WorkflowStep {
    /// Step routed by tier
    pub fn tier(kind: StepKind, tier: Tier, description: impl Into<String>) -> Self {
        Self {
            kind,
            model: ModelChoice::Tier(tier),
            description: description.into(),
        }
    }

    /// Step pinned to a model
    pub fn model(kind: StepKind, model: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            model: ModelChoice::Model(model.into()),
            description: description.into(),
        }
    }

    /// Step fanned out over several models
    pub fn parallel(kind: StepKind, models: &[&str], description: impl Into<String>) -> Self {
        Self {
            kind,
            model: ModelChoice::Parallel(models.iter().map(|m| (*m).to_string()).collect()),
            description: description.into(),
        }
    }
}

// ============================================================================
// Templates
// ============================================================================

/// A named, reusable sequence of steps
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowTemplate {
    /// Key used to run the template
    pub name: String,
    /// Display title
    pub title: String,
    /// What the template is for
    pub description: String,
    /// Steps in order
    pub steps: Vec<WorkflowStep>,
    /// Rough end-to-end time on a healthy fleet
    pub estimated_secs: u64,
    /// Task tags the steps rely on
    pub required_tags: BTreeSet<String>,
    /// Phrases that select this template from a prompt
    pub triggers: Vec<String>,
}

impl WorkflowTemplate {
    /// Whether `words` contains one of the trigger phrases
    #[must_use]
    pub fn matches(&self, words: &Words) -> bool {
        self.triggers.iter().any(|t| words.contains_phrase(t))
    }
}

/// Ordered set of templates
#[derive(Clone, Debug)]
pub struct WorkflowCatalogue {
    templates: Vec<WorkflowTemplate>,
}

impl Default for WorkflowCatalogue {
    fn default() -> Self {
        Self::new(builtin_templates())
    }
}

impl WorkflowCatalogue {
    /// Catalogue over `templates`; detection tries them in order
    #[must_use]
    pub fn new(templates: Vec<WorkflowTemplate>) -> Self {
        Self { templates }
    }

    /// Every template
    #[must_use]
    pub fn templates(&self) -> &[WorkflowTemplate] {
        &self.templates
    }

    /// Template names, in order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.name.as_str()).collect()
    }

    /// Template by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// First template whose triggers appear in `prompt`
    #[must_use]
    pub fn detect(&self, prompt: &str) -> Option<&WorkflowTemplate> {
        let words = Words::new(prompt);
        self.templates.iter().find(|t| t.matches(&words))
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Result of one step
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepOutcome {
    /// 1-based position
    pub step_number: usize,
    /// Step kind
    pub kind: StepKind,
    /// Step purpose
    pub description: String,
    /// Model selection the step asked for
    pub requested: String,
    /// Models that answered
    pub models_used: Vec<String>,
    /// Instances that answered
    pub instances_used: Vec<InstanceId>,
    /// Whether every request of the step succeeded
    pub success: bool,
    /// Text handed to the next step
    pub output: String,
    /// Failure reasons
    pub error: Option<String>,
    /// Wall time of the step
    pub latency_secs: f64,
}

/// Final state of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Every step succeeded
    Completed,
    /// A step failed and the run stopped
    Failed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// One execution of a template
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowRun {
    /// Run identifier
    pub workflow_id: String,
    /// Template name
    pub template: String,
    /// Final state
    pub status: WorkflowStatus,
    /// Steps attempted, in order
    pub steps: Vec<StepOutcome>,
    /// Output of the last successful step, or the input if none succeeded
    pub final_output: String,
    /// Why the run stopped early
    pub error: Option<String>,
    /// Wall time of the whole run
    pub total_secs: f64,
}

impl WorkflowRun {
    /// Whether every step succeeded
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// What `auto_orchestrate` ended up doing
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AutoOutcome {
    /// A template matched and ran
    Workflow(WorkflowRun),
    /// No template matched; the prompt was routed once
    Single(RouteResponse),
}

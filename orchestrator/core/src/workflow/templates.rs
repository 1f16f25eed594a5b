//! Built-in workflow templates

use std::collections::BTreeSet;

use super::{StepKind, WorkflowStep, WorkflowTemplate};
use crate::capability::Tier;

fn template(
    name: &str,
    title: &str,
    description: &str,
    estimated_secs: u64,
    tags: &[&str],
    triggers: &[&str],
    steps: Vec<WorkflowStep>,
) -> WorkflowTemplate {
    WorkflowTemplate {
        name: name.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        steps,
        estimated_secs,
        required_tags: tags.iter().map(|t| (*t).to_string()).collect::<BTreeSet<_>>(),
        triggers: triggers.iter().map(|t| (*t).to_string()).collect(),
    }
}

/// Templates shipped with the orchestrator, in detection order
#[must_use]
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    use StepKind::{Analyze, Compare, Generate, Refine, Research, Summarize, Synthesize, Validate};

    vec![
        template(
            "research_and_summarize",
            "Research and Summarize",
            "Gather, analyze and summarize information",
            60,
            &["general"],
            &[
                "research",
                "find information",
                "summarize findings",
                "look up and summarize",
                "investigate",
            ],
            vec![
                WorkflowStep::tier(Research, Tier::Fast, "Gather initial information"),
                WorkflowStep::tier(Analyze, Tier::Balanced, "Analyze gathered data"),
                WorkflowStep::tier(Summarize, Tier::Fast, "Create concise summary"),
            ],
        ),
        template(
            "code_review",
            "Comprehensive Code Review",
            "Multi-perspective code analysis",
            120,
            &["code", "reasoning"],
            &[
                "review code",
                "code review",
                "check code",
                "analyze code",
                "code feedback",
                "improve code",
            ],
            vec![
                WorkflowStep::model(Analyze, "codellama:33b", "Deep code analysis"),
                WorkflowStep::model(Validate, "gpt-oss:20b", "Security and best practices check"),
                WorkflowStep::model(Generate, "codellama:33b", "Generate improvement suggestions"),
                WorkflowStep::tier(Synthesize, Tier::Balanced, "Combine all feedback"),
            ],
        ),
        template(
            "multi_model_consensus",
            "Multi-Model Consensus",
            "Gather perspectives from several models and reconcile them",
            90,
            &["general", "reasoning"],
            &[
                "compare models",
                "multiple perspectives",
                "consensus",
                "different opinions",
                "various models",
            ],
            vec![
                WorkflowStep::parallel(
                    Compare,
                    &["phi4", "qwen2.5:7b", "llama3.1:8b"],
                    "Gather multiple perspectives",
                ),
                WorkflowStep::model(Synthesize, "gpt-oss:20b", "Synthesize consensus view"),
            ],
        ),
        template(
            "iterative_refinement",
            "Iterative Refinement",
            "Progressively improve output quality",
            150,
            &["general", "reasoning"],
            &[
                "refine",
                "improve iteratively",
                "make it better",
                "polish",
                "enhance progressively",
            ],
            vec![
                WorkflowStep::tier(Generate, Tier::Fast, "Initial draft"),
                WorkflowStep::tier(Analyze, Tier::Balanced, "Identify improvements"),
                WorkflowStep::tier(Refine, Tier::Powerful, "Apply refinements"),
                WorkflowStep::tier(Validate, Tier::Balanced, "Quality check"),
            ],
        ),
        template(
            "document_processing",
            "Document Processing Pipeline",
            "Process large documents in stages",
            180,
            &["general", "reasoning"],
            &[
                "process document",
                "analyze document",
                "large document",
                "pdf",
                "extract from document",
            ],
            vec![
                WorkflowStep::model(Analyze, "phi4", "Quick document structure analysis"),
                WorkflowStep::model(Research, "llama3.1:8b", "Extract key information"),
                WorkflowStep::model(Synthesize, "gpt-oss:20b", "Deep analysis and insights"),
                WorkflowStep::model(Summarize, "phi4", "Executive summary"),
            ],
        ),
    ]
}

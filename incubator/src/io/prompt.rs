//! Prompt rendering for every model task.
//!
//! Each template starts with a `Task: <name>` header line. Command-backed
//! models ignore it; [`MockProvider`](super::provider::MockProvider) uses it
//! to pick a canned response.

use std::fmt;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

const IDEAS_TEMPLATE: &str = include_str!("prompts/ideas.md");
const FEEDBACK_TEMPLATE: &str = include_str!("prompts/feedback.md");
const SELECT_TEMPLATE: &str = include_str!("prompts/select.md");
const BUILD_TEMPLATE: &str = include_str!("prompts/build.md");
const ADVISOR_REVIEW_TEMPLATE: &str = include_str!("prompts/advisor_review.md");
const ITERATE_TEMPLATE: &str = include_str!("prompts/iterate.md");
const PITCH_TEMPLATE: &str = include_str!("prompts/pitch.md");
const INVESTOR_EVAL_TEMPLATE: &str = include_str!("prompts/investor_eval.md");

const SYSTEM_PROMPT: &str = "You are a participant in a startup incubator simulation. \
Reply with exactly one JSON object and no other text.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Ideas,
    Feedback,
    Select,
    Build,
    AdvisorReview,
    Iterate,
    Pitch,
    InvestorEval,
}

impl TaskKind {
    pub const ALL: [TaskKind; 8] = [
        TaskKind::Ideas,
        TaskKind::Feedback,
        TaskKind::Select,
        TaskKind::Build,
        TaskKind::AdvisorReview,
        TaskKind::Iterate,
        TaskKind::Pitch,
        TaskKind::InvestorEval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Ideas => "ideas",
            TaskKind::Feedback => "feedback",
            TaskKind::Select => "select",
            TaskKind::Build => "build",
            TaskKind::AdvisorReview => "advisor_review",
            TaskKind::Iterate => "iterate",
            TaskKind::Pitch => "pitch",
            TaskKind::InvestorEval => "investor_eval",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    fn template(self) -> &'static str {
        match self {
            TaskKind::Ideas => IDEAS_TEMPLATE,
            TaskKind::Feedback => FEEDBACK_TEMPLATE,
            TaskKind::Select => SELECT_TEMPLATE,
            TaskKind::Build => BUILD_TEMPLATE,
            TaskKind::AdvisorReview => ADVISOR_REVIEW_TEMPLATE,
            TaskKind::Iterate => ITERATE_TEMPLATE,
            TaskKind::Pitch => PITCH_TEMPLATE,
            TaskKind::InvestorEval => INVESTOR_EVAL_TEMPLATE,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for kind in TaskKind::ALL {
            env.add_template(kind.as_str(), kind.template())
                .expect("prompt template should be valid");
        }
        Self { env }
    }

    pub fn system(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    /// Render the prompt for `kind` with a serializable context.
    pub fn render<S: Serialize>(&self, kind: TaskKind, ctx: S) -> Result<String> {
        let template = self.env.get_template(kind.as_str())?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render {kind} prompt"))?;
        debug!(task = %kind, bytes = rendered.len(), "rendered prompt");
        Ok(rendered)
    }
}

/// Pretty JSON for embedding records in a prompt.
pub fn json_block(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;
    use serde_json::json;

    #[test]
    fn every_template_starts_with_its_task_header() {
        let engine = PromptEngine::new();
        for kind in TaskKind::ALL {
            let rendered = engine
                .render(kind, context! { count => 2, role => "technical_advisor", round => 1 })
                .expect("render");
            let first = rendered.lines().next().expect("first line");
            assert_eq!(first, format!("Task: {kind}"));
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn ideas_prompt_mentions_sector_only_when_set() {
        let engine = PromptEngine::new();
        let focused = engine
            .render(
                TaskKind::Ideas,
                context! { provider => "openai", count => 3, sector_focus => "fintech" },
            )
            .expect("render");
        assert!(focused.contains("Count: 3"));
        assert!(focused.contains("in the fintech sector"));

        let open = engine
            .render(TaskKind::Ideas, context! { provider => "openai", count => 3 })
            .expect("render");
        assert!(!open.contains("sector"));
    }

    #[test]
    fn advisor_prompt_includes_previous_feedback() {
        let engine = PromptEngine::new();
        let previous = json_block(&json!({"issues": ["pricing unclear"]}));
        let rendered = engine
            .render(
                TaskKind::AdvisorReview,
                context! {
                    reviewer => "gemini",
                    role => "financial_advisor",
                    plan => json_block(&json!({"idea_id": "a-1"})),
                    previous_feedback => previous,
                },
            )
            .expect("render");
        assert!(rendered.contains("Role: financial_advisor"));
        assert!(rendered.contains("financial advisor for a founder"));
        assert!(rendered.contains("pricing unclear"));
    }
}

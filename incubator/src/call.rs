//! Retry-and-validate wrapper around a single structured model call.
//!
//! Each attempt runs provider → extract → normalize → validate. Extraction
//! and validation failures consume an attempt; provider errors do not, since
//! providers retry their own transient failures.

use std::fmt;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::extract::extract_json;
use crate::core::normalize::Action;
use crate::core::types::Stage;
use crate::core::validate::{CompiledSchema, validate};
use crate::io::provider::Provider;

/// One structured request.
#[derive(Debug, Clone, Copy)]
pub struct CallSpec<'a> {
    pub stage: Stage,
    pub participant: &'a str,
    /// Short name of the call (`ideas`, `review:gemini`), used in logs and errors.
    pub label: &'a str,
    pub prompt: &'a str,
    pub system: &'a str,
    pub schema: &'a CompiledSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Natively structured endpoints get exactly one attempt.
    pub fn attempts_for(&self, provider: &dyn Provider) -> u32 {
        if provider.natively_structured() {
            1
        } else {
            self.max_attempts.max(1)
        }
    }
}

/// Every attempt of a structured call failed extraction or validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallExhaustedError {
    pub stage: Stage,
    pub participant: String,
    pub label: String,
    pub attempts: u32,
    /// Field path of the last validation failure, if any attempt got that far.
    pub field_path: Option<String>,
    pub last_error: String,
}

impl fmt::Display for CallExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} call `{}` for {} failed after {} attempt(s)",
            self.stage, self.label, self.participant, self.attempts
        )?;
        if let Some(field) = &self.field_path {
            write!(f, " at field `{field}`")?;
        }
        write!(f, ": {}", self.last_error)
    }
}

impl std::error::Error for CallExhaustedError {}

/// Request structured output from `provider` and return the validated value.
pub fn call_structured(
    provider: &dyn Provider,
    spec: &CallSpec<'_>,
    policy: RetryPolicy,
) -> Result<Value> {
    let attempts = policy.attempts_for(provider);
    let mut last_error = String::new();
    let mut field_path = None;

    for attempt in 1..=attempts {
        let prompt = if attempt == 1 {
            spec.prompt.to_string()
        } else {
            retry_prompt(spec.prompt, &last_error)
        };
        let raw = provider.generate(&prompt, spec.system).with_context(|| {
            format!(
                "{} call `{}` to provider {}",
                spec.stage,
                spec.label,
                provider.name()
            )
        })?;

        let extracted = match extract_json(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    stage = %spec.stage,
                    participant = spec.participant,
                    call = spec.label,
                    attempt,
                    attempts,
                    outcome = "extraction_failed",
                    err = %err,
                    "structured call attempt failed"
                );
                last_error = err.to_string();
                field_path = None;
                continue;
            }
        };

        let normalized = spec.schema.normalizer().normalize(&extracted);
        for adjustment in &normalized.adjustments {
            if adjustment.action == Action::DefaultInjected {
                info!(
                    call = spec.label,
                    participant = spec.participant,
                    field = %adjustment.path,
                    "injected default for missing field"
                );
            } else {
                debug!(
                    call = spec.label,
                    field = %adjustment.path,
                    action = ?adjustment.action,
                    "normalized field"
                );
            }
        }

        match validate(normalized.value, spec.schema) {
            Ok(value) => {
                debug!(
                    stage = %spec.stage,
                    participant = spec.participant,
                    call = spec.label,
                    attempt,
                    outcome = "ok",
                    "structured call attempt succeeded"
                );
                return Ok(value);
            }
            Err(err) => {
                warn!(
                    stage = %spec.stage,
                    participant = spec.participant,
                    call = spec.label,
                    attempt,
                    attempts,
                    outcome = "validation_failed",
                    field = %err.field_path,
                    err = %err,
                    "structured call attempt failed"
                );
                field_path = Some(err.field_path.clone());
                last_error = err.to_string();
            }
        }
    }

    Err(CallExhaustedError {
        stage: spec.stage,
        participant: spec.participant.to_string(),
        label: spec.label.to_string(),
        attempts,
        field_path,
        last_error,
    }
    .into())
}

fn retry_prompt(prompt: &str, last_error: &str) -> String {
    format!(
        "{prompt}\n\nYour previous response could not be used: {last_error}\n\
         Respond with a single JSON object that matches the schema exactly."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalize::NormalizeOptions;
    use crate::core::schema;
    use crate::test_support::ScriptedProvider;

    fn feedback_schema() -> CompiledSchema {
        CompiledSchema::compile(schema::feedback(), NormalizeOptions::default()).expect("compile")
    }

    fn spec<'a>(schema: &'a CompiledSchema) -> CallSpec<'a> {
        CallSpec {
            stage: Stage::Stage1,
            participant: "openai",
            label: "feedback",
            prompt: "Task: feedback",
            system: "",
            schema,
        }
    }

    const VALID: &str = r#"Sure! ```json
{"idea_id": "oa-1", "reviewer_provider": "gemini", "score": 7.5,
 "top_strength": ["Big market", "Timing"], "top_weakness": "Moat",
 "suggestion": "Narrow the wedge"}
```"#;

    #[test]
    fn extracts_normalizes_and_validates() {
        let schema = feedback_schema();
        let provider = ScriptedProvider::new("gemini", vec![Ok(VALID.to_string())]);
        let value = call_structured(&provider, &spec(&schema), RetryPolicy::new(3)).expect("call");
        assert_eq!(value["top_strength"], "Big market\nTiming");
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn retries_after_extraction_and_validation_failures() {
        let schema = feedback_schema();
        let provider = ScriptedProvider::new(
            "gemini",
            vec![
                Ok("I cannot answer that.".to_string()),
                Ok(r#"{"idea_id": "oa-1"}"#.to_string()),
                Ok(VALID.to_string()),
            ],
        );
        let value = call_structured(&provider, &spec(&schema), RetryPolicy::new(3)).expect("call");
        assert_eq!(value["idea_id"], "oa-1");
        assert_eq!(provider.calls(), 3);
        let prompts = provider.prompts();
        assert!(prompts[1].contains("could not be used"));
    }

    #[test]
    fn exhaustion_names_stage_participant_and_field() {
        let schema = feedback_schema();
        let provider = ScriptedProvider::new(
            "gemini",
            vec![
                Ok(r#"{"idea_id": "oa-1"}"#.to_string()),
                Ok(r#"{"idea_id": "oa-1"}"#.to_string()),
            ],
        );
        let err = call_structured(&provider, &spec(&schema), RetryPolicy::new(2))
            .expect_err("exhausted");
        let exhausted = err
            .downcast_ref::<CallExhaustedError>()
            .expect("typed error");
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(exhausted.field_path.as_deref(), Some("reviewer_provider"));
        let message = err.to_string();
        assert!(message.contains("stage1"));
        assert!(message.contains("openai"));
        assert!(message.contains("feedback"));
    }

    #[test]
    fn native_structured_provider_gets_one_attempt() {
        let schema = feedback_schema();
        let provider = ScriptedProvider::new("gemini", vec![Ok("not json".to_string())])
            .natively_structured(true);
        let err = call_structured(&provider, &spec(&schema), RetryPolicy::new(5))
            .expect_err("single attempt");
        let exhausted = err
            .downcast_ref::<CallExhaustedError>()
            .expect("typed error");
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(exhausted.field_path, None);
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn provider_errors_propagate_without_retry() {
        let schema = feedback_schema();
        let provider = ScriptedProvider::new("gemini", vec![Err("connection reset".to_string())]);
        let err = call_structured(&provider, &spec(&schema), RetryPolicy::new(3))
            .expect_err("provider error");
        assert!(format!("{err:#}").contains("connection reset"));
        assert_eq!(provider.calls(), 1);
    }
}

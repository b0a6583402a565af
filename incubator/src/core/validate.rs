//! Schema validation for normalized model output.
//!
//! Validation is delegated to `jsonschema` (Draft 2020-12). When it fails, the
//! document is walked against the source [`Schema`] to name the first
//! offending field, which is what retries and failure ledgers report.

use std::fmt;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;

use super::normalize::{NormalizeOptions, Normalizer, join_path};
use super::schema::{FieldKind, Schema, SchemaKind};

const ACTUAL_CHARS: usize = 80;

/// Structured output did not conform to its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaValidationError {
    pub schema: String,
    /// Dotted path of the first offending field (empty for the root).
    pub field_path: String,
    pub expected: String,
    pub actual: String,
    /// Raw validator messages, for logs.
    pub messages: Vec<String>,
}

impl fmt::Display for SchemaValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = if self.field_path.is_empty() {
            "<root>"
        } else {
            self.field_path.as_str()
        };
        write!(
            f,
            "{} schema violated at `{at}`: expected {}, got {}",
            self.schema, self.expected, self.actual
        )
    }
}

impl std::error::Error for SchemaValidationError {}

/// A schema together with its compiled validator and derived normalizer.
pub struct CompiledSchema {
    schema: Schema,
    validator: Validator,
    normalizer: Normalizer,
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("schema", &self.schema.name)
            .finish_non_exhaustive()
    }
}

impl CompiledSchema {
    pub fn compile(schema: Schema, options: NormalizeOptions) -> Result<Self> {
        let document = schema.to_json_schema();
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&document)
            .with_context(|| format!("compile json schema {}", schema.name))?;
        let normalizer = Normalizer::new(schema.clone(), options);
        Ok(Self {
            schema,
            validator,
            normalizer,
        })
    }

    pub fn name(&self) -> &'static str {
        self.schema.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}

/// Return `value` unchanged if it conforms to `schema`.
pub fn validate(value: Value, schema: &CompiledSchema) -> Result<Value, SchemaValidationError> {
    if schema.validator.is_valid(&value) {
        return Ok(value);
    }
    let messages: Vec<String> = schema
        .validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    let violation = find_violation(&value, &schema.schema, "").unwrap_or_else(|| Violation {
        field_path: String::new(),
        expected: "a document matching the schema".to_string(),
        actual: messages
            .first()
            .cloned()
            .unwrap_or_else(|| describe(&value)),
    });
    Err(SchemaValidationError {
        schema: schema.name().to_string(),
        field_path: violation.field_path,
        expected: violation.expected,
        actual: violation.actual,
        messages,
    })
}

/// Every built-in schema compiled once at pipeline start.
#[derive(Debug)]
pub struct SchemaRegistry {
    idea_batch: CompiledSchema,
    feedback: CompiledSchema,
    selection: CompiledSchema,
    startup_plan: CompiledSchema,
    advisor_review: CompiledSchema,
    pitch: CompiledSchema,
    investor_decision: CompiledSchema,
}

impl SchemaRegistry {
    pub fn builtin(options: NormalizeOptions) -> Result<Self> {
        let compile = |kind: SchemaKind| CompiledSchema::compile(kind.schema(), options);
        Ok(Self {
            idea_batch: compile(SchemaKind::IdeaBatch)?,
            feedback: compile(SchemaKind::Feedback)?,
            selection: compile(SchemaKind::Selection)?,
            startup_plan: compile(SchemaKind::StartupPlan)?,
            advisor_review: compile(SchemaKind::AdvisorReview)?,
            pitch: compile(SchemaKind::Pitch)?,
            investor_decision: compile(SchemaKind::InvestorDecision)?,
        })
    }

    pub fn get(&self, kind: SchemaKind) -> &CompiledSchema {
        match kind {
            SchemaKind::IdeaBatch => &self.idea_batch,
            SchemaKind::Feedback => &self.feedback,
            SchemaKind::Selection => &self.selection,
            SchemaKind::StartupPlan => &self.startup_plan,
            SchemaKind::AdvisorReview => &self.advisor_review,
            SchemaKind::Pitch => &self.pitch,
            SchemaKind::InvestorDecision => &self.investor_decision,
        }
    }
}

struct Violation {
    field_path: String,
    expected: String,
    actual: String,
}

fn find_violation(value: &Value, schema: &Schema, at: &str) -> Option<Violation> {
    let Value::Object(map) = value else {
        return Some(Violation {
            field_path: at.to_string(),
            expected: format!("object ({})", schema.name),
            actual: describe(value),
        });
    };
    for field in &schema.fields {
        let path = join_path(at, field.name);
        match map.get(field.name) {
            None if field.required => {
                return Some(Violation {
                    field_path: path,
                    expected: format!("required {}", field.kind.label()),
                    actual: "missing".to_string(),
                });
            }
            None => {}
            Some(child) => {
                if let Some(violation) = check_kind(child, &field.kind, &path) {
                    return Some(violation);
                }
            }
        }
    }
    if !schema.additional_properties {
        if let Some(key) = map.keys().find(|key| schema.field(key).is_none()) {
            return Some(Violation {
                field_path: join_path(at, key),
                expected: "no additional properties".to_string(),
                actual: "unexpected field".to_string(),
            });
        }
    }
    None
}

fn check_kind(value: &Value, kind: &FieldKind, at: &str) -> Option<Violation> {
    let mismatch = || {
        Some(Violation {
            field_path: at.to_string(),
            expected: kind.label(),
            actual: describe(value),
        })
    };
    match kind {
        FieldKind::Text | FieldKind::Prose => {
            if !value.is_string() {
                return mismatch();
            }
        }
        FieldKind::Boolean => {
            if !value.is_boolean() {
                return mismatch();
            }
        }
        FieldKind::Enum(values) => match value.as_str() {
            Some(current) if values.contains(&current) => {}
            _ => return mismatch(),
        },
        FieldKind::Integer { min, max } => {
            let Some(number) = value.as_f64() else {
                return mismatch();
            };
            if number.fract() != 0.0 {
                return mismatch();
            }
            let below = min.is_some_and(|min| number < min as f64);
            let above = max.is_some_and(|max| number > max as f64);
            if below || above {
                return Some(Violation {
                    field_path: at.to_string(),
                    expected: range_label("integer", *min, *max),
                    actual: describe(value),
                });
            }
        }
        FieldKind::Number { min, max } => {
            let Some(number) = value.as_f64() else {
                return mismatch();
            };
            let below = min.is_some_and(|min| number < min);
            let above = max.is_some_and(|max| number > max);
            if below || above {
                return Some(Violation {
                    field_path: at.to_string(),
                    expected: range_label("number", *min, *max),
                    actual: describe(value),
                });
            }
        }
        FieldKind::Object(schema) => return find_violation(value, schema, at),
        FieldKind::Array { items, min_items } => {
            let Some(values) = value.as_array() else {
                return mismatch();
            };
            if let Some(min_items) = min_items {
                if values.len() < *min_items {
                    return Some(Violation {
                        field_path: at.to_string(),
                        expected: format!("at least {min_items} items"),
                        actual: format!("{} items", values.len()),
                    });
                }
            }
            for (index, item) in values.iter().enumerate() {
                if let Some(violation) = check_kind(item, items, &format!("{at}[{index}]")) {
                    return Some(violation);
                }
            }
        }
    }
    None
}

fn range_label<T: fmt::Display>(name: &str, min: Option<T>, max: Option<T>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("{name} in {min}..={max}"),
        (Some(min), None) => format!("{name} >= {min}"),
        (None, Some(max)) => format!("{name} <= {max}"),
        (None, None) => name.to_string(),
    }
}

fn describe(value: &Value) -> String {
    let kind = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    let rendered = value.to_string();
    if rendered.chars().count() > ACTUAL_CHARS {
        let cut: String = rendered.chars().take(ACTUAL_CHARS).collect();
        format!("{kind} {cut}...")
    } else {
        format!("{kind} {rendered}")
    }
}

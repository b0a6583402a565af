//! Declarative schemas for model outputs.
//!
//! A [`Schema`] is the single description both the normalizer and the
//! validator work from: the normalizer derives its rules from field kinds
//! and defaults, the validator compiles it to JSON Schema (Draft 2020-12).

use serde_json::{Map, Value, json};

/// Expected type of one schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Short string (identifiers, amounts). Arrays are not tolerated.
    Text,
    /// Free-form prose. Arrays of strings are tolerated and joined by newline.
    Prose,
    Integer { min: Option<i64>, max: Option<i64> },
    Number { min: Option<f64>, max: Option<f64> },
    Boolean,
    /// String constrained to a closed set, canonical case as listed.
    Enum(&'static [&'static str]),
    Object(Schema),
    Array {
        items: Box<FieldKind>,
        min_items: Option<usize>,
    },
}

impl FieldKind {
    pub fn integer(min: i64, max: i64) -> Self {
        FieldKind::Integer {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn number(min: f64, max: f64) -> Self {
        FieldKind::Number {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn array_of(items: FieldKind) -> Self {
        FieldKind::Array {
            items: Box::new(items),
            min_items: None,
        }
    }

    pub fn array_min(items: FieldKind, min_items: usize) -> Self {
        FieldKind::Array {
            items: Box::new(items),
            min_items: Some(min_items),
        }
    }

    /// Human-readable type label used in validation errors.
    pub fn label(&self) -> String {
        match self {
            FieldKind::Text | FieldKind::Prose => "string".to_string(),
            FieldKind::Integer { .. } => "integer".to_string(),
            FieldKind::Number { .. } => "number".to_string(),
            FieldKind::Boolean => "boolean".to_string(),
            FieldKind::Enum(values) => format!("one of [{}]", values.join(", ")),
            FieldKind::Object(schema) => format!("object ({})", schema.name),
            FieldKind::Array { items, .. } => format!("array of {}", items.label()),
        }
    }

    fn to_json_schema(&self) -> Value {
        match self {
            FieldKind::Text | FieldKind::Prose => json!({"type": "string"}),
            FieldKind::Integer { min, max } => {
                let mut out = json!({"type": "integer"});
                if let Some(min) = min {
                    out["minimum"] = json!(min);
                }
                if let Some(max) = max {
                    out["maximum"] = json!(max);
                }
                out
            }
            FieldKind::Number { min, max } => {
                let mut out = json!({"type": "number"});
                if let Some(min) = min {
                    out["minimum"] = json!(min);
                }
                if let Some(max) = max {
                    out["maximum"] = json!(max);
                }
                out
            }
            FieldKind::Boolean => json!({"type": "boolean"}),
            FieldKind::Enum(values) => json!({"type": "string", "enum": values}),
            FieldKind::Object(schema) => schema.object_json_schema(),
            FieldKind::Array { items, min_items } => {
                let mut out = json!({"type": "array", "items": items.to_json_schema()});
                if let Some(min_items) = min_items {
                    out["minItems"] = json!(min_items);
                }
                out
            }
        }
    }
}

/// One named field in an object schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Value injected by the normalizer when the field is absent.
    pub default: Option<Value>,
}

impl Field {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Object schema: named fields plus the additional-properties policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub name: &'static str,
    pub fields: Vec<Field>,
    pub additional_properties: bool,
}

impl Schema {
    pub fn strict(name: &'static str, fields: Vec<Field>) -> Self {
        Self {
            name,
            fields,
            additional_properties: false,
        }
    }

    pub fn open(name: &'static str, fields: Vec<Field>) -> Self {
        Self {
            name,
            fields,
            additional_properties: true,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Compile to a standalone Draft 2020-12 JSON Schema document.
    pub fn to_json_schema(&self) -> Value {
        let mut out = self.object_json_schema();
        out["$schema"] = json!("https://json-schema.org/draft/2020-12/schema");
        out["title"] = json!(self.name);
        out
    }

    fn object_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            properties.insert(field.name.to_string(), field.kind.to_json_schema());
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required)
            .map(|field| field.name)
            .collect();
        json!({
            "type": "object",
            "additionalProperties": self.additional_properties,
            "required": required,
            "properties": properties,
        })
    }
}

/// Identifies each model output the pipeline asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchemaKind {
    IdeaBatch,
    Feedback,
    Selection,
    StartupPlan,
    AdvisorReview,
    Pitch,
    InvestorDecision,
}

impl SchemaKind {
    pub const ALL: [SchemaKind; 7] = [
        SchemaKind::IdeaBatch,
        SchemaKind::Feedback,
        SchemaKind::Selection,
        SchemaKind::StartupPlan,
        SchemaKind::AdvisorReview,
        SchemaKind::Pitch,
        SchemaKind::InvestorDecision,
    ];

    pub fn schema(self) -> Schema {
        match self {
            SchemaKind::IdeaBatch => idea_batch(),
            SchemaKind::Feedback => feedback(),
            SchemaKind::Selection => selection(),
            SchemaKind::StartupPlan => startup_plan(),
            SchemaKind::AdvisorReview => advisor_review(),
            SchemaKind::Pitch => pitch(),
            SchemaKind::InvestorDecision => investor_decision(),
        }
    }
}

pub const ADVISOR_ROLES: &[&str] = &["market_strategist", "technical_advisor", "financial_advisor"];
pub const SEVERITIES: &[&str] = &["low", "medium", "high", "critical"];
pub const DECISIONS: &[&str] = &["invest", "pass"];
pub const NOT_SPECIFIED: &str = "Not specified";

pub fn idea_card() -> Schema {
    Schema::strict(
        "idea_card",
        vec![
            Field::required("idea_id", FieldKind::Text),
            Field::required("title", FieldKind::Text),
            Field::required("summary", FieldKind::Prose),
            Field::required("target_customer", FieldKind::Prose),
            Field::required("why_now", FieldKind::Prose),
            Field::required("market_size_estimate", FieldKind::Prose),
            Field::required("unfair_advantage", FieldKind::Prose),
            Field::required("proposer_provider", FieldKind::Text),
        ],
    )
}

pub fn idea_batch() -> Schema {
    Schema::strict(
        "idea_batch",
        vec![Field::required(
            "ideas",
            FieldKind::array_min(FieldKind::Object(idea_card()), 1),
        )],
    )
}

pub fn feedback() -> Schema {
    Schema::strict(
        "feedback",
        vec![
            Field::required("idea_id", FieldKind::Text),
            Field::required("reviewer_provider", FieldKind::Text),
            Field::required("score", FieldKind::number(0.0, 10.0)),
            Field::required("top_strength", FieldKind::Prose),
            Field::required("top_weakness", FieldKind::Prose),
            Field::required("suggestion", FieldKind::Prose),
        ],
    )
}

pub fn selection() -> Schema {
    Schema::strict(
        "selection",
        vec![
            Field::required("selected_idea_id", FieldKind::Text),
            Field::required("founder_provider", FieldKind::Text),
            Field::required("reasoning", FieldKind::Prose),
            Field::required("refined_idea", FieldKind::Object(idea_card())),
        ],
    )
}

pub fn startup_plan() -> Schema {
    let market = Schema::strict(
        "market",
        vec![
            Field::required("tam", FieldKind::Prose),
            Field::required("sam", FieldKind::Prose),
            Field::required("som", FieldKind::Prose),
            Field::required("growth_rate", FieldKind::Prose),
            Field::required("reasoning", FieldKind::Prose),
        ],
    );
    let business_model = Schema::strict(
        "business_model",
        vec![
            Field::required("revenue_model", FieldKind::Prose),
            Field::required("pricing", FieldKind::Prose),
            Field::required("unit_economics", FieldKind::Prose),
        ],
    );
    let competitor = Schema::strict(
        "competitor",
        vec![
            Field::required("competitor", FieldKind::Text),
            Field::required("strength", FieldKind::Prose),
            Field::required("weakness", FieldKind::Prose),
            Field::required("our_advantage", FieldKind::Prose),
        ],
    );
    let risk = Schema::strict(
        "risk",
        vec![
            Field::required("risk", FieldKind::Prose),
            Field::required("severity", FieldKind::Enum(SEVERITIES)),
            Field::required("mitigation", FieldKind::Prose),
        ],
    );
    let funding_ask = Schema::strict(
        "funding_ask",
        vec![
            Field::required("amount", FieldKind::Text),
            Field::required("use_of_funds", FieldKind::Prose),
            Field::required("target_metrics", FieldKind::Prose),
            Field::required("proposed_valuation", FieldKind::Prose)
                .with_default(json!(NOT_SPECIFIED)),
        ],
    );
    Schema::strict(
        "startup_plan",
        vec![
            Field::required("idea_id", FieldKind::Text),
            Field::required("founder_provider", FieldKind::Text),
            Field::required("problem", FieldKind::Prose),
            Field::required("solution", FieldKind::Prose),
            Field::required("market", FieldKind::Object(market)),
            Field::required("business_model", FieldKind::Object(business_model)),
            Field::required("go_to_market", FieldKind::Prose),
            Field::required(
                "competitive_landscape",
                FieldKind::array_min(FieldKind::Object(competitor), 3),
            ),
            Field::required(
                "risks_and_mitigations",
                FieldKind::array_min(FieldKind::Object(risk), 1),
            ),
            Field::required("twelve_month_roadmap", FieldKind::Prose),
            Field::required("funding_ask", FieldKind::Object(funding_ask)),
            Field::optional("changelog", FieldKind::array_of(FieldKind::Prose))
                .with_default(json!([])),
        ],
    )
}

pub fn advisor_review() -> Schema {
    Schema::strict(
        "advisor_review",
        vec![
            Field::required("idea_id", FieldKind::Text),
            Field::required("reviewer_provider", FieldKind::Text),
            Field::required("advisor_role", FieldKind::Enum(ADVISOR_ROLES)),
            Field::required("readiness_score", FieldKind::integer(1, 10)),
            Field::required("issues", FieldKind::array_of(FieldKind::Prose)),
            Field::required("strength", FieldKind::Prose),
            Field::required("ready_for_pitch", FieldKind::Boolean),
        ],
    )
}

pub fn pitch() -> Schema {
    Schema::strict(
        "pitch",
        vec![
            Field::required("idea_id", FieldKind::Text),
            Field::required("founder_provider", FieldKind::Text),
            Field::required("elevator_pitch", FieldKind::Prose),
            Field::required("problem_solution_fit", FieldKind::Prose),
            Field::required("traction_validation", FieldKind::Prose),
            Field::required("team_requirements", FieldKind::Prose),
            Field::required("the_ask", FieldKind::Prose),
            Field::required("why_now", FieldKind::Prose),
            Field::required("five_year_vision", FieldKind::Prose),
        ],
    )
}

pub fn investor_decision() -> Schema {
    let terms = Schema::strict(
        "proposed_terms",
        vec![
            Field::required("check_size", FieldKind::Text),
            Field::required("valuation_range", FieldKind::Text),
            Field::required("key_conditions", FieldKind::Prose),
        ],
    );
    Schema::strict(
        "investor_decision",
        vec![
            Field::required("idea_id", FieldKind::Text),
            Field::required("investor_provider", FieldKind::Text),
            Field::required("decision", FieldKind::Enum(DECISIONS)),
            Field::required("conviction_score", FieldKind::integer(1, 10)),
            Field::required("rationale", FieldKind::Prose),
            Field::optional("proposed_terms", FieldKind::Object(terms)),
            Field::required("would_change_mind", FieldKind::Prose)
                .with_default(json!(NOT_SPECIFIED)),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_required_and_properties() {
        let schema = feedback().to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["properties"]["score"]["maximum"], 10.0);
        let required = schema["required"].as_array().expect("required array");
        assert!(required.contains(&json!("top_weakness")));
    }

    #[test]
    fn optional_fields_are_not_required() {
        let schema = startup_plan().to_json_schema();
        let required = schema["required"].as_array().expect("required array");
        assert!(!required.contains(&json!("changelog")));
        assert_eq!(
            schema["properties"]["competitive_landscape"]["minItems"],
            3
        );
        assert_eq!(
            schema["properties"]["risks_and_mitigations"]["items"]["properties"]["severity"]["enum"],
            json!(["low", "medium", "high", "critical"])
        );
    }

    #[test]
    fn every_kind_has_a_named_schema() {
        for kind in SchemaKind::ALL {
            let schema = kind.schema();
            assert!(!schema.fields.is_empty(), "{kind:?} has no fields");
            assert_eq!(schema.to_json_schema()["title"], schema.name);
        }
    }
}

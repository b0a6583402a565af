//! Schema-driven repair of common model-output deviations.
//!
//! Models routinely return a list of bullet strings where prose is expected,
//! `5.0` where an integer is expected, `"HIGH"` where the enum says `high`,
//! or omit a field that has an obvious default. The [`Normalizer`] fixes
//! exactly those shapes before validation and leaves everything else alone.
//!
//! Rules are derived once from a [`Schema`] and never change afterwards.
//! Normalization never fails: anything it cannot reconcile passes through
//! unchanged for the validator to report.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::schema::{FieldKind, Schema};

/// Enum case-folding stops descending below this nesting depth.
pub const MAX_DEPTH: usize = 50;

/// One step of a field selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(&'static str),
    /// Every element of an array.
    Each,
}

/// Alternate shape a rule accepts in place of the canonical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    StringArray,
    Float,
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Join an array of strings with `"\n"`.
    JoinLines,
    /// Round a float to the nearest integer, ties away from zero.
    RoundToInteger,
    /// Insert the value when the key is absent.
    InjectDefault(Value),
}

/// How one schema field is repaired.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationRule {
    pub selector: Vec<Segment>,
    pub accepts: Shape,
    pub transform: Transform,
}

impl NormalizationRule {
    /// Dotted rendering of the selector (`risks_and_mitigations[].severity`).
    pub fn selector_path(&self) -> String {
        let mut out = String::new();
        for segment in &self.selector {
            match segment {
                Segment::Key(key) => out = join_path(&out, key),
                Segment::Each => out.push_str("[]"),
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Drop keys the schema does not declare when it forbids extras.
    pub strip_unknown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Joined,
    Rounded,
    DefaultInjected,
    CaseFolded,
    Stripped,
}

/// A single change made to the document, with the concrete field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjustment {
    pub path: String,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub value: Value,
    pub adjustments: Vec<Adjustment>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    schema: Schema,
    rules: Vec<NormalizationRule>,
    enums: BTreeMap<&'static str, &'static [&'static str]>,
    options: NormalizeOptions,
}

impl Normalizer {
    pub fn new(schema: Schema, options: NormalizeOptions) -> Self {
        let mut rules = Vec::new();
        let mut enums = BTreeMap::new();
        derive_object(&schema, &[], &mut rules, &mut enums);
        Self {
            schema,
            rules,
            enums,
            options,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rules(&self) -> &[NormalizationRule] {
        &self.rules
    }

    /// Return a repaired copy of `value`. The input is never mutated.
    pub fn normalize(&self, value: &Value) -> Normalized {
        let mut out = value.clone();
        let mut adjustments = Vec::new();

        if self.options.strip_unknown {
            strip_object(&mut out, &self.schema, "", &mut adjustments);
        }
        for rule in &self.rules {
            apply_rule(&mut out, &rule.selector, rule, String::new(), &mut adjustments);
        }
        if !self.enums.is_empty() {
            fold_enums(&mut out, &self.enums, 0, "", &mut adjustments);
        }

        Normalized {
            value: out,
            adjustments,
        }
    }
}

/// Normalize with default options.
pub fn normalize(value: &Value, schema: &Schema) -> Value {
    Normalizer::new(schema.clone(), NormalizeOptions::default())
        .normalize(value)
        .value
}

pub(crate) fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn derive_object(
    schema: &Schema,
    prefix: &[Segment],
    rules: &mut Vec<NormalizationRule>,
    enums: &mut BTreeMap<&'static str, &'static [&'static str]>,
) {
    for field in &schema.fields {
        let mut selector = prefix.to_vec();
        selector.push(Segment::Key(field.name));
        if let Some(default) = &field.default {
            rules.push(NormalizationRule {
                selector: selector.clone(),
                accepts: Shape::Absent,
                transform: Transform::InjectDefault(default.clone()),
            });
        }
        if let FieldKind::Enum(values) = &field.kind {
            enums.entry(field.name).or_insert(*values);
        }
        derive_kind(&field.kind, selector, rules, enums);
    }
}

fn derive_kind(
    kind: &FieldKind,
    selector: Vec<Segment>,
    rules: &mut Vec<NormalizationRule>,
    enums: &mut BTreeMap<&'static str, &'static [&'static str]>,
) {
    match kind {
        FieldKind::Prose => rules.push(NormalizationRule {
            selector,
            accepts: Shape::StringArray,
            transform: Transform::JoinLines,
        }),
        FieldKind::Integer { .. } => rules.push(NormalizationRule {
            selector,
            accepts: Shape::Float,
            transform: Transform::RoundToInteger,
        }),
        FieldKind::Object(schema) => derive_object(schema, &selector, rules, enums),
        FieldKind::Array { items, .. } => {
            let mut selector = selector;
            selector.push(Segment::Each);
            derive_kind(items, selector, rules, enums);
        }
        FieldKind::Text | FieldKind::Number { .. } | FieldKind::Boolean | FieldKind::Enum(_) => {}
    }
}

fn apply_rule(
    node: &mut Value,
    selector: &[Segment],
    rule: &NormalizationRule,
    at: String,
    out: &mut Vec<Adjustment>,
) {
    match (selector, &rule.transform) {
        ([Segment::Key(key)], Transform::InjectDefault(default)) => {
            let Value::Object(map) = node else {
                return;
            };
            if !map.contains_key(*key) {
                map.insert((*key).to_string(), default.clone());
                out.push(Adjustment {
                    path: join_path(&at, key),
                    action: Action::DefaultInjected,
                });
            }
        }
        ([], transform) => {
            if let Some(action) = apply_transform(node, transform) {
                out.push(Adjustment { path: at, action });
            }
        }
        ([Segment::Key(key), rest @ ..], _) => {
            if let Some(child) = node.as_object_mut().and_then(|map| map.get_mut(*key)) {
                apply_rule(child, rest, rule, join_path(&at, key), out);
            }
        }
        ([Segment::Each, rest @ ..], _) => {
            if let Value::Array(items) = node {
                for (index, item) in items.iter_mut().enumerate() {
                    apply_rule(item, rest, rule, format!("{at}[{index}]"), out);
                }
            }
        }
    }
}

fn apply_transform(node: &mut Value, transform: &Transform) -> Option<Action> {
    match transform {
        Transform::JoinLines => {
            let Value::Array(items) = node else {
                return None;
            };
            let parts: Option<Vec<&str>> = items.iter().map(Value::as_str).collect();
            let joined = parts?.join("\n");
            *node = Value::String(joined);
            Some(Action::Joined)
        }
        Transform::RoundToInteger => {
            let Value::Number(number) = node else {
                return None;
            };
            if number.is_i64() || number.is_u64() {
                return None;
            }
            let rounded = number.as_f64()?.round();
            if !rounded.is_finite() || rounded < i64::MIN as f64 || rounded > i64::MAX as f64 {
                return None;
            }
            *node = Value::from(rounded as i64);
            Some(Action::Rounded)
        }
        Transform::InjectDefault(_) => None,
    }
}

fn strip_object(node: &mut Value, schema: &Schema, at: &str, out: &mut Vec<Adjustment>) {
    let Value::Object(map) = node else {
        return;
    };
    if !schema.additional_properties {
        let unknown: Vec<String> = map
            .keys()
            .filter(|key| schema.field(key).is_none())
            .cloned()
            .collect();
        for key in unknown {
            map.remove(&key);
            out.push(Adjustment {
                path: join_path(at, &key),
                action: Action::Stripped,
            });
        }
    }
    for field in &schema.fields {
        if let Some(child) = map.get_mut(field.name) {
            strip_kind(child, &field.kind, &join_path(at, field.name), out);
        }
    }
}

fn strip_kind(node: &mut Value, kind: &FieldKind, at: &str, out: &mut Vec<Adjustment>) {
    match kind {
        FieldKind::Object(schema) => strip_object(node, schema, at, out),
        FieldKind::Array { items, .. } => {
            if let Value::Array(values) = node {
                for (index, value) in values.iter_mut().enumerate() {
                    strip_kind(value, items, &format!("{at}[{index}]"), out);
                }
            }
        }
        _ => {}
    }
}

fn fold_enums(
    node: &mut Value,
    enums: &BTreeMap<&'static str, &'static [&'static str]>,
    depth: usize,
    at: &str,
    out: &mut Vec<Adjustment>,
) {
    if depth > MAX_DEPTH {
        tracing::debug!(path = at, "enum normalization depth bound reached");
        return;
    }
    match node {
        Value::Object(map) => fold_object(map, enums, depth, at, out),
        Value::Array(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                fold_enums(item, enums, depth + 1, &format!("{at}[{index}]"), out);
            }
        }
        _ => {}
    }
}

fn fold_object(
    map: &mut Map<String, Value>,
    enums: &BTreeMap<&'static str, &'static [&'static str]>,
    depth: usize,
    at: &str,
    out: &mut Vec<Adjustment>,
) {
    for (key, value) in map.iter_mut() {
        let path = join_path(at, key);
        let Some(allowed) = enums.get(key.as_str()) else {
            fold_enums(value, enums, depth + 1, &path, out);
            continue;
        };
        let Value::String(current) = value else {
            fold_enums(value, enums, depth + 1, &path, out);
            continue;
        };
        let wanted = current.trim();
        let canonical = allowed
            .iter()
            .copied()
            .find(|candidate| candidate.eq_ignore_ascii_case(wanted));
        if let Some(canonical) = canonical {
            if canonical != current.as_str() {
                *current = canonical.to_string();
                out.push(Adjustment {
                    path,
                    action: Action::CaseFolded,
                });
            }
        }
    }
}

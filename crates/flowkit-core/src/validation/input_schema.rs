//! Input schema validation
//!
//! Validates and normalizes a raw input payload against a pipeline's declared
//! variable schema before a run starts. Pure function: no side effects, and
//! problems are reported as structured issues, never as errors.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Declared type of an input variable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    /// Whole numbers only; distinct from `number`.
    Integer,
    Boolean,
}

impl Display for VariableType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            VariableType::String => write!(f, "string"),
            VariableType::Number => write!(f, "number"),
            VariableType::Integer => write!(f, "integer"),
            VariableType::Boolean => write!(f, "boolean"),
        }
    }
}

/// One declared variable: type, whether it must be provided, and an optional
/// default applied when it is absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableSpec {
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Declaration-ordered variable schema. Order matters for issue reporting,
/// hence the index map.
pub type InputSchema = IndexMap<String, VariableSpec>;

/// One problem found in the raw payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

/// Validation result. `data` always contains defaults applied, regardless of
/// validity, so callers can inspect partial results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub data: Map<String, Value>,
    pub issues: Vec<ValidationIssue>,
}

/// Validate `raw` against `schema`.
///
/// For each declared variable in schema order: absent or null values take the
/// default when one exists; otherwise a `required` variable produces an issue
/// and is left unset. Present values are type-checked. Fields not declared in
/// the schema pass through unchanged — the schema is additive, not exclusive.
pub fn validate_input(schema: &InputSchema, raw: &Map<String, Value>) -> ValidationOutcome {
    let mut data = raw.clone();
    let mut issues = Vec::new();

    for (name, spec) in schema {
        let provided = raw.get(name).filter(|v| !v.is_null());
        match provided {
            None => {
                if let Some(default) = &spec.default {
                    data.insert(name.clone(), default.clone());
                } else if spec.required {
                    issues.push(ValidationIssue {
                        field: name.clone(),
                        message: format!("required variable '{}' is missing", name),
                    });
                    data.remove(name);
                }
            }
            Some(value) => {
                if !type_matches(spec.var_type, value) {
                    issues.push(ValidationIssue {
                        field: name.clone(),
                        message: format!(
                            "expected {}, got {}",
                            spec.var_type,
                            type_name_of(value)
                        ),
                    });
                }
            }
        }
    }

    ValidationOutcome {
        valid: issues.is_empty(),
        data,
        issues,
    }
}

fn type_matches(expected: VariableType, value: &Value) -> bool {
    match expected {
        VariableType::String => value.is_string(),
        VariableType::Number => value.is_number(),
        VariableType::Integer => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            _ => false,
        },
        VariableType::Boolean => value.is_boolean(),
    }
}

fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(entries: &[(&str, VariableType, bool, Option<Value>)]) -> InputSchema {
        entries
            .iter()
            .map(|(name, ty, required, default)| {
                (
                    name.to_string(),
                    VariableSpec {
                        var_type: *ty,
                        required: *required,
                        default: default.clone(),
                    },
                )
            })
            .collect()
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn valid_payload_passes_through() {
        let schema = schema(&[
            ("topic", VariableType::String, true, None),
            ("max_items", VariableType::Integer, false, None),
        ]);
        let outcome = validate_input(&schema, &obj(json!({"topic": "rust", "max_items": 20})));
        assert!(outcome.valid);
        assert!(outcome.issues.is_empty());
        assert_eq!(outcome.data["topic"], json!("rust"));
    }

    #[test]
    fn integer_rejects_string_twenty() {
        let schema = schema(&[("max_items", VariableType::Integer, false, None)]);
        let outcome = validate_input(&schema, &obj(json!({"max_items": "20"})));
        assert!(!outcome.valid);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].field, "max_items");
    }

    #[test]
    fn integer_rejects_fractional_number() {
        let schema = schema(&[("count", VariableType::Integer, true, None)]);
        assert!(!validate_input(&schema, &obj(json!({"count": 2.5}))).valid);
        assert!(validate_input(&schema, &obj(json!({"count": 2.0}))).valid);
        assert!(validate_input(&schema, &obj(json!({"count": 7}))).valid);
    }

    #[test]
    fn default_applied_even_when_other_fields_invalid() {
        let schema = schema(&[
            ("language", VariableType::String, false, Some(json!("en"))),
            ("count", VariableType::Integer, true, None),
        ]);
        let outcome = validate_input(&schema, &obj(json!({"count": "three"})));
        assert!(!outcome.valid);
        assert_eq!(outcome.data["language"], json!("en"));
    }

    #[test]
    fn null_takes_default() {
        let schema = schema(&[("language", VariableType::String, false, Some(json!("en")))]);
        let outcome = validate_input(&schema, &obj(json!({"language": null})));
        assert!(outcome.valid);
        assert_eq!(outcome.data["language"], json!("en"));
    }

    #[test]
    fn required_missing_emits_one_issue_and_leaves_data_unset() {
        let schema = schema(&[("topic", VariableType::String, true, None)]);
        let outcome = validate_input(&schema, &obj(json!({})));
        assert!(!outcome.valid);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].field, "topic");
        assert!(!outcome.data.contains_key("topic"));
    }

    #[test]
    fn undeclared_fields_are_preserved() {
        let schema = schema(&[("topic", VariableType::String, true, None)]);
        let outcome = validate_input(
            &schema,
            &obj(json!({"topic": "rust", "trace_id": "abc-123"})),
        );
        assert!(outcome.valid);
        assert_eq!(outcome.data["trace_id"], json!("abc-123"));
    }

    #[test]
    fn validation_is_deterministic() {
        let schema = schema(&[
            ("a", VariableType::Number, true, None),
            ("b", VariableType::Boolean, false, Some(json!(true))),
        ]);
        let raw = obj(json!({"a": "oops"}));
        let first = validate_input(&schema, &raw);
        let second = validate_input(&schema, &raw);
        assert_eq!(first.valid, second.valid);
        assert_eq!(first.issues, second.issues);
        assert_eq!(first.data, second.data);
    }
}

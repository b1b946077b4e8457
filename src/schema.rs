#![forbid(unsafe_code)]

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Declarative field schema attached to transformations and validation steps.
///
/// Deliberately small: a list of dotted paths with an expected kind and a
/// required flag. Violations are accumulated so a rejection names every
/// offending field at once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    pub fields: Vec<FieldSpec>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub path: String,
    pub kind: FieldKind,
    pub required: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(FieldKind::String),
            "number" => Some(FieldKind::Number),
            "boolean" => Some(FieldKind::Boolean),
            "object" => Some(FieldKind::Object),
            "array" => Some(FieldKind::Array),
            "any" => Some(FieldKind::Any),
            _ => None,
        }
    }

    fn matches(self, value: &JsonValue) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

/// Whether a schema violation rejects the message or only logs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchemaSeverity {
    Warning,
    #[default]
    Error,
}

impl SchemaSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaSeverity::Warning => "warning",
            SchemaSeverity::Error => "error",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "warning" => Some(SchemaSeverity::Warning),
            "error" => Some(SchemaSeverity::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("schema validation failed ({side}): {}", violations.join("; "))]
pub struct SchemaViolations {
    pub side: &'static str,
    pub violations: Vec<String>,
}

impl Schema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Checks a value against every field spec, returning all violations.
    pub fn validate(&self, side: &'static str, value: &JsonValue) -> Result<(), SchemaViolations> {
        let mut violations = Vec::new();

        for field in &self.fields {
            match resolve_path(value, &field.path) {
                Some(found) => {
                    if !field.kind.matches(found) {
                        violations.push(format!(
                            "field `{}` expected {} but found {}",
                            field.path,
                            field.kind.as_str(),
                            kind_of(found)
                        ));
                    }
                }
                None => {
                    if field.required {
                        violations.push(format!("required field `{}` is missing", field.path));
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaViolations { side, violations })
        }
    }
}

/// Resolves a dotted path (`order.items.0.sku`) inside a JSON value.
pub fn resolve_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(vec![
            FieldSpec {
                path: "order.id".to_string(),
                kind: FieldKind::Number,
                required: true,
            },
            FieldSpec {
                path: "order.priority".to_string(),
                kind: FieldKind::String,
                required: false,
            },
        ])
    }

    #[test]
    fn missing_required_field_is_a_violation() {
        let err = schema()
            .validate("input", &json!({"order": {"priority": "urgent"}}))
            .expect_err("id missing");
        assert_eq!(err.violations.len(), 1);
        assert!(err.violations[0].contains("order.id"));
    }

    #[test]
    fn optional_field_may_be_absent() {
        schema()
            .validate("input", &json!({"order": {"id": 9}}))
            .expect("optional priority can be missing");
    }

    #[test]
    fn wrong_kind_reports_found_kind() {
        let err = schema()
            .validate("output", &json!({"order": {"id": "nine"}}))
            .expect_err("id must be numeric");
        assert!(err.violations[0].contains("expected number but found string"));
    }

    #[test]
    fn array_indices_resolve_in_paths() {
        let value = json!({"items": [{"sku": "a"}, {"sku": "b"}]});
        assert_eq!(resolve_path(&value, "items.1.sku"), Some(&json!("b")));
    }
}

use crate::schema::{FieldKind, FieldSpec, Schema, SchemaSeverity};
use crate::transform::TransformationDefinition;
use humantime::parse_duration;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawTransformation {
    pub(crate) name: String,
    pub(crate) script: String,
    #[serde(default)]
    pub(crate) timeout: Option<String>,
    #[serde(default)]
    pub(crate) input_schema: Option<RawSchema>,
    #[serde(default)]
    pub(crate) output_schema: Option<RawSchema>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawSchema {
    #[serde(default)]
    pub(crate) severity: Option<String>,
    #[serde(default)]
    pub(crate) fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawField {
    pub(crate) path: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) required: bool,
}

pub(crate) fn parse_transformations(
    raw_transformations: Vec<RawTransformation>,
    errors: &mut Vec<String>,
) -> Vec<TransformationDefinition> {
    let mut transformations = Vec::with_capacity(raw_transformations.len());

    for raw in raw_transformations {
        if raw.script.trim().is_empty() {
            errors.push(format!(
                "error[transformations]: transformation `{}` must declare a script",
                raw.name
            ));
        }

        let mut definition = TransformationDefinition::new(raw.name.clone(), raw.script);

        if let Some(timeout) = raw.timeout {
            match parse_duration(&timeout) {
                Ok(timeout) => definition = definition.with_timeout(timeout),
                Err(err) => errors.push(format!(
                    "error[transformations]: transformation `{}` has invalid timeout `{timeout}`: {err}",
                    raw.name
                )),
            }
        }

        if let Some(raw_schema) = raw.input_schema {
            let (schema, severity) = parse_schema(&raw.name, "input_schema", raw_schema, errors);
            definition = definition.with_input_schema(schema, severity);
        }
        if let Some(raw_schema) = raw.output_schema {
            let (schema, severity) = parse_schema(&raw.name, "output_schema", raw_schema, errors);
            definition = definition.with_output_schema(schema, severity);
        }

        transformations.push(definition);
    }

    transformations
}

fn parse_schema(
    transformation: &str,
    side: &str,
    raw: RawSchema,
    errors: &mut Vec<String>,
) -> (Schema, SchemaSeverity) {
    let severity = match raw.severity.as_deref() {
        None => SchemaSeverity::default(),
        Some(value) => match SchemaSeverity::from_raw(value) {
            Some(severity) => severity,
            None => {
                errors.push(format!(
                    "error[transformations]: transformation `{transformation}` {side} has unknown severity `{value}` (expected warning or error)"
                ));
                SchemaSeverity::default()
            }
        },
    };

    let mut fields = Vec::with_capacity(raw.fields.len());
    for field in raw.fields {
        let kind = match FieldKind::from_raw(&field.kind) {
            Some(kind) => kind,
            None => {
                errors.push(format!(
                    "error[transformations]: transformation `{transformation}` {side} field `{}` has unknown type `{}`",
                    field.path, field.kind
                ));
                FieldKind::Any
            }
        };
        fields.push(FieldSpec {
            path: field.path,
            kind,
            required: field.required,
        });
    }

    (Schema::new(fields), severity)
}

mod endpoints;
mod flows;
mod routes;
mod transformations;

use crate::endpoint::EndpointDescriptor;
use crate::flow::FlowDefinition;
use crate::router::RouteDefinition;
use crate::transform::TransformationDefinition;
use serde::de::Error as _;
use serde::Deserialize;
use serde_yaml::{self, Value as YamlValue};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// The full definition set loaded from one YAML file. Acceptance is
/// all-or-nothing: any validation error anywhere rejects the whole file, and
/// every error is reported in one pass.
#[derive(Debug, Clone)]
pub struct DefinitionsConfig {
    pub endpoints: Vec<EndpointDescriptor>,
    pub transformations: Vec<TransformationDefinition>,
    pub routes: Vec<RouteDefinition>,
    pub flows: Vec<FlowDefinition>,
}

const TOP_LEVEL_FIELDS: &str = "endpoints, transformations, routes, flows";

impl DefinitionsConfig {
    pub fn from_reader(mut reader: impl Read) -> Result<Self, DefinitionsConfigError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DefinitionsConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, DefinitionsConfigError> {
        let mut documents = serde_yaml::Deserializer::from_str(contents);
        let mut parsed = None;
        let mut extra_errors = Vec::new();

        for (index, document) in documents.by_ref().enumerate() {
            if index == 0 {
                parsed = Some(RawDefinitionsFile::deserialize(document)?);
            } else {
                let _: YamlValue = YamlValue::deserialize(document)?;
                extra_errors
                    .push("error[root]: multiple YAML documents are not supported".to_string());
                break;
            }
        }

        let Some(raw) = parsed else {
            let err = serde_yaml::Error::custom(
                "definitions config must contain exactly one YAML document",
            );
            return Err(DefinitionsConfigError::Parse(err));
        };

        Self::from_raw(raw, extra_errors).map_err(DefinitionsConfigError::Invalid)
    }

    fn from_raw(
        raw: RawDefinitionsFile,
        mut errors: Vec<String>,
    ) -> Result<Self, DefinitionsValidationError> {
        let RawDefinitionsFile {
            endpoints: raw_endpoints,
            transformations: raw_transformations,
            routes: raw_routes,
            flows: raw_flows,
            extra_fields,
        } = raw;

        if !extra_fields.is_empty() {
            for key in extra_fields.keys() {
                errors.push(format!(
                    "error[root]: unknown top-level key \"{key}\" (expected one of {TOP_LEVEL_FIELDS})"
                ));
            }
        }

        let endpoints = endpoints::parse_endpoints(raw_endpoints, &mut errors);
        let transformations =
            transformations::parse_transformations(raw_transformations, &mut errors);
        let routes = routes::parse_routes(raw_routes, &mut errors);
        let flows = flows::parse_flows(raw_flows, &mut errors);

        validate_unique_names(&endpoints, &transformations, &routes, &flows, &mut errors);
        routes::validate_references(&routes, &endpoints, &mut errors);
        flows::validate_references(&flows, &routes, &transformations, &mut errors);
        flows::validate_graphs(&flows, &mut errors);

        if errors.is_empty() {
            Ok(Self {
                endpoints,
                transformations,
                routes,
                flows,
            })
        } else {
            Err(DefinitionsValidationError::new(errors))
        }
    }
}

fn validate_unique_names(
    endpoints: &[EndpointDescriptor],
    transformations: &[TransformationDefinition],
    routes: &[RouteDefinition],
    flows: &[FlowDefinition],
    errors: &mut Vec<String>,
) {
    fn check<'a>(
        section: &str,
        names: impl Iterator<Item = &'a str>,
        errors: &mut Vec<String>,
    ) {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                errors.push(format!("error[{section}]: duplicate name `{name}`"));
            }
        }
    }

    check(
        "endpoints",
        endpoints.iter().map(|endpoint| endpoint.name.as_str()),
        errors,
    );
    check(
        "transformations",
        transformations
            .iter()
            .map(|transformation| transformation.name.as_str()),
        errors,
    );
    check("routes", routes.iter().map(|route| route.name.as_str()), errors);
    check("flows", flows.iter().map(|flow| flow.name.as_str()), errors);
}

#[derive(Debug, Deserialize)]
struct RawDefinitionsFile {
    #[serde(default)]
    endpoints: Vec<endpoints::RawEndpoint>,
    #[serde(default)]
    transformations: Vec<transformations::RawTransformation>,
    #[serde(default)]
    routes: Vec<routes::RawRoute>,
    #[serde(default)]
    flows: Vec<flows::RawFlow>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Error)]
pub enum DefinitionsConfigError {
    #[error("failed to read definitions config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse definitions config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(DefinitionsValidationError),
}

#[derive(Debug, Error)]
#[error("definitions config validation failed:\n{rendered}")]
pub struct DefinitionsValidationError {
    rendered: String,
}

impl DefinitionsValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self { rendered }
    }
}

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical metadata keys stamped by the gateway and consumed by routes.
pub const TRACE_ID_KEY: &str = "trace_id";
pub const TRIGGER_KEY: &str = "trigger";
pub const ROUTE_KEY: &str = "route";

/// Declared encoding of a message body; selects the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Json,
    Xml,
    Csv,
    Binary,
}

impl PayloadFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadFormat::Json => "json",
            PayloadFormat::Xml => "xml",
            PayloadFormat::Csv => "csv",
            PayloadFormat::Binary => "binary",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "json" => Some(PayloadFormat::Json),
            "xml" => Some(PayloadFormat::Xml),
            "csv" => Some(PayloadFormat::Csv),
            "binary" => Some(PayloadFormat::Binary),
            _ => None,
        }
    }
}

/// Structured record passed between the gateway, routers, and transformers.
///
/// The body stays encoded until something actually needs it; header-based
/// routing reads only `metadata` and never pays for a decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub source: String,
    pub format: PayloadFormat,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn new(source: impl Into<String>, format: PayloadFormat, body: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            format,
            headers: Vec::new(),
            body,
            metadata: BTreeMap::new(),
        }
    }

    pub fn json(source: impl Into<String>, value: &serde_json::Value) -> Self {
        Self::new(
            source,
            PayloadFormat::Json,
            serde_json::to_vec(value).unwrap_or_default(),
        )
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|value| value.as_str())
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.metadata_value(TRACE_ID_KEY)
    }

    pub fn trigger(&self) -> Option<&str> {
        self.metadata_value(TRIGGER_KEY)
    }

    pub fn with_trace_id(mut self, value: impl Into<String>) -> Self {
        self.metadata.insert(TRACE_ID_KEY.to_string(), value.into());
        self
    }

    pub fn with_trigger(mut self, value: impl Into<String>) -> Self {
        self.metadata.insert(TRIGGER_KEY.to_string(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Decodes the body into JSON using the declared format codec.
    pub fn body_json(&self) -> Result<serde_json::Value, crate::codec::CodecError> {
        crate::codec::decode(self.format, &self.body)
    }
}

/// Health of a registered endpoint as last reported by a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Rest,
    Soap,
    Queue,
    Stream,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Rest => "rest",
            EndpointKind::Soap => "soap",
            EndpointKind::Queue => "queue",
            EndpointKind::Stream => "stream",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "rest" => Some(EndpointKind::Rest),
            "soap" => Some(EndpointKind::Soap),
            "queue" => Some(EndpointKind::Queue),
            "stream" => Some(EndpointKind::Stream),
            _ => None,
        }
    }
}

#![forbid(unsafe_code)]

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};

use super::CodecError;

/// Represents an encoded payload plus metadata such as codec/content-type.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedPayload {
    pub codec: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    pub metadata: JsonMap<String, JsonValue>,
}

impl EncodedPayload {
    pub fn new(codec: impl Into<String>, content_type: Option<String>, data: Vec<u8>) -> Self {
        Self {
            codec: codec.into(),
            content_type,
            data,
            metadata: JsonMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serialises the payload into the JSON envelope used for binary bodies.
    pub fn to_json(&self) -> JsonValue {
        let mut object = self.metadata.clone();
        object.insert("codec".to_string(), JsonValue::String(self.codec.clone()));
        if let Some(ct) = &self.content_type {
            object.insert("content_type".to_string(), JsonValue::String(ct.clone()));
        }
        object.insert(
            "binary".to_string(),
            JsonValue::String(BASE64_ENGINE.encode(&self.data)),
        );
        object.insert(
            "length".to_string(),
            JsonValue::Number(JsonNumber::from(self.data.len() as u64)),
        );
        JsonValue::Object(object)
    }

    /// Attempts to interpret a JSON value as an encoded payload envelope.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let map = value.as_object()?;
        let codec = map.get("codec")?.as_str()?.to_string();
        let binary = map.get("binary")?.as_str()?.to_string();
        let content_type = map
            .get("content_type")
            .and_then(JsonValue::as_str)
            .map(|s| s.to_string());
        let data = BASE64_ENGINE.decode(binary).ok()?;

        let mut metadata = map.clone();
        metadata.remove("codec");
        metadata.remove("binary");
        metadata.remove("length");
        metadata.remove("content_type");

        Some(Self {
            codec,
            content_type,
            data,
            metadata,
        })
    }
}

/// Envelope for opaque binary bodies so conditions and scripts can still
/// observe length/content without forcing an interpretation of the bytes.
pub fn binary_envelope(data: &[u8]) -> JsonValue {
    EncodedPayload::new("binary", None, data.to_vec()).to_json()
}

pub fn binary_from_envelope(value: &JsonValue) -> Result<Vec<u8>, CodecError> {
    EncodedPayload::from_json(value)
        .map(EncodedPayload::into_data)
        .ok_or_else(|| CodecError::Encode {
            format: "binary",
            reason: "expected an envelope with `codec` and base64 `binary` fields".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_envelope_round_trips() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        let envelope = binary_envelope(&bytes);
        assert_eq!(envelope["length"], 5);
        assert_eq!(binary_from_envelope(&envelope).expect("decode"), bytes);
    }

    #[test]
    fn envelope_without_binary_field_is_rejected() {
        let err = binary_from_envelope(&serde_json::json!({"codec": "binary"}))
            .expect_err("missing binary field");
        assert!(matches!(err, CodecError::Encode { .. }));
    }
}

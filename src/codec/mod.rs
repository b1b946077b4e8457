#![forbid(unsafe_code)]

mod csv;
pub mod payload;
mod xml;

use crate::domain::PayloadFormat;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use payload::EncodedPayload;

/// Decodes an encoded body into the canonical JSON shape for the declared format.
pub fn decode(format: PayloadFormat, data: &[u8]) -> Result<JsonValue, CodecError> {
    match format {
        PayloadFormat::Json => {
            serde_json::from_slice(data).map_err(|err| CodecError::Decode {
                format: format.as_str(),
                reason: err.to_string(),
            })
        }
        PayloadFormat::Xml => xml::decode(data),
        PayloadFormat::Csv => csv::decode(data),
        PayloadFormat::Binary => Ok(payload::binary_envelope(data)),
    }
}

/// Encodes a JSON value into the byte representation for the target format.
pub fn encode(format: PayloadFormat, value: &JsonValue) -> Result<Vec<u8>, CodecError> {
    match format {
        PayloadFormat::Json => serde_json::to_vec(value).map_err(|err| CodecError::Encode {
            format: format.as_str(),
            reason: err.to_string(),
        }),
        PayloadFormat::Xml => xml::encode(value),
        PayloadFormat::Csv => csv::encode(value),
        PayloadFormat::Binary => payload::binary_from_envelope(value),
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode {format} payload: {reason}")]
    Decode { format: &'static str, reason: String },
    #[error("failed to encode {format} payload: {reason}")]
    Encode { format: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_preserves_structure() {
        let value = json!({"order": {"id": 7, "priority": "urgent"}});
        let bytes = encode(PayloadFormat::Json, &value).expect("encode");
        assert_eq!(decode(PayloadFormat::Json, &bytes).expect("decode"), value);
    }

    #[test]
    fn invalid_json_reports_decode_error() {
        let err = decode(PayloadFormat::Json, b"{not json").expect_err("should fail");
        assert!(matches!(err, CodecError::Decode { format: "json", .. }));
    }
}

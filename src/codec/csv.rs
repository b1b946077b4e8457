#![forbid(unsafe_code)]

use serde_json::{Map as JsonMap, Value as JsonValue};

use super::CodecError;

/// Decodes CSV with a header row into an array of flat JSON objects.
/// All cell values stay strings; numeric interpretation is left to
/// transformation scripts so the decode is lossless.
pub fn decode(data: &[u8]) -> Result<JsonValue, CodecError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(data);

    let headers = reader
        .headers()
        .map_err(|err| decode_error(err.to_string()))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| decode_error(err.to_string()))?;
        let mut object = JsonMap::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            object.insert(header.to_string(), JsonValue::String(field.to_string()));
        }
        rows.push(JsonValue::Object(object));
    }

    Ok(JsonValue::Array(rows))
}

/// Encodes an array of flat objects (or a single object) as CSV. The header
/// row follows the key order of the first object.
pub fn encode(value: &JsonValue) -> Result<Vec<u8>, CodecError> {
    let rows: Vec<&JsonMap<String, JsonValue>> = match value {
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object()
                    .ok_or_else(|| encode_error("rows must be objects".to_string()))
            })
            .collect::<Result<_, _>>()?,
        JsonValue::Object(map) => vec![map],
        _ => {
            return Err(encode_error(
                "expected an object or an array of objects".to_string(),
            ))
        }
    };

    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let headers: Vec<&String> = first.keys().collect();

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record(headers.iter().map(|header| header.as_str()))
        .map_err(|err| encode_error(err.to_string()))?;

    for row in &rows {
        let record: Vec<String> = headers
            .iter()
            .map(|header| match row.get(header.as_str()) {
                Some(JsonValue::String(text)) => text.clone(),
                Some(JsonValue::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect();
        writer
            .write_record(&record)
            .map_err(|err| encode_error(err.to_string()))?;
    }

    writer
        .into_inner()
        .map_err(|err| encode_error(err.to_string()))
}

fn decode_error(reason: String) -> CodecError {
    CodecError::Decode {
        format: "csv",
        reason,
    }
}

fn encode_error(reason: String) -> CodecError {
    CodecError::Encode {
        format: "csv",
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_row_keys_each_object() {
        let value = decode(b"id,priority\n7,urgent\n8,normal\n").expect("decode");
        assert_eq!(
            value,
            json!([
                {"id": "7", "priority": "urgent"},
                {"id": "8", "priority": "normal"},
            ])
        );
    }

    #[test]
    fn encode_rejects_scalar_payloads() {
        let err = encode(&json!("not tabular")).expect_err("scalars are not csv");
        assert!(matches!(err, CodecError::Encode { format: "csv", .. }));
    }
}

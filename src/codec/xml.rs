#![forbid(unsafe_code)]

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::io::Cursor;

use super::CodecError;

const ROOT_ELEMENT: &str = "message";

/// Decodes an XML document into a JSON object. Elements become object keys,
/// attributes are prefixed with `@`, text lands under `#text`, and repeated
/// sibling elements collapse into arrays.
pub fn decode(data: &[u8]) -> Result<JsonValue, CodecError> {
    let text = std::str::from_utf8(data).map_err(|err| decode_error(err.to_string()))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<(String, JsonMap<String, JsonValue>)> = Vec::new();
    let mut root: Option<JsonValue> = None;

    loop {
        match reader.read_event().map_err(|err| decode_error(err.to_string()))? {
            Event::Start(start) => {
                let (name, object) = element_frame(&start)?;
                stack.push((name, object));
            }
            Event::Empty(start) => {
                let (name, object) = element_frame(&start)?;
                attach_child(&mut stack, &mut root, name, JsonValue::Object(object));
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|err| decode_error(err.to_string()))?
                    .into_owned();
                if let Some((_, object)) = stack.last_mut() {
                    object.insert("#text".to_string(), JsonValue::String(value));
                }
            }
            Event::End(_) => {
                let (name, object) = stack
                    .pop()
                    .ok_or_else(|| decode_error("unbalanced closing tag".to_string()))?;
                let value = collapse_element(object);
                attach_child(&mut stack, &mut root, name, value);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(decode_error("document ended inside an open element".to_string()));
    }

    root.ok_or_else(|| decode_error("document contains no root element".to_string()))
}

/// Encodes a JSON value as XML under a `<message>` root.
pub fn encode(value: &JsonValue) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_element(&mut writer, ROOT_ELEMENT, value)?;
    Ok(writer.into_inner().into_inner())
}

fn element_frame(start: &BytesStart<'_>) -> Result<(String, JsonMap<String, JsonValue>), CodecError> {
    let name = String::from_utf8(start.name().as_ref().to_vec())
        .map_err(|err| decode_error(err.to_string()))?;

    let mut object = JsonMap::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| decode_error(err.to_string()))?;
        let key = String::from_utf8(attribute.key.as_ref().to_vec())
            .map_err(|err| decode_error(err.to_string()))?;
        let value = attribute
            .unescape_value()
            .map_err(|err| decode_error(err.to_string()))?
            .into_owned();
        object.insert(format!("@{key}"), JsonValue::String(value));
    }

    Ok((name, object))
}

fn collapse_element(object: JsonMap<String, JsonValue>) -> JsonValue {
    // An element with only text content becomes a plain string.
    if object.len() == 1 {
        if let Some(JsonValue::String(text)) = object.get("#text") {
            return JsonValue::String(text.clone());
        }
    }
    JsonValue::Object(object)
}

fn attach_child(
    stack: &mut [(String, JsonMap<String, JsonValue>)],
    root: &mut Option<JsonValue>,
    name: String,
    value: JsonValue,
) {
    let Some((_, parent)) = stack.last_mut() else {
        let mut wrapper = JsonMap::new();
        wrapper.insert(name, value);
        *root = Some(JsonValue::Object(wrapper));
        return;
    };

    match parent.remove(&name) {
        Some(JsonValue::Array(mut items)) => {
            items.push(value);
            parent.insert(name, JsonValue::Array(items));
        }
        Some(existing) => {
            parent.insert(name, JsonValue::Array(vec![existing, value]));
        }
        None => {
            parent.insert(name, value);
        }
    }
}

fn write_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    value: &JsonValue,
) -> Result<(), CodecError> {
    match value {
        JsonValue::Object(map) => {
            writer
                .write_event(Event::Start(BytesStart::new(name)))
                .map_err(|err| encode_error(err.to_string()))?;
            for (key, child) in map {
                if key.starts_with('#') {
                    write_text(writer, child)?;
                } else if !key.starts_with('@') {
                    write_element(writer, key, child)?;
                }
            }
            writer
                .write_event(Event::End(BytesEnd::new(name)))
                .map_err(|err| encode_error(err.to_string()))?;
        }
        JsonValue::Array(items) => {
            for item in items {
                write_element(writer, name, item)?;
            }
        }
        other => {
            writer
                .write_event(Event::Start(BytesStart::new(name)))
                .map_err(|err| encode_error(err.to_string()))?;
            write_text(writer, other)?;
            writer
                .write_event(Event::End(BytesEnd::new(name)))
                .map_err(|err| encode_error(err.to_string()))?;
        }
    }
    Ok(())
}

fn write_text(writer: &mut Writer<Cursor<Vec<u8>>>, value: &JsonValue) -> Result<(), CodecError> {
    let text = match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    };
    writer
        .write_event(Event::Text(BytesText::new(&text)))
        .map_err(|err| encode_error(err.to_string()))
}

fn decode_error(reason: String) -> CodecError {
    CodecError::Decode {
        format: "xml",
        reason,
    }
}

fn encode_error(reason: String) -> CodecError {
    CodecError::Encode {
        format: "xml",
        reason,
    }
}

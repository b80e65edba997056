//! Content negotiation and the JSON/XML codec.

use crate::xml;
use emberfhir_core::{CoreError, Resource, Result, WireCodec, WireFormat};
use emberfhir_search::SummaryMode;
use serde_json::{Map, Value};

/// Pick the response format: `_format` wins over `Accept`, and a missing
/// or wildcard `Accept` falls back to JSON.
pub fn negotiate(accept: Option<&str>, format_param: Option<&str>) -> Option<WireFormat> {
    if let Some(param) = format_param {
        return WireFormat::from_mime(param);
    }
    match accept {
        None => Some(WireFormat::Json),
        Some(accept) => {
            for candidate in accept.split(',') {
                let candidate = candidate.trim();
                if candidate.starts_with("*/*") || candidate.starts_with("application/*") {
                    return Some(WireFormat::Json);
                }
                if let Some(format) = WireFormat::from_mime(candidate) {
                    return Some(format);
                }
            }
            None
        }
    }
}

/// Request body format from `Content-Type`; an absent header defaults to
/// JSON.
pub fn body_format(content_type: Option<&str>) -> Option<WireFormat> {
    match content_type {
        None => Some(WireFormat::Json),
        Some(mime) => WireFormat::from_mime(mime),
    }
}

/// The server codec: JSON via serde, XML via the generic element mapping.
#[derive(Debug, Default)]
pub struct ServerCodec;

impl WireCodec for ServerCodec {
    fn parse(&self, format: WireFormat, bytes: &[u8]) -> Result<Resource> {
        match format {
            WireFormat::Json => {
                let value = serde_json::from_slice(bytes)?;
                Resource::new(value)
            }
            WireFormat::Xml => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| CoreError::invalid_resource(format!("XML body is not UTF-8: {e}")))?;
                Resource::new(xml::from_xml(text)?)
            }
        }
    }

    fn serialize(&self, format: WireFormat, resource: &Resource, pretty: bool) -> Result<String> {
        match format {
            WireFormat::Json => {
                let out = if pretty {
                    serde_json::to_string_pretty(resource.as_json())?
                } else {
                    serde_json::to_string(resource.as_json())?
                };
                Ok(out)
            }
            WireFormat::Xml => xml::to_xml(resource.as_json(), pretty),
        }
    }
}

/// Elements always kept by the `_summary` / `_elements` filters.
const MANDATORY_ELEMENTS: &[&str] = &["resourceType", "id", "meta"];

/// Apply the `_summary` serialization filter.
///
/// `text` keeps only the narrative and mandatory elements; `data` and
/// `true` drop the narrative. `count` is resolved earlier, at search time.
pub fn apply_summary(value: &Value, mode: SummaryMode) -> Value {
    match mode {
        SummaryMode::False | SummaryMode::Count => value.clone(),
        SummaryMode::Text => {
            let Some(map) = value.as_object() else {
                return value.clone();
            };
            let mut out = Map::new();
            for key in MANDATORY_ELEMENTS.iter().chain(["text"].iter()) {
                if let Some(v) = map.get(*key) {
                    out.insert((*key).to_string(), v.clone());
                }
            }
            Value::Object(out)
        }
        SummaryMode::True | SummaryMode::Data => {
            let Some(map) = value.as_object() else {
                return value.clone();
            };
            let mut out = map.clone();
            out.remove("text");
            Value::Object(out)
        }
    }
}

/// Apply the `_elements` filter: keep the listed top-level elements plus
/// the mandatory ones.
pub fn apply_elements(value: &Value, elements: &[String]) -> Value {
    if elements.is_empty() {
        return value.clone();
    }
    let Some(map) = value.as_object() else {
        return value.clone();
    };
    let mut out = Map::new();
    for (key, v) in map {
        if MANDATORY_ELEMENTS.contains(&key.as_str()) || elements.iter().any(|e| e == key) {
            out.insert(key.clone(), v.clone());
        }
    }
    Value::Object(out)
}

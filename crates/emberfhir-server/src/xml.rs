//! Generic XML wire form.
//!
//! The JSON tree maps structurally: one element per member, a `value`
//! attribute for primitives, repeated elements for arrays. This is enough
//! to round-trip the server's own output and to accept structurally
//! equivalent documents; it does not model the full specification XML
//! grammar.

use emberfhir_core::{CoreError, Result};
use serde_json::{Map, Value};

pub const FHIR_XML_NAMESPACE: &str = "http://hl7.org/fhir";

/// Serialize a resource tree to XML. The `resourceType` becomes the root
/// element name.
pub fn to_xml(value: &Value, pretty: bool) -> Result<String> {
    let Some(root_name) = value.get("resourceType").and_then(Value::as_str) else {
        return Err(CoreError::invalid_resource(
            "cannot serialize a tree without resourceType to XML",
        ));
    };
    let mut out = String::new();
    let Some(map) = value.as_object() else {
        return Err(CoreError::invalid_resource("resource tree is not an object"));
    };

    out.push('<');
    out.push_str(root_name);
    out.push_str(" xmlns=\"");
    out.push_str(FHIR_XML_NAMESPACE);
    out.push_str("\">");
    if pretty {
        out.push('\n');
    }
    for (key, item) in map {
        if key == "resourceType" {
            continue;
        }
        write_member(&mut out, key, item, pretty, 1);
    }
    out.push_str("</");
    out.push_str(root_name);
    out.push('>');
    Ok(out)
}

fn indent(out: &mut String, pretty: bool, depth: usize) {
    if pretty {
        for _ in 0..depth {
            out.push_str("  ");
        }
    }
}

fn write_member(out: &mut String, name: &str, value: &Value, pretty: bool, depth: usize) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                write_member(out, name, item, pretty, depth);
            }
        }
        Value::Object(map) => {
            indent(out, pretty, depth);
            out.push('<');
            out.push_str(name);
            out.push('>');
            if pretty {
                out.push('\n');
            }
            for (key, item) in map {
                write_member(out, key, item, pretty, depth + 1);
            }
            indent(out, pretty, depth);
            out.push_str("</");
            out.push_str(name);
            out.push('>');
            if pretty {
                out.push('\n');
            }
        }
        primitive => {
            indent(out, pretty, depth);
            out.push('<');
            out.push_str(name);
            out.push_str(" value=\"");
            let text = match primitive {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&escape(&text));
            out.push_str("\"/>");
            if pretty {
                out.push('\n');
            }
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

/// Parse an XML document into the equivalent JSON tree. Primitive values
/// stay strings except the boolean literals; the root element name becomes
/// `resourceType`.
pub fn from_xml(input: &str) -> Result<Value> {
    let mut parser = XmlParser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    parser.skip_prolog();
    let (name, value) = parser.parse_element()?;
    let mut map = match value {
        Value::Object(map) => map,
        primitive => {
            let mut map = Map::new();
            map.insert("value".into(), primitive);
            map
        }
    };
    map.insert("resourceType".into(), Value::String(name));
    // Keep resourceType first like the JSON form usually has it; key order
    // is irrelevant to equality.
    Ok(Value::Object(map))
}

struct XmlParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> XmlParser<'a> {
    fn error(&self, message: &str) -> CoreError {
        CoreError::invalid_resource(format!("XML parse error at byte {}: {message}", self.pos))
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn skip_prolog(&mut self) {
        loop {
            self.skip_whitespace();
            if self.starts_with("<?") {
                self.advance_past("?>");
            } else if self.starts_with("<!--") {
                self.advance_past("-->");
            } else {
                break;
            }
        }
    }

    fn starts_with(&self, needle: &str) -> bool {
        self.bytes[self.pos..].starts_with(needle.as_bytes())
    }

    fn advance_past(&mut self, needle: &str) {
        let haystack = &self.bytes[self.pos..];
        match haystack
            .windows(needle.len())
            .position(|w| w == needle.as_bytes())
        {
            Some(offset) => self.pos += offset + needle.len(),
            None => self.pos = self.bytes.len(),
        }
    }

    fn read_name(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric()
                || self.bytes[self.pos] == b'_'
                || self.bytes[self.pos] == b'-')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a name"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    /// Parse one element; returns its name and the JSON value it denotes.
    fn parse_element(&mut self) -> Result<(String, Value)> {
        self.skip_whitespace();
        if !self.starts_with("<") {
            return Err(self.error("expected an element"));
        }
        self.pos += 1;
        let name = self.read_name()?;

        let mut value_attr: Option<String> = None;
        loop {
            self.skip_whitespace();
            if self.starts_with("/>") {
                self.pos += 2;
                return Ok((name, primitive_from_attr(value_attr)));
            }
            if self.starts_with(">") {
                self.pos += 1;
                break;
            }
            let attr_name = self.read_name()?;
            self.skip_whitespace();
            if !self.starts_with("=") {
                return Err(self.error("expected '=' in attribute"));
            }
            self.pos += 1;
            self.skip_whitespace();
            if !self.starts_with("\"") {
                return Err(self.error("expected a quoted attribute value"));
            }
            self.pos += 1;
            let start = self.pos;
            while self.pos < self.bytes.len() && self.bytes[self.pos] != b'"' {
                self.pos += 1;
            }
            if self.pos == self.bytes.len() {
                return Err(self.error("unterminated attribute value"));
            }
            let raw = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
            self.pos += 1;
            if attr_name == "value" {
                value_attr = Some(unescape(&raw));
            }
            // Other attributes (xmlns and friends) are dropped.
        }

        // Children until the matching close tag.
        let mut children: Map<String, Value> = Map::new();
        loop {
            self.skip_whitespace();
            if self.starts_with("<!--") {
                self.advance_past("-->");
                continue;
            }
            if self.starts_with("</") {
                self.pos += 2;
                let close = self.read_name()?;
                if close != name {
                    return Err(self.error("mismatched close tag"));
                }
                self.skip_whitespace();
                if !self.starts_with(">") {
                    return Err(self.error("malformed close tag"));
                }
                self.pos += 1;
                break;
            }
            if self.starts_with("<") {
                let (child_name, child_value) = self.parse_element()?;
                append_child(&mut children, child_name, child_value);
                continue;
            }
            // Text content outside the generic mapping is skipped.
            while self.pos < self.bytes.len() && self.bytes[self.pos] != b'<' {
                self.pos += 1;
            }
            if self.pos == self.bytes.len() {
                return Err(self.error("unterminated element"));
            }
        }

        if children.is_empty() {
            Ok((name, primitive_from_attr(value_attr)))
        } else {
            Ok((name, Value::Object(children)))
        }
    }
}

fn primitive_from_attr(value: Option<String>) -> Value {
    match value {
        Some(text) => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        None => Value::Object(Map::new()),
    }
}

fn append_child(children: &mut Map<String, Value>, name: String, value: Value) {
    match children.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            children.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_primitives_arrays_and_objects() {
        let value = json!({
            "resourceType": "Patient",
            "id": "p1",
            "active": true,
            "name": [
                {"family": "Smith", "given": ["Anna", "Maria"]}
            ]
        });
        let xml = to_xml(&value, false).unwrap();
        assert!(xml.starts_with("<Patient xmlns=\"http://hl7.org/fhir\">"));
        assert!(xml.contains("<id value=\"p1\"/>"));
        assert!(xml.contains("<active value=\"true\"/>"));
        assert!(xml.contains("<given value=\"Anna\"/><given value=\"Maria\"/>"));
        assert!(xml.ends_with("</Patient>"));
    }

    #[test]
    fn escaping_round_trips() {
        let value = json!({
            "resourceType": "Basic",
            "id": "b<1>",
            "note": "a & b \"quoted\""
        });
        let xml = to_xml(&value, false).unwrap();
        let parsed = from_xml(&xml).unwrap();
        assert_eq!(parsed["id"], "b<1>");
        assert_eq!(parsed["note"], "a & b \"quoted\"");
    }

    #[test]
    fn parse_then_serialize_is_stable() {
        let xml = "<Patient xmlns=\"http://hl7.org/fhir\"><id value=\"p1\"/><active value=\"true\"/><name><family value=\"Smith\"/></name></Patient>";
        let parsed = from_xml(xml).unwrap();
        assert_eq!(parsed["resourceType"], "Patient");
        assert_eq!(parsed["id"], "p1");
        assert_eq!(parsed["active"], true);
        assert_eq!(parsed["name"]["family"], "Smith");

        // Element order may differ from the input, but a second round trip
        // is a fixed point.
        let out = to_xml(&parsed, false).unwrap();
        assert_eq!(from_xml(&out).unwrap(), parsed);
    }

    #[test]
    fn repeated_elements_form_arrays() {
        let xml = "<Patient xmlns=\"http://hl7.org/fhir\"><given value=\"a\"/><given value=\"b\"/></Patient>";
        let parsed = from_xml(xml).unwrap();
        assert_eq!(parsed["given"], json!(["a", "b"]));
    }

    #[test]
    fn prolog_and_comments_are_skipped() {
        let xml = "<?xml version=\"1.0\"?><!-- hi --><Patient><id value=\"p1\"/></Patient>";
        let parsed = from_xml(xml).unwrap();
        assert_eq!(parsed["id"], "p1");
    }

    #[test]
    fn mismatched_tags_fail() {
        assert!(from_xml("<Patient><id value=\"x\"/></Observation>").is_err());
        assert!(from_xml("not xml at all").is_err());
    }

    #[test]
    fn root_without_resource_type_cannot_serialize() {
        assert!(to_xml(&json!({"id": "x"}), false).is_err());
    }
}

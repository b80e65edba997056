use serde_json::Value;

/// A parsed resource reference.
///
/// References arrive as relative (`Patient/p1`), absolute
/// (`http://host/base/Patient/p1` with an optional `_history` suffix) or
/// logical (an identifier with no resolvable target). Only the first two
/// produce a `local_key` the stores can resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    pub resource_type: Option<String>,
    pub id: Option<String>,
    pub raw: String,
}

fn looks_like_type(segment: &str) -> bool {
    segment
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
        && segment.chars().all(|c| c.is_ascii_alphanumeric())
}

impl ResourceReference {
    /// Parse a reference literal. Returns `None` for empty input.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        // Strip any _history suffix before splitting.
        let without_history = match raw.split_once("/_history/") {
            Some((head, _)) => head,
            None => raw,
        };

        let segments: Vec<&str> = without_history
            .trim_end_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        // The last Type/id pair wins, which covers both relative and
        // absolute forms without caring about the base URL in between.
        if segments.len() >= 2 {
            let id = segments[segments.len() - 1];
            let type_name = segments[segments.len() - 2];
            if looks_like_type(type_name) {
                return Some(Self {
                    resource_type: Some(type_name.to_string()),
                    id: Some(id.to_string()),
                    raw: raw.to_string(),
                });
            }
        }

        // Logical or urn reference: keep the raw text, nothing resolvable.
        Some(Self {
            resource_type: None,
            id: None,
            raw: raw.to_string(),
        })
    }

    /// Extract a reference from a tree element: either a string literal or
    /// an object with a `reference` member.
    pub fn from_element(element: &Value) -> Option<Self> {
        match element {
            Value::String(s) => Self::parse(s),
            Value::Object(map) => map
                .get("reference")
                .and_then(Value::as_str)
                .and_then(Self::parse),
            _ => None,
        }
    }

    /// `Type/id` when both parts are known.
    pub fn local_key(&self) -> Option<String> {
        match (&self.resource_type, &self.id) {
            (Some(t), Some(id)) => Some(format!("{t}/{id}")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_relative() {
        let r = ResourceReference::parse("Patient/p1").unwrap();
        assert_eq!(r.resource_type.as_deref(), Some("Patient"));
        assert_eq!(r.id.as_deref(), Some("p1"));
        assert_eq!(r.local_key().unwrap(), "Patient/p1");
    }

    #[test]
    fn parses_absolute_with_history() {
        let r =
            ResourceReference::parse("http://example.org/fhir/Patient/p1/_history/3").unwrap();
        assert_eq!(r.local_key().unwrap(), "Patient/p1");
    }

    #[test]
    fn logical_reference_has_no_key() {
        let r = ResourceReference::parse("urn:uuid:0c0a6f9e").unwrap();
        assert!(r.local_key().is_none());
        assert_eq!(r.raw, "urn:uuid:0c0a6f9e");
    }

    #[test]
    fn from_element_accepts_both_shapes() {
        let obj = json!({"reference": "Observation/o1"});
        assert_eq!(
            ResourceReference::from_element(&obj).unwrap().local_key(),
            Some("Observation/o1".to_string())
        );
        let s = json!("Encounter/e1");
        assert_eq!(
            ResourceReference::from_element(&s).unwrap().local_key(),
            Some("Encounter/e1".to_string())
        );
        assert!(ResourceReference::from_element(&json!(42)).is_none());
    }

    #[test]
    fn empty_is_none() {
        assert!(ResourceReference::parse("").is_none());
        assert!(ResourceReference::parse("   ").is_none());
    }
}

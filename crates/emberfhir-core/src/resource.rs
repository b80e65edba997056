use crate::error::{CoreError, Result};
use crate::time::FhirInstant;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// An opaque resource tree.
///
/// The server never models individual resource types; everything is a JSON
/// tree with a `resourceType` tag, a client-visible `id` and server-owned
/// `meta`. Field access is duck-typed against the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Value);

impl Resource {
    /// Wrap a parsed tree. The value must be an object carrying a string
    /// `resourceType`.
    pub fn new(value: Value) -> Result<Self> {
        match value.get("resourceType").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => Ok(Self(value)),
            _ => Err(CoreError::invalid_resource(
                "resource is missing a resourceType",
            )),
        }
    }

    /// Build a minimal resource from its identity parts. Used by tests and
    /// synthetic outcome entries.
    pub fn from_parts(type_name: &str, id: &str) -> Self {
        let mut map = Map::new();
        map.insert("resourceType".into(), Value::String(type_name.into()));
        map.insert("id".into(), Value::String(id.into()));
        Self(Value::Object(map))
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    pub fn into_json(self) -> Value {
        self.0
    }

    pub fn type_name(&self) -> &str {
        self.0
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: &str) {
        if let Value::Object(map) = &mut self.0 {
            map.insert("id".into(), Value::String(id.into()));
        }
    }

    /// Fully-qualified identity, `Type/id`. Falls back to an empty id part
    /// when none is assigned yet.
    pub fn key(&self) -> String {
        format!("{}/{}", self.type_name(), self.id().unwrap_or_default())
    }

    /// Two resources denote the same record iff type and id agree.
    pub fn same_identity(&self, other: &Resource) -> bool {
        self.type_name() == other.type_name() && self.id() == other.id()
    }

    pub fn version_id(&self) -> Option<&str> {
        self.0
            .get("meta")
            .and_then(|m| m.get("versionId"))
            .and_then(Value::as_str)
    }

    pub fn last_updated(&self) -> Option<FhirInstant> {
        self.0
            .get("meta")
            .and_then(|m| m.get("lastUpdated"))
            .and_then(Value::as_str)
            .and_then(|s| FhirInstant::from_str(s).ok())
    }

    /// Stamp `meta.versionId` and `meta.lastUpdated` in one step, creating
    /// `meta` when absent.
    pub fn stamp_meta(&mut self, version_id: &str, instant: &FhirInstant) {
        let Value::Object(map) = &mut self.0 else {
            return;
        };
        let meta = map
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = meta {
            meta.insert("versionId".into(), Value::String(version_id.into()));
            meta.insert("lastUpdated".into(), Value::String(instant.to_string()));
        }
    }

    /// Canonical URL for resources that carry a top-level `url` field.
    pub fn canonical_url(&self) -> Option<&str> {
        self.0.get("url").and_then(Value::as_str)
    }

    /// `system|value` keys for every entry of a top-level `identifier`
    /// array (or single identifier object). Entries without a value are
    /// skipped; a missing system yields a bare `|value` key.
    pub fn identifier_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let Some(identifier) = self.0.get("identifier") else {
            return keys;
        };
        let entries: Vec<&Value> = match identifier {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for entry in entries {
            let Some(value) = entry.get("value").and_then(Value::as_str) else {
                continue;
            };
            let system = entry.get("system").and_then(Value::as_str).unwrap_or("");
            keys.push(format!("{system}|{value}"));
        }
        keys
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn set_field(&mut self, name: &str, value: Value) {
        if let Value::Object(map) = &mut self.0 {
            map.insert(name.into(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_requires_resource_type() {
        assert!(Resource::new(json!({"resourceType": "Patient"})).is_ok());
        assert!(Resource::new(json!({"id": "p1"})).is_err());
        assert!(Resource::new(json!("nope")).is_err());
    }

    #[test]
    fn identity_and_key() {
        let a = Resource::new(json!({"resourceType": "Patient", "id": "p1"})).unwrap();
        let b = Resource::from_parts("Patient", "p1");
        let c = Resource::from_parts("Patient", "p2");
        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&c));
        assert_eq!(a.key(), "Patient/p1");
    }

    #[test]
    fn stamp_meta_creates_and_overwrites() {
        let mut r = Resource::from_parts("Patient", "p1");
        assert!(r.version_id().is_none());

        let instant = "2024-05-15T14:30:00Z".parse().unwrap();
        r.stamp_meta("1", &instant);
        assert_eq!(r.version_id(), Some("1"));
        assert_eq!(r.last_updated(), Some(instant));

        let later = "2024-05-15T14:31:00Z".parse().unwrap();
        r.stamp_meta("2", &later);
        assert_eq!(r.version_id(), Some("2"));
        assert_eq!(r.last_updated(), Some(later));
    }

    #[test]
    fn canonical_url_duck_typing() {
        let vs = Resource::new(json!({
            "resourceType": "ValueSet",
            "url": "http://example.org/vs/colors"
        }))
        .unwrap();
        assert_eq!(vs.canonical_url(), Some("http://example.org/vs/colors"));
        assert_eq!(Resource::from_parts("Patient", "p1").canonical_url(), None);
    }

    #[test]
    fn identifier_keys_cover_shapes() {
        let r = Resource::new(json!({
            "resourceType": "Patient",
            "id": "p1",
            "identifier": [
                {"system": "http://sys", "value": "MRN-1"},
                {"value": "bare"},
                {"system": "http://sys"}
            ]
        }))
        .unwrap();
        assert_eq!(r.identifier_keys(), vec!["http://sys|MRN-1", "|bare"]);

        let single = Resource::new(json!({
            "resourceType": "Patient",
            "identifier": {"system": "s", "value": "v"}
        }))
        .unwrap();
        assert_eq!(single.identifier_keys(), vec!["s|v"]);
    }

    #[test]
    fn serde_is_transparent() {
        let raw = json!({"resourceType": "Patient", "id": "p1", "active": true});
        let r: Resource = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&r).unwrap(), raw);
    }
}

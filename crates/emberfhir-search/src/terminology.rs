use dashmap::DashMap;
use emberfhir_core::{Resource, TerminologyService};
use serde_json::Value;
use std::collections::HashSet;

/// In-memory value-set membership index.
///
/// Registered from ValueSet resources: codes come from
/// `expansion.contains[]` when present, otherwise from
/// `compose.include[].concept[]`. Membership keys are `system|code` plus a
/// bare `|code` fallback so searches without a system still hit.
#[derive(Debug, Default)]
pub struct ValueSetIndex {
    sets: DashMap<String, HashSet<String>>,
}

impl ValueSetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a ValueSet resource. Returns the canonical URL it was
    /// registered under.
    pub fn register(&self, resource: &Resource) -> Option<String> {
        let url = resource.canonical_url()?.to_string();
        let mut codes = HashSet::new();

        let json = resource.as_json();
        if let Some(contains) = json
            .pointer("/expansion/contains")
            .and_then(Value::as_array)
        {
            collect_codes(contains, None, &mut codes);
        } else if let Some(includes) = json.pointer("/compose/include").and_then(Value::as_array) {
            for include in includes {
                let system = include.get("system").and_then(Value::as_str);
                if let Some(concepts) = include.get("concept").and_then(Value::as_array) {
                    collect_codes(concepts, system, &mut codes);
                }
            }
        }

        tracing::debug!(url = %url, codes = codes.len(), "indexed value set");
        self.sets.insert(url.clone(), codes);
        Some(url)
    }

    pub fn remove(&self, url: &str) {
        self.sets.remove(url);
    }

    pub fn contains(&self, url: &str, system: Option<&str>, code: &str) -> bool {
        let Some(set) = self.sets.get(url) else {
            return false;
        };
        match system {
            Some(system) => set.contains(&format!("{system}|{code}")),
            None => set.contains(&format!("|{code}")) || set.iter().any(|k| k.ends_with(&format!("|{code}"))),
        }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

fn collect_codes(entries: &[Value], default_system: Option<&str>, out: &mut HashSet<String>) {
    for entry in entries {
        let Some(code) = entry.get("code").and_then(Value::as_str) else {
            continue;
        };
        let system = entry
            .get("system")
            .and_then(Value::as_str)
            .or(default_system)
            .unwrap_or("");
        out.insert(format!("{system}|{code}"));
        out.insert(format!("|{code}"));
        // Expansions may nest.
        if let Some(nested) = entry.get("contains").and_then(Value::as_array) {
            collect_codes(nested, default_system, out);
        }
    }
}

impl TerminologyService for ValueSetIndex {
    fn value_set_contains(&self, value_set_url: &str, system: Option<&str>, code: &str) -> bool {
        self.contains(value_set_url, system, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn color_value_set() -> Resource {
        Resource::new(json!({
            "resourceType": "ValueSet",
            "id": "colors",
            "url": "http://example.org/vs/colors",
            "compose": {
                "include": [{
                    "system": "http://example.org/cs/colors",
                    "concept": [
                        {"code": "red"},
                        {"code": "green"}
                    ]
                }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn registers_compose_concepts() {
        let index = ValueSetIndex::new();
        let url = index.register(&color_value_set()).unwrap();
        assert_eq!(url, "http://example.org/vs/colors");
        assert!(index.contains(&url, Some("http://example.org/cs/colors"), "red"));
        assert!(index.contains(&url, None, "green"));
        assert!(!index.contains(&url, None, "blue"));
        assert!(!index.contains("http://other", None, "red"));
    }

    #[test]
    fn expansion_takes_precedence() {
        let index = ValueSetIndex::new();
        let vs = Resource::new(json!({
            "resourceType": "ValueSet",
            "url": "http://example.org/vs/exp",
            "expansion": {
                "contains": [
                    {"system": "http://s", "code": "a", "contains": [
                        {"system": "http://s", "code": "a.1"}
                    ]}
                ]
            },
            "compose": {"include": [{"system": "http://ignored", "concept": [{"code": "zzz"}]}]}
        }))
        .unwrap();
        let url = index.register(&vs).unwrap();
        assert!(index.contains(&url, Some("http://s"), "a"));
        assert!(index.contains(&url, Some("http://s"), "a.1"));
        assert!(!index.contains(&url, None, "zzz"));
    }

    #[test]
    fn register_without_url_is_rejected() {
        let index = ValueSetIndex::new();
        let vs = Resource::new(json!({"resourceType": "ValueSet", "id": "nourl"})).unwrap();
        assert!(index.register(&vs).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn remove_drops_membership() {
        let index = ValueSetIndex::new();
        let url = index.register(&color_value_set()).unwrap();
        index.remove(&url);
        assert!(!index.contains(&url, None, "red"));
    }
}

use crate::error::SearchError;
use crate::parameters::{SearchParamDef, SearchParamType};
use emberfhir_core::Resource;
use serde_json::Value;
use std::collections::HashMap;

/// Per-store registry of executable search parameters.
#[derive(Debug, Clone, Default)]
pub struct SearchParamRegistry {
    params: HashMap<String, SearchParamDef>,
}

impl SearchParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the cross-resource parameters plus the built-in
    /// definitions for the given type.
    pub fn for_type(type_name: &str) -> Self {
        let mut registry = Self::new();
        for def in common_parameters() {
            registry.insert(def);
        }
        for def in builtin_for(type_name) {
            registry.insert(def);
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&SearchParamDef> {
        self.params.get(name)
    }

    pub fn insert(&mut self, def: SearchParamDef) {
        self.params.insert(def.name.clone(), def);
    }

    pub fn remove(&mut self, name: &str) -> Option<SearchParamDef> {
        self.params.remove(name)
    }

    pub fn defs(&self) -> impl Iterator<Item = &SearchParamDef> {
        self.params.values()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Parameters every resource type supports.
pub fn common_parameters() -> Vec<SearchParamDef> {
    vec![
        SearchParamDef::new("_id", SearchParamType::Token, "id")
            .with_documentation("Logical id of this artifact"),
        SearchParamDef::new("_lastUpdated", SearchParamType::Date, "meta.lastUpdated")
            .with_documentation("When the resource version last changed"),
        SearchParamDef::new("_tag", SearchParamType::Token, "meta.tag")
            .with_documentation("Tags applied to this resource"),
        SearchParamDef::new("_profile", SearchParamType::Uri, "meta.profile")
            .with_documentation("Profiles this resource claims to conform to"),
        SearchParamDef::new("_security", SearchParamType::Token, "meta.security")
            .with_documentation("Security labels applied to this resource"),
        SearchParamDef::new("_source", SearchParamType::Uri, "meta.source")
            .with_documentation("Identifies where the resource comes from"),
    ]
}

/// Built-in definitions for the types the server ships with. Additional
/// parameters arrive at runtime through SearchParameter resources.
pub fn builtin_for(type_name: &str) -> Vec<SearchParamDef> {
    match type_name {
        "Patient" => vec![
            SearchParamDef::new("name", SearchParamType::String, "Patient.name"),
            SearchParamDef::new("family", SearchParamType::String, "Patient.name.family"),
            SearchParamDef::new("given", SearchParamType::String, "Patient.name.given"),
            SearchParamDef::new("identifier", SearchParamType::Token, "Patient.identifier"),
            SearchParamDef::new("birthdate", SearchParamType::Date, "Patient.birthDate"),
            SearchParamDef::new("gender", SearchParamType::Token, "Patient.gender"),
            SearchParamDef::new("active", SearchParamType::Token, "Patient.active"),
        ],
        "Observation" => vec![
            SearchParamDef::new("status", SearchParamType::Token, "Observation.status"),
            SearchParamDef::new("code", SearchParamType::Token, "Observation.code"),
            SearchParamDef::new("identifier", SearchParamType::Token, "Observation.identifier"),
            SearchParamDef::new("subject", SearchParamType::Reference, "Observation.subject")
                .with_targets(&["Patient", "Group", "Device", "Location"]),
            SearchParamDef::new("patient", SearchParamType::Reference, "Observation.subject")
                .with_targets(&["Patient"]),
            SearchParamDef::new("encounter", SearchParamType::Reference, "Observation.encounter")
                .with_targets(&["Encounter"]),
            SearchParamDef::new("date", SearchParamType::Date, "Observation.effectiveDateTime"),
            SearchParamDef::new(
                "value-quantity",
                SearchParamType::Quantity,
                "Observation.valueQuantity",
            ),
            SearchParamDef::new("code-value-quantity", SearchParamType::Composite, "Observation")
                .with_component("code", SearchParamType::Token)
                .with_component("valueQuantity", SearchParamType::Quantity),
        ],
        "Encounter" => vec![
            SearchParamDef::new("status", SearchParamType::Token, "Encounter.status"),
            SearchParamDef::new("class", SearchParamType::Token, "Encounter.class"),
            SearchParamDef::new("identifier", SearchParamType::Token, "Encounter.identifier"),
            SearchParamDef::new("subject", SearchParamType::Reference, "Encounter.subject")
                .with_targets(&["Patient", "Group"]),
            SearchParamDef::new("patient", SearchParamType::Reference, "Encounter.subject")
                .with_targets(&["Patient"]),
        ],
        "Condition" => vec![
            SearchParamDef::new("code", SearchParamType::Token, "Condition.code"),
            SearchParamDef::new("identifier", SearchParamType::Token, "Condition.identifier"),
            SearchParamDef::new("subject", SearchParamType::Reference, "Condition.subject")
                .with_targets(&["Patient", "Group"]),
            SearchParamDef::new("patient", SearchParamType::Reference, "Condition.subject")
                .with_targets(&["Patient"]),
            SearchParamDef::new(
                "clinical-status",
                SearchParamType::Token,
                "Condition.clinicalStatus",
            ),
        ],
        "DiagnosticReport" => vec![
            SearchParamDef::new("status", SearchParamType::Token, "DiagnosticReport.status"),
            SearchParamDef::new("code", SearchParamType::Token, "DiagnosticReport.code"),
            SearchParamDef::new("subject", SearchParamType::Reference, "DiagnosticReport.subject")
                .with_targets(&["Patient", "Group", "Device", "Location"]),
            SearchParamDef::new("patient", SearchParamType::Reference, "DiagnosticReport.subject")
                .with_targets(&["Patient"]),
        ],
        "MedicationRequest" => vec![
            SearchParamDef::new("status", SearchParamType::Token, "MedicationRequest.status"),
            SearchParamDef::new("subject", SearchParamType::Reference, "MedicationRequest.subject")
                .with_targets(&["Patient", "Group"]),
            SearchParamDef::new("patient", SearchParamType::Reference, "MedicationRequest.subject")
                .with_targets(&["Patient"]),
        ],
        "Subscription" => vec![
            SearchParamDef::new("status", SearchParamType::Token, "Subscription.status"),
            SearchParamDef::new("url", SearchParamType::Uri, "Subscription.endpoint"),
            SearchParamDef::new("topic", SearchParamType::Uri, "Subscription.topic"),
        ],
        "SubscriptionTopic" => vec![
            SearchParamDef::new("url", SearchParamType::Uri, "SubscriptionTopic.url"),
            SearchParamDef::new("status", SearchParamType::Token, "SubscriptionTopic.status"),
        ],
        "ValueSet" => vec![
            SearchParamDef::new("url", SearchParamType::Uri, "ValueSet.url"),
            SearchParamDef::new("status", SearchParamType::Token, "ValueSet.status"),
            SearchParamDef::new("name", SearchParamType::String, "ValueSet.name"),
        ],
        "SearchParameter" => vec![
            SearchParamDef::new("url", SearchParamType::Uri, "SearchParameter.url"),
            SearchParamDef::new("code", SearchParamType::Token, "SearchParameter.code"),
            SearchParamDef::new("base", SearchParamType::Token, "SearchParameter.base"),
            SearchParamDef::new("type", SearchParamType::Token, "SearchParameter.type"),
        ],
        "Basic" => vec![
            SearchParamDef::new("code", SearchParamType::Token, "Basic.code"),
            SearchParamDef::new("identifier", SearchParamType::Token, "Basic.identifier"),
        ],
        _ => Vec::new(),
    }
}

/// Turn a SearchParameter resource into an executable definition plus the
/// base types it applies to.
pub fn from_search_parameter_resource(
    resource: &Resource,
) -> Result<(Vec<String>, SearchParamDef), SearchError> {
    let json = resource.as_json();

    let code = json
        .get("code")
        .and_then(Value::as_str)
        .ok_or_else(|| SearchError::invalid_definition("SearchParameter is missing code"))?;

    let type_str = json
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SearchError::invalid_definition("SearchParameter is missing type"))?;
    let param_type = SearchParamType::parse(type_str).ok_or_else(|| {
        SearchError::invalid_definition(format!("unknown search parameter type '{type_str}'"))
    })?;

    let expression = json
        .get("expression")
        .and_then(Value::as_str)
        .ok_or_else(|| SearchError::invalid_definition("SearchParameter is missing expression"))?;

    let bases: Vec<String> = json
        .get("base")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if bases.is_empty() {
        return Err(SearchError::invalid_definition(
            "SearchParameter lists no base types",
        ));
    }

    let mut def = SearchParamDef::new(code, param_type, expression);
    if let Some(targets) = json.get("target").and_then(Value::as_array) {
        let targets: Vec<String> = targets
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        def.targets = targets;
    }
    if let Some(doc) = json.get("description").and_then(Value::as_str) {
        def.documentation = Some(doc.to_string());
    }

    Ok((bases, def))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn for_type_seeds_common_and_builtin() {
        let registry = SearchParamRegistry::for_type("Patient");
        assert!(registry.get("_id").is_some());
        assert!(registry.get("_lastUpdated").is_some());
        assert!(registry.get("name").is_some());
        assert!(registry.get("bogus").is_none());
    }

    #[test]
    fn unknown_types_still_get_common_parameters() {
        let registry = SearchParamRegistry::for_type("Device");
        assert!(registry.get("_id").is_some());
        assert_eq!(registry.len(), common_parameters().len());
    }

    #[test]
    fn search_parameter_resource_conversion() {
        let resource = Resource::new(json!({
            "resourceType": "SearchParameter",
            "id": "sp1",
            "url": "http://example.org/SearchParameter/pet-name",
            "code": "pet-name",
            "base": ["Patient"],
            "type": "string",
            "expression": "Patient.extension.valueString",
            "description": "Name of the patient's pet"
        }))
        .unwrap();

        let (bases, def) = from_search_parameter_resource(&resource).unwrap();
        assert_eq!(bases, vec!["Patient"]);
        assert_eq!(def.name, "pet-name");
        assert_eq!(def.param_type, SearchParamType::String);
        assert!(def.documentation.is_some());
    }

    #[test]
    fn search_parameter_resource_requires_fields() {
        let missing_base = Resource::new(json!({
            "resourceType": "SearchParameter",
            "code": "x",
            "type": "string",
            "expression": "Patient.name"
        }))
        .unwrap();
        assert!(from_search_parameter_resource(&missing_base).is_err());

        let bad_type = Resource::new(json!({
            "resourceType": "SearchParameter",
            "code": "x",
            "base": ["Patient"],
            "type": "special",
            "expression": "Patient.name"
        }))
        .unwrap();
        assert!(from_search_parameter_resource(&bad_type).is_err());
    }
}

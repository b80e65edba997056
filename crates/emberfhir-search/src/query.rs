use crate::include::IncludeDirective;
use crate::parameters::{ParsedSearchParameter, ParsedValue, SearchModifier};
use crate::registry::SearchParamRegistry;
use url::form_urlencoded;

/// Cross-resource keys the parser recognizes but for which no predicate is
/// implemented; they are kept (ignored) for self-link fidelity.
const PASSTHROUGH_KEYS: &[&str] = &[
    "_text", "_content", "_list", "_has", "_type", "_filter", "_query",
];

/// How the total count is reported on a search bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TotalMode {
    #[default]
    None,
    Estimate,
    Accurate,
}

impl TotalMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "estimate" => Some(Self::Estimate),
            "accurate" => Some(Self::Accurate),
            _ => None,
        }
    }
}

/// Serialization filter selected by `_summary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryMode {
    #[default]
    False,
    True,
    Text,
    Data,
    Count,
}

impl SummaryMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "false" => Some(Self::False),
            "true" => Some(Self::True),
            "text" => Some(Self::Text),
            "data" => Some(Self::Data),
            "count" => Some(Self::Count),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Result-shaping parameters split off from the search predicates.
#[derive(Debug, Clone, Default)]
pub struct ResultParameters {
    pub includes: Vec<IncludeDirective>,
    pub revincludes: Vec<IncludeDirective>,
    pub sort: Vec<SortKey>,
    pub count: Option<usize>,
    pub total: TotalMode,
    pub summary: SummaryMode,
    pub elements: Vec<String>,
    pub contained: Option<String>,
    pub contained_type: Option<String>,
    pub format: Option<String>,
    pub pretty: bool,
}

/// A fully tokenized query string.
#[derive(Debug, Clone, Default)]
pub struct ParsedQuery {
    pub parameters: Vec<ParsedSearchParameter>,
    pub result: ResultParameters,
    raw_pairs: Vec<(String, String)>,
}

impl ParsedQuery {
    /// Tokenize the raw query portion of a URL against a registry. Unknown
    /// keys and modifiers are kept as ignored parameters.
    pub fn parse(query: &str, registry: &SearchParamRegistry) -> Self {
        let mut parsed = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let key = key.into_owned();
            let value = value.into_owned();
            parsed.raw_pairs.push((key.clone(), value.clone()));

            let (name, modifier_raw) = match key.split_once(':') {
                Some((n, m)) => (n, Some(m)),
                None => (key.as_str(), None),
            };

            if parsed.consume_result_parameter(name, modifier_raw, &value) {
                continue;
            }

            let modifier = match modifier_raw {
                Some(raw) => match SearchModifier::parse(raw) {
                    Some(m) => Some(m),
                    None => {
                        // Unknown modifier: keep for the self link only.
                        parsed
                            .parameters
                            .push(ParsedSearchParameter::ignored(name, None));
                        continue;
                    }
                },
                None => None,
            };

            if registry.get(name).is_none() || PASSTHROUGH_KEYS.contains(&name) {
                parsed
                    .parameters
                    .push(ParsedSearchParameter::ignored(name, modifier));
                continue;
            }

            let values: Vec<ParsedValue> = value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ParsedValue::new)
                .collect();

            let mut parameter = ParsedSearchParameter::new(name, values);
            parameter.modifier = modifier;
            parsed.parameters.push(parameter);
        }
        parsed
    }

    /// Handle a result parameter; returns true when the key was consumed.
    fn consume_result_parameter(&mut self, name: &str, modifier: Option<&str>, value: &str) -> bool {
        match name {
            "_include" | "_revinclude" => {
                let iterate = matches!(modifier, Some("iterate") | Some("reverse"));
                if let Ok(directive) = IncludeDirective::parse(value, iterate) {
                    if name == "_include" {
                        self.result.includes.push(directive);
                    } else {
                        self.result.revincludes.push(directive);
                    }
                }
                true
            }
            "_sort" => {
                for field in value.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                    let (field, descending) = match field.strip_prefix('-') {
                        Some(stripped) => (stripped, true),
                        None => (field, false),
                    };
                    self.result.sort.push(SortKey {
                        field: field.to_string(),
                        descending,
                    });
                }
                true
            }
            "_count" => {
                self.result.count = value.parse::<usize>().ok();
                true
            }
            "_total" => {
                if let Some(mode) = TotalMode::parse(value) {
                    self.result.total = mode;
                }
                true
            }
            "_summary" => {
                if let Some(mode) = SummaryMode::parse(value) {
                    self.result.summary = mode;
                }
                true
            }
            "_elements" => {
                self.result.elements.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .map(str::to_string),
                );
                true
            }
            "_contained" => {
                self.result.contained = Some(value.to_string());
                true
            }
            "_containedType" => {
                self.result.contained_type = Some(value.to_string());
                true
            }
            "_format" => {
                self.result.format = Some(value.to_string());
                true
            }
            "_pretty" => {
                self.result.pretty = value == "true";
                true
            }
            _ => false,
        }
    }

    /// Predicates only: the parameters the tester should evaluate.
    pub fn predicates(&self) -> Vec<ParsedSearchParameter> {
        self.parameters.iter().filter(|p| !p.ignored).cloned().collect()
    }

    /// Rebuild the query string for the bundle's `self` link, preserving
    /// every pair the client sent, ignored ones included.
    pub fn self_link_query(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.raw_pairs {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{SearchComparator, SearchModifier};

    fn registry() -> SearchParamRegistry {
        SearchParamRegistry::for_type("Patient")
    }

    #[test]
    fn splits_predicates_and_result_parameters() {
        let q = ParsedQuery::parse(
            "name=smith&_count=10&_sort=-_lastUpdated&_summary=text",
            &registry(),
        );
        assert_eq!(q.parameters.len(), 1);
        assert_eq!(q.result.count, Some(10));
        assert_eq!(q.result.sort.len(), 1);
        assert!(q.result.sort[0].descending);
        assert_eq!(q.result.sort[0].field, "_lastUpdated");
        assert_eq!(q.result.summary, SummaryMode::Text);
    }

    #[test]
    fn unknown_keys_are_kept_but_ignored() {
        let q = ParsedQuery::parse("name=smith&frobnicate=9", &registry());
        assert_eq!(q.parameters.len(), 2);
        let unknown = q.parameters.iter().find(|p| p.name == "frobnicate").unwrap();
        assert!(unknown.ignored);
        assert_eq!(q.predicates().len(), 1);
        // Unknown pairs survive into the self link.
        assert!(q.self_link_query().contains("frobnicate=9"));
    }

    #[test]
    fn unknown_modifier_marks_ignored() {
        let q = ParsedQuery::parse("name:sounds-like=smyth", &registry());
        assert_eq!(q.parameters.len(), 1);
        assert!(q.parameters[0].ignored);
    }

    #[test]
    fn passthrough_keys_contribute_no_predicate() {
        let q = ParsedQuery::parse("_text=fever&_content=x", &registry());
        assert_eq!(q.predicates().len(), 0);
        assert_eq!(q.parameters.len(), 2);
    }

    #[test]
    fn modifiers_and_comparators() {
        let q = ParsedQuery::parse("name:exact=Smith&birthdate=ge2020-01-01", &registry());
        let name = q.parameters.iter().find(|p| p.name == "name").unwrap();
        assert_eq!(name.modifier, Some(SearchModifier::Exact));
        let bd = q.parameters.iter().find(|p| p.name == "birthdate").unwrap();
        assert_eq!(bd.values[0].comparator, SearchComparator::Ge);
        assert_eq!(bd.values[0].raw, "2020-01-01");
    }

    #[test]
    fn comma_values_form_disjunction() {
        let q = ParsedQuery::parse("gender=male,female", &registry());
        assert_eq!(q.parameters[0].values.len(), 2);
    }

    #[test]
    fn repeated_names_form_conjunction() {
        let q = ParsedQuery::parse("name=smith&name=anna", &registry());
        assert_eq!(q.parameters.len(), 2);
        assert!(q.parameters.iter().all(|p| p.name == "name"));
    }

    #[test]
    fn includes_and_revincludes() {
        let q = ParsedQuery::parse(
            "_include=Observation:subject&_revinclude=Observation:subject&_include:iterate=Observation:encounter",
            &registry(),
        );
        assert_eq!(q.result.includes.len(), 2);
        assert_eq!(q.result.revincludes.len(), 1);
        assert!(q.result.includes.iter().any(|i| i.iterate));
    }

    #[test]
    fn plus_decodes_to_space_and_round_trips() {
        let q = ParsedQuery::parse("name=John+Doe", &registry());
        assert_eq!(q.parameters[0].values[0].raw, "John Doe");
        assert_eq!(q.self_link_query(), "name=John+Doe");
    }

    #[test]
    fn format_and_pretty_are_captured() {
        let q = ParsedQuery::parse("_format=xml&_pretty=true", &registry());
        assert_eq!(q.result.format.as_deref(), Some("xml"));
        assert!(q.result.pretty);
    }

    #[test]
    fn missing_modifier_keeps_boolean_value() {
        let q = ParsedQuery::parse("name:missing=true", &registry());
        let p = &q.parameters[0];
        assert_eq!(p.modifier, Some(SearchModifier::Missing));
        assert_eq!(p.values[0].raw, "true");
        assert!(!p.ignored);
    }
}

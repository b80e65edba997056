use serde::{Deserialize, Serialize};
use std::fmt;

/// Search parameter value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamType {
    Number,
    Date,
    String,
    Token,
    Reference,
    Composite,
    Quantity,
    Uri,
}

impl SearchParamType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "number" => Some(Self::Number),
            "date" => Some(Self::Date),
            "string" => Some(Self::String),
            "token" => Some(Self::Token),
            "reference" => Some(Self::Reference),
            "composite" => Some(Self::Composite),
            "quantity" => Some(Self::Quantity),
            "uri" => Some(Self::Uri),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Date => "date",
            Self::String => "string",
            Self::Token => "token",
            Self::Reference => "reference",
            Self::Composite => "composite",
            Self::Quantity => "quantity",
            Self::Uri => "uri",
        }
    }
}

/// Modifiers applied as a `:suffix` on the parameter name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchModifier {
    Missing,
    Exact,
    Contains,
    Text,
    Not,
    Above,
    Below,
    In,
    NotIn,
    OfType,
    Identifier,
    Iterate,
    /// `subject:Patient` style target-type restriction.
    Type(String),
}

impl SearchModifier {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(Self::Missing),
            "exact" => Some(Self::Exact),
            "contains" => Some(Self::Contains),
            "text" => Some(Self::Text),
            "not" => Some(Self::Not),
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            "in" => Some(Self::In),
            "not-in" => Some(Self::NotIn),
            "of-type" => Some(Self::OfType),
            "identifier" => Some(Self::Identifier),
            "iterate" => Some(Self::Iterate),
            other
                if other
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_uppercase())
                    .unwrap_or(false)
                    && other.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                Some(Self::Type(other.to_string()))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Missing => "missing",
            Self::Exact => "exact",
            Self::Contains => "contains",
            Self::Text => "text",
            Self::Not => "not",
            Self::Above => "above",
            Self::Below => "below",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::OfType => "of-type",
            Self::Identifier => "identifier",
            Self::Iterate => "iterate",
            Self::Type(t) => t.as_str(),
        }
    }
}

/// Value comparators, `ge2020-01-01` style prefixes on the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchComparator {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Sa,
    Eb,
    Ap,
}

impl SearchComparator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "lt" => Some(Self::Lt),
            "ge" => Some(Self::Ge),
            "le" => Some(Self::Le),
            "sa" => Some(Self::Sa),
            "eb" => Some(Self::Eb),
            "ap" => Some(Self::Ap),
            _ => None,
        }
    }

    /// Split a raw value into its comparator prefix and remainder.
    /// Comparators only apply to ordered values, so the prefix is honored
    /// only when a digit or sign follows; `lester` stays a plain string.
    pub fn extract(value: &str) -> (Self, &str) {
        if value.len() > 2
            && let Some(comparator) = Self::parse(&value[..2])
            && value[2..]
                .chars()
                .next()
                .map(|c| c.is_ascii_digit() || c == '-')
                .unwrap_or(false)
        {
            return (comparator, &value[2..]);
        }
        (Self::Eq, value)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Ge => "ge",
            Self::Le => "le",
            Self::Sa => "sa",
            Self::Eb => "eb",
            Self::Ap => "ap",
        }
    }
}

impl fmt::Display for SearchComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value of a parameter occurrence; multiple values within an
/// occurrence form a disjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedValue {
    pub comparator: SearchComparator,
    pub raw: String,
}

impl ParsedValue {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let (comparator, remainder) = SearchComparator::extract(&raw);
        Self {
            comparator,
            raw: remainder.to_string(),
        }
    }

    pub fn with_comparator(comparator: SearchComparator, raw: impl Into<String>) -> Self {
        Self {
            comparator,
            raw: raw.into(),
        }
    }
}

/// One parameter occurrence from a query string or a subscription filter.
///
/// Ignored parameters stay in the parsed list so the `self` link can be
/// reconstructed, but contribute no predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSearchParameter {
    pub name: String,
    pub modifier: Option<SearchModifier>,
    pub values: Vec<ParsedValue>,
    pub ignored: bool,
}

impl ParsedSearchParameter {
    pub fn new(name: impl Into<String>, values: Vec<ParsedValue>) -> Self {
        Self {
            name: name.into(),
            modifier: None,
            values,
            ignored: false,
        }
    }

    pub fn with_modifier(mut self, modifier: SearchModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    pub fn ignored(name: impl Into<String>, modifier: Option<SearchModifier>) -> Self {
        Self {
            name: name.into(),
            modifier,
            values: Vec::new(),
            ignored: true,
        }
    }
}

/// Component of a composite parameter, evaluated against the element the
/// outer expression extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeComponent {
    pub expression: String,
    pub param_type: SearchParamType,
}

/// An executable search parameter definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParamDef {
    pub name: String,
    pub param_type: SearchParamType,
    pub expression: String,
    pub targets: Vec<String>,
    pub documentation: Option<String>,
    pub components: Vec<CompositeComponent>,
}

impl SearchParamDef {
    pub fn new(
        name: impl Into<String>,
        param_type: SearchParamType,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            expression: expression.into(),
            targets: Vec::new(),
            documentation: None,
            components: Vec::new(),
        }
    }

    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.targets = targets.iter().map(|t| (*t).to_string()).collect();
        self
    }

    pub fn with_documentation(mut self, doc: impl Into<String>) -> Self {
        self.documentation = Some(doc.into());
        self
    }

    pub fn with_component(mut self, expression: impl Into<String>, param_type: SearchParamType) -> Self {
        self.components.push(CompositeComponent {
            expression: expression.into(),
            param_type,
        });
        self
    }
}

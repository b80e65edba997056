//! Decides whether a resource tree matches a conjunction of parsed search
//! parameters.

use crate::cache::PathCache;
use crate::parameters::{
    ParsedSearchParameter, ParsedValue, SearchComparator, SearchModifier, SearchParamDef,
    SearchParamType,
};
use crate::registry::SearchParamRegistry;
use emberfhir_core::{EvalContext, Resource, ResourceReference};
use serde_json::Value;
use time::{Date, Duration, Month, OffsetDateTime, Time};

/// Everything a match test needs besides the resource itself.
pub struct SearchContext<'a> {
    pub type_name: &'a str,
    pub registry: &'a SearchParamRegistry,
    pub cache: &'a PathCache,
    pub eval: &'a EvalContext,
}

/// The conjunction of all parameters is the overall verdict; values within
/// one parameter occurrence are a disjunction.
pub fn matches(
    resource: &Resource,
    parameters: &[ParsedSearchParameter],
    ctx: &SearchContext<'_>,
) -> bool {
    parameters
        .iter()
        .filter(|p| !p.ignored)
        .all(|p| parameter_matches(resource, p, ctx))
}

fn parameter_matches(
    resource: &Resource,
    parameter: &ParsedSearchParameter,
    ctx: &SearchContext<'_>,
) -> bool {
    let Some(def) = ctx.registry.get(&parameter.name) else {
        // Unvetted parameters contribute no predicate.
        return true;
    };

    let cache_key = format!("{}.{}", ctx.type_name, parameter.name);
    let expr = match ctx.cache.get_or_compile(&cache_key, &def.expression) {
        Ok(expr) => expr,
        Err(err) => {
            tracing::warn!(parameter = %parameter.name, error = %err, "search expression failed to compile");
            return true;
        }
    };
    let elements = expr.evaluate(resource.as_json(), ctx.eval);

    if matches!(parameter.modifier, Some(SearchModifier::Missing)) {
        let want_missing = parameter
            .values
            .first()
            .map(|v| v.raw == "true")
            .unwrap_or(true);
        return elements.is_empty() == want_missing;
    }

    if parameter.values.is_empty() {
        return true;
    }

    let mut matched = elements.iter().any(|element| {
        parameter
            .values
            .iter()
            .any(|value| value_matches(def, element, value, parameter, ctx))
    });

    if matches!(parameter.modifier, Some(SearchModifier::Not)) {
        matched = !matched;
    }
    matched
}

fn value_matches(
    def: &SearchParamDef,
    element: &Value,
    value: &ParsedValue,
    parameter: &ParsedSearchParameter,
    ctx: &SearchContext<'_>,
) -> bool {
    match def.param_type {
        SearchParamType::String => match_string(element, value, parameter.modifier.as_ref()),
        SearchParamType::Token => match_token(element, value, parameter.modifier.as_ref(), ctx),
        SearchParamType::Reference => {
            match_reference(element, value, parameter.modifier.as_ref(), ctx)
        }
        SearchParamType::Date => match_date(element, value),
        SearchParamType::Number => match_number(element, value),
        SearchParamType::Quantity => match_quantity(element, value),
        SearchParamType::Uri => match_uri(element, value, parameter.modifier.as_ref()),
        SearchParamType::Composite => match_composite(def, element, value, parameter, ctx),
    }
}

// ---------------------------------------------------------------------------
// string

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn match_string(element: &Value, value: &ParsedValue, modifier: Option<&SearchModifier>) -> bool {
    let mut candidates = Vec::new();
    collect_strings(element, &mut candidates);
    let needle = value.raw.to_lowercase();

    candidates.iter().any(|candidate| {
        let haystack = candidate.to_lowercase();
        match modifier {
            Some(SearchModifier::Exact) => candidate == &value.raw,
            Some(SearchModifier::Contains) | Some(SearchModifier::Text) => {
                haystack.contains(&needle)
            }
            _ => haystack.starts_with(&needle),
        }
    })
}

// ---------------------------------------------------------------------------
// token

/// `(system, code)` candidates a token element exposes. Covers primitives,
/// Coding, CodeableConcept and Identifier shapes.
fn token_candidates(element: &Value) -> Vec<(Option<String>, String)> {
    let mut out = Vec::new();
    match element {
        Value::String(s) => out.push((None, s.clone())),
        Value::Bool(b) => out.push((None, b.to_string())),
        Value::Number(n) => out.push((None, n.to_string())),
        Value::Array(items) => {
            for item in items {
                out.extend(token_candidates(item));
            }
        }
        Value::Object(map) => {
            let system = map.get("system").and_then(Value::as_str).map(str::to_string);
            if let Some(code) = map.get("code").and_then(Value::as_str) {
                out.push((system.clone(), code.to_string()));
            } else if let Some(value) = map.get("value").and_then(Value::as_str) {
                // Identifier shape
                out.push((system, value.to_string()));
            }
            if let Some(codings) = map.get("coding").and_then(Value::as_array) {
                for coding in codings {
                    out.extend(token_candidates(coding));
                }
            }
        }
        _ => {}
    }
    out
}

fn match_token(
    element: &Value,
    value: &ParsedValue,
    modifier: Option<&SearchModifier>,
    ctx: &SearchContext<'_>,
) -> bool {
    let candidates = token_candidates(element);

    match modifier {
        Some(SearchModifier::In) | Some(SearchModifier::Above) | Some(SearchModifier::Below) => {
            // Value-set membership; above/below defer to the same index.
            let Some(terminology) = ctx.eval.terminology() else {
                return false;
            };
            candidates.iter().any(|(system, code)| {
                terminology.value_set_contains(&value.raw, system.as_deref(), code)
            })
        }
        Some(SearchModifier::NotIn) => {
            let Some(terminology) = ctx.eval.terminology() else {
                return true;
            };
            !candidates.iter().any(|(system, code)| {
                terminology.value_set_contains(&value.raw, system.as_deref(), code)
            })
        }
        Some(SearchModifier::Text) => {
            let mut texts = Vec::new();
            if let Value::Object(map) = element {
                for key in ["text", "display"] {
                    if let Some(s) = map.get(key).and_then(Value::as_str) {
                        texts.push(s.to_string());
                    }
                }
                if let Some(codings) = map.get("coding").and_then(Value::as_array) {
                    for coding in codings {
                        if let Some(s) = coding.get("display").and_then(Value::as_str) {
                            texts.push(s.to_string());
                        }
                    }
                }
            }
            let needle = value.raw.to_lowercase();
            texts.iter().any(|t| t.to_lowercase().contains(&needle))
        }
        Some(SearchModifier::OfType) => match_identifier_of_type(element, &value.raw),
        _ => {
            let (want_system, want_code) = split_token_value(&value.raw);
            candidates.iter().any(|(system, code)| {
                let code_ok = code == want_code;
                let system_ok = match want_system {
                    None => true,
                    Some("") => system.is_none(),
                    Some(want) => system.as_deref() == Some(want),
                };
                code_ok && system_ok
            })
        }
    }
}

/// `system|code` split: no bar means any system, an empty left side means
/// explicitly no system.
fn split_token_value(raw: &str) -> (Option<&str>, &str) {
    match raw.split_once('|') {
        Some((system, code)) => (Some(system), code),
        None => (None, raw),
    }
}

/// `:of-type` takes `type-system|type-code|value` against an Identifier.
fn match_identifier_of_type(element: &Value, raw: &str) -> bool {
    let parts: Vec<&str> = raw.splitn(3, '|').collect();
    if parts.len() != 3 {
        return false;
    }
    let (type_system, type_code, value) = (parts[0], parts[1], parts[2]);

    let Some(map) = element.as_object() else {
        return false;
    };
    if map.get("value").and_then(Value::as_str) != Some(value) {
        return false;
    }
    map.get("type")
        .and_then(|t| t.get("coding"))
        .and_then(Value::as_array)
        .map(|codings| {
            codings.iter().any(|c| {
                c.get("system").and_then(Value::as_str) == Some(type_system)
                    && c.get("code").and_then(Value::as_str) == Some(type_code)
            })
        })
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// reference

fn match_reference(
    element: &Value,
    value: &ParsedValue,
    modifier: Option<&SearchModifier>,
    ctx: &SearchContext<'_>,
) -> bool {
    if matches!(modifier, Some(SearchModifier::Identifier)) {
        // Match the reference's logical identifier, `system|value`.
        let (want_system, want_value) = split_token_value(&value.raw);
        return element
            .get("identifier")
            .map(|identifier| {
                let system = identifier.get("system").and_then(Value::as_str);
                let id_value = identifier.get("value").and_then(Value::as_str);
                id_value == Some(want_value)
                    && match want_system {
                        None => true,
                        Some("") => system.is_none(),
                        Some(want) => system == Some(want),
                    }
            })
            .unwrap_or(false);
    }

    let Some(reference) = ResourceReference::from_element(element) else {
        return false;
    };

    if let Some(SearchModifier::Type(type_name)) = modifier {
        return reference.resource_type.as_deref() == Some(type_name.as_str())
            && reference.id.as_deref() == Some(value.raw.as_str());
    }

    if reference.raw == value.raw {
        return true;
    }
    if reference.local_key().as_deref() == Some(value.raw.as_str()) {
        return true;
    }
    // A bare id matches regardless of target type.
    if !value.raw.contains('/') && reference.id.as_deref() == Some(value.raw.as_str()) {
        return true;
    }
    // Last resort: resolve and compare identity.
    if let Some(resolver) = ctx.eval.resolver()
        && let Some(resolved) = resolver.resolve(&reference.raw)
    {
        return resolved.key() == value.raw;
    }
    false
}

// ---------------------------------------------------------------------------
// date

/// Half-open `[start, end)` range covered by a (possibly partial) date
/// literal: `2020`, `2020-03`, `2020-03-14`, or a full instant.
fn parse_date_range(raw: &str) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let bytes = raw.as_bytes();
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());

    if bytes.len() == 4 && all_digits(raw) {
        let year: i32 = raw.parse().ok()?;
        let start = Date::from_calendar_date(year, Month::January, 1).ok()?;
        let end = Date::from_calendar_date(year + 1, Month::January, 1).ok()?;
        return Some((midnight(start), midnight(end)));
    }
    if bytes.len() == 7 && &raw[4..5] == "-" {
        let year: i32 = raw[..4].parse().ok()?;
        let month: u8 = raw[5..7].parse().ok()?;
        let month = Month::try_from(month).ok()?;
        let start = Date::from_calendar_date(year, month, 1).ok()?;
        let (next_year, next_month) = if month == Month::December {
            (year + 1, Month::January)
        } else {
            (year, month.next())
        };
        let end = Date::from_calendar_date(next_year, next_month, 1).ok()?;
        return Some((midnight(start), midnight(end)));
    }
    if bytes.len() == 10 && &raw[4..5] == "-" && &raw[7..8] == "-" {
        let date = Date::parse(
            raw,
            &time::format_description::well_known::Iso8601::DEFAULT,
        )
        .ok()?;
        return Some((midnight(date), midnight(date) + Duration::days(1)));
    }

    // Full instant; tolerate a missing offset by assuming UTC.
    let parsed = OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .or_else(|_| {
            OffsetDateTime::parse(
                &format!("{raw}Z"),
                &time::format_description::well_known::Rfc3339,
            )
        })
        .ok()?;
    Some((parsed, parsed + Duration::seconds(1)))
}

fn midnight(date: Date) -> OffsetDateTime {
    date.with_time(Time::MIDNIGHT).assume_utc()
}

/// Range covered by a date-ish element: a string literal or a Period.
fn element_date_range(element: &Value) -> Option<(OffsetDateTime, OffsetDateTime)> {
    match element {
        Value::String(s) => parse_date_range(s),
        Value::Object(map) => {
            let start = map
                .get("start")
                .and_then(Value::as_str)
                .and_then(parse_date_range)
                .map(|(s, _)| s);
            let end = map
                .get("end")
                .and_then(Value::as_str)
                .and_then(parse_date_range)
                .map(|(_, e)| e);
            match (start, end) {
                (Some(s), Some(e)) => Some((s, e)),
                (Some(s), None) => Some((s, s + Duration::days(36500))),
                (None, Some(e)) => Some((e - Duration::days(36500), e)),
                (None, None) => None,
            }
        }
        _ => None,
    }
}

fn match_date(element: &Value, value: &ParsedValue) -> bool {
    let Some((param_start, param_end)) = parse_date_range(&value.raw) else {
        return false;
    };
    let Some((el_start, el_end)) = element_date_range(element) else {
        return false;
    };

    let contained = param_start <= el_start && el_end <= param_end;
    match value.comparator {
        SearchComparator::Eq => contained,
        SearchComparator::Ne => !contained,
        SearchComparator::Lt => el_start < param_start,
        SearchComparator::Gt => el_end > param_end,
        SearchComparator::Le => contained || el_start < param_start,
        SearchComparator::Ge => contained || el_end > param_end,
        SearchComparator::Sa => el_start >= param_end,
        SearchComparator::Eb => el_end <= param_start,
        SearchComparator::Ap => {
            // Within ±10 % of the distance between the value and now.
            let mid: OffsetDateTime = param_start + (param_end - param_start) / 2;
            let now = OffsetDateTime::now_utc();
            let tolerance = (now - mid).abs() / 10;
            (el_start - mid).abs() <= tolerance
        }
    }
}

// ---------------------------------------------------------------------------
// number / quantity

fn element_f64(element: &Value) -> Option<f64> {
    match element {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn compare_f64(actual: f64, comparator: SearchComparator, expected: f64) -> bool {
    let epsilon = 1e-9 * expected.abs().max(1.0);
    match comparator {
        SearchComparator::Eq => (actual - expected).abs() <= epsilon,
        SearchComparator::Ne => (actual - expected).abs() > epsilon,
        SearchComparator::Gt | SearchComparator::Sa => actual > expected,
        SearchComparator::Lt | SearchComparator::Eb => actual < expected,
        SearchComparator::Ge => actual >= expected - epsilon,
        SearchComparator::Le => actual <= expected + epsilon,
        SearchComparator::Ap => (actual - expected).abs() <= 0.1 * expected.abs().max(f64::MIN_POSITIVE),
    }
}

fn match_number(element: &Value, value: &ParsedValue) -> bool {
    let (Some(actual), Ok(expected)) = (element_f64(element), value.raw.parse::<f64>()) else {
        return false;
    };
    compare_f64(actual, value.comparator, expected)
}

fn match_quantity(element: &Value, value: &ParsedValue) -> bool {
    // value[|system[|code]]
    let parts: Vec<&str> = value.raw.split('|').collect();
    let Ok(expected) = parts[0].parse::<f64>() else {
        return false;
    };
    let (want_system, want_code) = match parts.len() {
        1 => (None, None),
        2 => (None, Some(parts[1])),
        _ => (
            if parts[1].is_empty() { None } else { Some(parts[1]) },
            if parts[2].is_empty() { None } else { Some(parts[2]) },
        ),
    };

    let Some(map) = element.as_object() else {
        return false;
    };
    let Some(actual) = map.get("value").and_then(element_f64) else {
        return false;
    };

    if let Some(system) = want_system
        && map.get("system").and_then(Value::as_str) != Some(system)
    {
        return false;
    }
    if let Some(code) = want_code {
        let code_field = map.get("code").and_then(Value::as_str);
        let unit_field = map.get("unit").and_then(Value::as_str);
        if code_field != Some(code) && unit_field != Some(code) {
            return false;
        }
    }
    compare_f64(actual, value.comparator, expected)
}

// ---------------------------------------------------------------------------
// uri

fn match_uri(element: &Value, value: &ParsedValue, modifier: Option<&SearchModifier>) -> bool {
    let Some(actual) = element.as_str() else {
        return false;
    };
    match modifier {
        Some(SearchModifier::Below) => actual.starts_with(&value.raw),
        Some(SearchModifier::Above) => value.raw.starts_with(actual),
        _ => actual == value.raw,
    }
}

// ---------------------------------------------------------------------------
// composite

fn match_composite(
    def: &SearchParamDef,
    element: &Value,
    value: &ParsedValue,
    parameter: &ParsedSearchParameter,
    ctx: &SearchContext<'_>,
) -> bool {
    if def.components.is_empty() {
        return false;
    }
    let parts: Vec<&str> = value.raw.split('$').collect();
    if parts.len() != def.components.len() {
        return false;
    }

    def.components.iter().zip(parts.iter()).enumerate().all(
        |(index, (component, part))| {
            let key = format!("{}.{}#{}", ctx.type_name, parameter.name, index);
            let Ok(expr) = ctx.cache.get_or_compile(&key, &component.expression) else {
                return false;
            };
            let sub_value = ParsedValue::new(*part);
            let sub_def = SearchParamDef::new(
                format!("{}#{}", parameter.name, index),
                component.param_type,
                component.expression.clone(),
            );
            expr.evaluate(element, ctx.eval)
                .iter()
                .any(|sub| value_matches(&sub_def, sub, &sub_value, parameter, ctx))
        },
    )
}

//! Parse topic and subscription resources into their executable forms.

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{
    ChannelCode, CompiledQueryTrigger, CompiledTopic, CompiledTrigger, ContentLevel,
    NotificationShape, ParsedSubscription, QueryResultBehavior, SubscriptionStatus, TopicStatus,
    TriggerInteraction,
};
use emberfhir_core::{PathExpression, Resource};
use emberfhir_search::{ParsedQuery, ParsedSearchParameter, SearchParamRegistry};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use url::form_urlencoded;

/// Hands out the per-type search parameter registries the compiler needs
/// for query-shape triggers and subscriber filters. Implemented by the
/// tenant engine.
pub trait RegistrySource: Send + Sync {
    fn registry_for(&self, type_name: &str) -> Option<Arc<SearchParamRegistry>>;
}

/// True for resources that carry a topic definition: a SubscriptionTopic,
/// or a Basic wrapper tagged with the SubscriptionTopic code.
pub fn is_topic_resource(resource: &Resource) -> bool {
    match resource.type_name() {
        "SubscriptionTopic" => true,
        "Basic" => resource
            .field("code")
            .and_then(|c| c.get("coding"))
            .and_then(Value::as_array)
            .map(|codings| {
                codings
                    .iter()
                    .any(|c| c.get("code").and_then(Value::as_str) == Some("SubscriptionTopic"))
            })
            .unwrap_or(false),
        _ => false,
    }
}

/// Compile a topic resource. Trigger fields are read duck-typed off the
/// tree, so a Basic wrapper carrying the same members parses identically.
pub fn parse_topic(
    resource: &Resource,
    registries: &dyn RegistrySource,
) -> SubscriptionResult<CompiledTopic> {
    let json = resource.as_json();

    let id = resource
        .id()
        .ok_or_else(|| SubscriptionError::invalid_topic("topic is missing an id"))?
        .to_string();
    let url = resource
        .canonical_url()
        .ok_or_else(|| SubscriptionError::invalid_topic("topic is missing a canonical url"))?
        .to_string();

    let title = json
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string);
    let status = json
        .get("status")
        .and_then(Value::as_str)
        .map(TopicStatus::from)
        .unwrap_or_default();

    let mut triggers: HashMap<String, Vec<CompiledTrigger>> = HashMap::new();
    if let Some(raw_triggers) = json.get("resourceTrigger").and_then(Value::as_array) {
        for raw in raw_triggers {
            let Some(resource_type) = raw.get("resource").and_then(Value::as_str) else {
                continue;
            };
            // Type names may arrive as full StructureDefinition URLs.
            let resource_type = resource_type
                .rsplit('/')
                .next()
                .unwrap_or(resource_type)
                .to_string();

            let trigger = compile_trigger(raw, &resource_type, registries)?;
            triggers.entry(resource_type).or_default().push(trigger);
        }
    }

    let mut shapes = HashMap::new();
    if let Some(raw_shapes) = json.get("notificationShape").and_then(Value::as_array) {
        for raw in raw_shapes {
            let Some(resource_type) = raw.get("resource").and_then(Value::as_str) else {
                continue;
            };
            shapes.insert(
                resource_type.to_string(),
                NotificationShape {
                    includes: string_list(raw.get("include")),
                    rev_includes: string_list(raw.get("revInclude")),
                },
            );
        }
    }

    Ok(CompiledTopic {
        id,
        url,
        title,
        status,
        triggers,
        shapes,
    })
}

fn compile_trigger(
    raw: &Value,
    resource_type: &str,
    registries: &dyn RegistrySource,
) -> SubscriptionResult<CompiledTrigger> {
    let interactions: Vec<TriggerInteraction> = raw
        .get("supportedInteraction")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(TriggerInteraction::from)
                .collect()
        })
        .unwrap_or_else(|| {
            vec![
                TriggerInteraction::Create,
                TriggerInteraction::Update,
                TriggerInteraction::Delete,
            ]
        });

    let path_criteria = match raw.get("fhirPathCriteria").and_then(Value::as_str) {
        Some(expression) => Some(Arc::new(PathExpression::compile(expression).map_err(
            |e| SubscriptionError::invalid_topic(format!("bad fhirPathCriteria: {e}")),
        )?)),
        None => None,
    };

    let query_criteria = match raw.get("queryCriteria") {
        Some(qc) => {
            let registry = registries
                .registry_for(resource_type)
                .unwrap_or_else(|| Arc::new(SearchParamRegistry::new()));
            Some(CompiledQueryTrigger {
                previous: parse_shape_query(qc.get("previous"), &registry),
                result_for_create: qc
                    .get("resultForCreate")
                    .and_then(Value::as_str)
                    .map(QueryResultBehavior::from)
                    .unwrap_or_default(),
                current: parse_shape_query(qc.get("current"), &registry),
                result_for_delete: qc
                    .get("resultForDelete")
                    .and_then(Value::as_str)
                    .map(QueryResultBehavior::from)
                    .unwrap_or_default(),
                require_both: qc
                    .get("requireBoth")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        }
        None => None,
    };

    Ok(CompiledTrigger {
        interactions,
        path_criteria,
        query_criteria,
        description: raw
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn parse_shape_query(
    value: Option<&Value>,
    registry: &SearchParamRegistry,
) -> Vec<ParsedSearchParameter> {
    let Some(query) = value.and_then(Value::as_str) else {
        return Vec::new();
    };
    ParsedQuery::parse(query, registry).predicates()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a Subscription resource into its immutable snapshot.
///
/// Both channel shapes are accepted: the R4 nested `channel` object and
/// the flattened R4B/R5 `channelType` + `endpoint` members.
pub fn parse_subscription(
    resource: &Resource,
    registries: &dyn RegistrySource,
) -> SubscriptionResult<ParsedSubscription> {
    let json = resource.as_json();

    let id = resource
        .id()
        .ok_or_else(|| SubscriptionError::invalid_subscription("subscription is missing an id"))?
        .to_string();

    let topic_url = json
        .get("topic")
        .and_then(Value::as_str)
        .or_else(|| json.get("criteria").and_then(Value::as_str))
        .ok_or_else(|| {
            SubscriptionError::invalid_subscription("subscription names no topic url")
        })?
        .to_string();

    let status = json
        .get("status")
        .and_then(Value::as_str)
        .map(SubscriptionStatus::from)
        .unwrap_or_default();

    let mut headers: IndexMap<String, Vec<String>> = IndexMap::new();
    let channel;
    let endpoint;
    let mut content_type = "application/fhir+json".to_string();
    let mut content = ContentLevel::default();
    let mut heartbeat_seconds = 0u64;

    if let Some(nested) = json.get("channel") {
        // R4 shape
        channel = nested
            .get("type")
            .and_then(Value::as_str)
            .map(ChannelCode::parse)
            .ok_or_else(|| {
                SubscriptionError::invalid_subscription("subscription channel has no type")
            })?;
        endpoint = nested
            .get("endpoint")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(payload) = nested.get("payload").and_then(Value::as_str) {
            content_type = payload.to_string();
        }
        if let Some(raw_headers) = nested.get("header").and_then(Value::as_array) {
            for header in raw_headers.iter().filter_map(Value::as_str) {
                if let Some((name, value)) = header.split_once(':') {
                    headers
                        .entry(name.trim().to_string())
                        .or_default()
                        .push(value.trim().to_string());
                }
            }
        }
    } else {
        // R4B/R5 shape
        let channel_type = json
            .get("channelType")
            .ok_or_else(|| {
                SubscriptionError::invalid_subscription("subscription has no channel type")
            })?;
        let code = channel_type
            .get("code")
            .and_then(Value::as_str)
            .or_else(|| channel_type.as_str())
            .ok_or_else(|| {
                SubscriptionError::invalid_subscription("subscription channel type has no code")
            })?;
        channel = ChannelCode::parse(code);
        endpoint = json
            .get("endpoint")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(ct) = json.get("contentType").and_then(Value::as_str) {
            content_type = ct.to_string();
        }
        if let Some(level) = json.get("content").and_then(Value::as_str) {
            content = ContentLevel::from(level);
        }
        if let Some(heartbeat) = json.get("heartbeatPeriod").and_then(Value::as_u64) {
            heartbeat_seconds = heartbeat;
        }
        if let Some(parameters) = json.get("parameter").and_then(Value::as_array) {
            for parameter in parameters {
                let (Some(name), Some(value)) = (
                    parameter.get("name").and_then(Value::as_str),
                    parameter.get("value").and_then(Value::as_str),
                ) else {
                    continue;
                };
                headers
                    .entry(name.to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
    }

    let mut filters_by_type: HashMap<String, Vec<ParsedSearchParameter>> = HashMap::new();
    if let Some(filters) = json.get("filterBy").and_then(Value::as_array) {
        for filter in filters {
            let Some(parameter) = filter.get("filterParameter").and_then(Value::as_str) else {
                continue;
            };
            let Some(value) = filter.get("value").and_then(Value::as_str) else {
                continue;
            };
            let resource_type = filter
                .get("resourceType")
                .or_else(|| filter.get("resource"))
                .and_then(Value::as_str)
                .unwrap_or("*")
                .to_string();

            // Reassemble the filter as a query fragment so modifiers and
            // comparators get the same treatment as search input.
            let mut key = parameter.to_string();
            if let Some(modifier) = filter.get("modifier").and_then(Value::as_str) {
                key = format!("{key}:{modifier}");
            }
            let mut raw_value = value.to_string();
            if let Some(comparator) = filter.get("comparator").and_then(Value::as_str)
                && comparator != "eq"
            {
                raw_value = format!("{comparator}{raw_value}");
            }

            let registry = registries
                .registry_for(&resource_type)
                .unwrap_or_else(|| Arc::new(SearchParamRegistry::new()));
            let query = format!(
                "{}={}",
                form_urlencoded::byte_serialize(key.as_bytes()).collect::<String>(),
                form_urlencoded::byte_serialize(raw_value.as_bytes()).collect::<String>()
            );
            let parsed = ParsedQuery::parse(&query, &registry);
            filters_by_type
                .entry(resource_type)
                .or_default()
                .extend(parsed.parameters.into_iter());
        }
    }

    Ok(ParsedSubscription {
        id,
        topic_url,
        channel,
        endpoint,
        content_type,
        content,
        heartbeat_seconds,
        status,
        headers,
        filters_by_type,
    })
}

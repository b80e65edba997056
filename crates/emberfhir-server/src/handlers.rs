//! axum handlers: tenant resolution, content negotiation, the SMART gate
//! and rendering of engine responses.

use crate::formats::{self, ServerCodec, apply_elements, apply_summary};
use crate::server::AppState;
use crate::smart;
use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use emberfhir_core::{
    OperationOutcome, OperationResponse, Resource, StoreStatus, WireCodec, WireFormat,
};
use emberfhir_search::SummaryMode;
use emberfhir_store::TenantEngine;
use std::sync::Arc;
use std::time::SystemTime;

/// `Prefer` header values honored on writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Prefer {
    #[default]
    Representation,
    Minimal,
    OperationOutcome,
}

impl Prefer {
    fn from_headers(headers: &HeaderMap) -> Self {
        match headers.get("prefer").and_then(|v| v.to_str().ok()) {
            Some("return=minimal") => Self::Minimal,
            Some("return=OperationOutcome") => Self::OperationOutcome,
            _ => Self::Representation,
        }
    }
}

/// Per-request rendering options, resolved from headers and query.
struct RenderOptions {
    format: WireFormat,
    pretty: bool,
    summary: SummaryMode,
    elements: Vec<String>,
    prefer: Prefer,
}

impl RenderOptions {
    fn resolve(headers: &HeaderMap, query: &str) -> Result<Self, Response> {
        let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
        let format_param = query_param(query, "_format");
        let Some(format) = formats::negotiate(accept, format_param.as_deref()) else {
            return Err(outcome_response(
                StatusCode::NOT_ACCEPTABLE,
                WireFormat::Json,
                &OperationOutcome::error(
                    "not-supported",
                    format!("no supported format in Accept '{}'", accept.unwrap_or_default()),
                ),
            ));
        };
        let summary = query_param(query, "_summary")
            .and_then(|v| SummaryMode::parse(&v))
            .unwrap_or_default();
        let elements: Vec<String> = query_param(query, "_elements")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            format,
            pretty: query_param(query, "_pretty").as_deref() == Some("true"),
            summary,
            elements,
            prefer: Prefer::from_headers(headers),
        })
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ---------------------------------------------------------------------------
// response rendering

fn outcome_response(status: StatusCode, format: WireFormat, outcome: &OperationOutcome) -> Response {
    let codec = ServerCodec;
    let body = codec
        .serialize(format, &outcome.to_resource(), false)
        .unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, format.mime())
        .body(Body::from(body))
        .unwrap_or_default()
}

fn render(response: OperationResponse, options: &RenderOptions) -> Response {
    let status = StatusCode::from_u16(response.status.http_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    if let Some(tag) = &response.version_tag {
        builder = builder.header(header::ETAG, tag);
    }
    if let Some(instant) = &response.last_modified {
        let system_time = SystemTime::from(*instant.inner());
        builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(system_time));
    }
    if let Some(location) = &response.location {
        builder = builder.header(header::LOCATION, location);
    }

    // 204 and 304 carry no body.
    if matches!(response.status, StoreStatus::NoContent | StoreStatus::NotModified) {
        return builder.body(Body::empty()).unwrap_or_default();
    }

    let body_resource = if !response.is_success() {
        Some(response.outcome.to_resource())
    } else {
        match options.prefer {
            Prefer::Minimal => None,
            Prefer::OperationOutcome => Some(response.outcome.to_resource()),
            Prefer::Representation => response
                .resource
                .clone()
                .or_else(|| Some(response.outcome.to_resource())),
        }
    };

    let Some(resource) = body_resource else {
        return builder.body(Body::empty()).unwrap_or_default();
    };

    // Serialization filters apply to resources, not outcome documents.
    let filtered = if resource.type_name() == "OperationOutcome" {
        resource
    } else {
        let value = apply_summary(resource.as_json(), options.summary);
        let value = apply_elements(&value, &options.elements);
        Resource::new(value).unwrap_or(resource)
    };

    let codec = ServerCodec;
    match codec.serialize(options.format, &filtered, options.pretty) {
        Ok(body) => builder
            .header(header::CONTENT_TYPE, options.format.mime())
            .body(Body::from(body))
            .unwrap_or_default(),
        Err(e) => outcome_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            WireFormat::Json,
            &OperationOutcome::error("exception", e.to_string()),
        ),
    }
}

// ---------------------------------------------------------------------------
// tenant resolution and gates

fn resolve_tenant(
    state: &AppState,
    tenant: &str,
    headers: &HeaderMap,
    format: WireFormat,
    enforce_smart: bool,
) -> Result<Arc<TenantEngine>, Response> {
    let Some(engine) = state.manager.tenant(tenant) else {
        return Err(outcome_response(
            StatusCode::NOT_FOUND,
            format,
            &OperationOutcome::error("not-found", format!("tenant '{tenant}' is not known")),
        ));
    };
    if enforce_smart
        && engine.settings().smart_required
        && !smart::has_bearer_token(header_str(headers, "authorization"))
    {
        return Err(outcome_response(
            StatusCode::UNAUTHORIZED,
            format,
            &OperationOutcome::error(
                "security",
                format!("tenant '{tenant}' requires SMART authorization"),
            ),
        ));
    }
    Ok(engine)
}

fn parse_body(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
    response_format: WireFormat,
) -> Result<Resource, Response> {
    let content_type = header_str(headers, "content-type");
    let Some(format) = formats::body_format(content_type) else {
        return Err(outcome_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            response_format,
            &OperationOutcome::error(
                "not-supported",
                format!("media type '{}' is not supported", content_type.unwrap_or_default()),
            ),
        ));
    };
    state.codec.parse(format, body).map_err(|e| {
        outcome_response(
            StatusCode::BAD_REQUEST,
            response_format,
            &OperationOutcome::error("invalid", format!("body is not parseable: {e}")),
        )
    })
}

// ---------------------------------------------------------------------------
// handlers

pub async fn metadata(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    let options = match RenderOptions::resolve(&headers, &query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    // The capability document is readable without authorization.
    let engine = match resolve_tenant(&state, &tenant, &headers, options.format, false) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    let capability = engine.capabilities();
    render(
        OperationResponse::new(StoreStatus::Ok, OperationOutcome::info("capabilities"))
            .with_resource(capability),
        &options,
    )
}

pub async fn well_known(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> Response {
    let Some(engine) = state.manager.tenant(&tenant) else {
        return outcome_response(
            StatusCode::NOT_FOUND,
            WireFormat::Json,
            &OperationOutcome::error("not-found", format!("tenant '{tenant}' is not known")),
        );
    };
    let doc = smart::well_known_configuration(&engine.settings().base_url);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(doc.to_string()))
        .unwrap_or_default()
}

pub async fn system_bundle(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let query = query.unwrap_or_default();
    let options = match RenderOptions::resolve(&headers, &query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    let engine = match resolve_tenant(&state, &tenant, &headers, options.format, true) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    let bundle = match parse_body(&state, &headers, &body, options.format) {
        Ok(bundle) => bundle,
        Err(response) => return response,
    };
    if bundle.type_name() != "Bundle" {
        return outcome_response(
            StatusCode::BAD_REQUEST,
            options.format,
            &OperationOutcome::error("invalid", "the tenant root accepts Bundle payloads only"),
        );
    }
    render(engine.process_bundle(bundle), &options)
}

pub async fn system_search(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    run_system_search(&state, &tenant, &headers, &query).await
}

pub async fn system_search_post(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let combined = combine_query(query.unwrap_or_default(), &headers, &body);
    run_system_search(&state, &tenant, &headers, &combined).await
}

async fn run_system_search(
    state: &AppState,
    tenant: &str,
    headers: &HeaderMap,
    query: &str,
) -> Response {
    let options = match RenderOptions::resolve(headers, query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    let engine = match resolve_tenant(state, tenant, headers, options.format, true) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    render(engine.system_search(query), &options)
}

pub async fn type_search(
    State(state): State<Arc<AppState>>,
    Path((tenant, type_name)): Path<(String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    run_type_search(&state, &tenant, &type_name, &headers, &query).await
}

pub async fn type_search_post(
    State(state): State<Arc<AppState>>,
    Path((tenant, type_name)): Path<(String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let combined = combine_query(query.unwrap_or_default(), &headers, &body);
    run_type_search(&state, &tenant, &type_name, &headers, &combined).await
}

async fn run_type_search(
    state: &AppState,
    tenant: &str,
    type_name: &str,
    headers: &HeaderMap,
    query: &str,
) -> Response {
    let options = match RenderOptions::resolve(headers, query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    let engine = match resolve_tenant(state, tenant, headers, options.format, true) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    if let Some(operation) = type_name.strip_prefix('$') {
        return render(not_implemented_operation(operation), &options);
    }
    render(engine.type_search(type_name, query), &options)
}

pub async fn type_create(
    State(state): State<Arc<AppState>>,
    Path((tenant, type_name)): Path<(String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let query = query.unwrap_or_default();
    let options = match RenderOptions::resolve(&headers, &query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    let engine = match resolve_tenant(&state, &tenant, &headers, options.format, true) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    if let Some(operation) = type_name.strip_prefix('$') {
        return render(not_implemented_operation(operation), &options);
    }
    let resource = match parse_body(&state, &headers, &body, options.format) {
        Ok(resource) => resource,
        Err(response) => return response,
    };

    // If-None-Exist: conditional create against the given query.
    if let Some(condition) = header_str(&headers, "if-none-exist") {
        let existing = engine.type_search(&type_name, condition);
        if let Some(bundle) = &existing.resource
            && let Some(first) = bundle.as_json().pointer("/entry/0/resource")
        {
            let resource = Resource::new(first.clone()).ok();
            let mut response = OperationResponse::new(
                StoreStatus::Ok,
                OperationOutcome::info("a matching resource already exists"),
            );
            if let Some(resource) = resource {
                if let Some(version) = resource.version_id() {
                    response = response.with_version(version);
                }
                response = response.with_resource(resource);
            }
            return render(response, &options);
        }
    }

    render(engine.create(&type_name, resource, true), &options)
}

pub async fn instance_read(
    State(state): State<Arc<AppState>>,
    Path((tenant, type_name, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    let options = match RenderOptions::resolve(&headers, &query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    let engine = match resolve_tenant(&state, &tenant, &headers, options.format, true) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    let response = engine.read(&type_name, &id);

    // Conditional read headers.
    if response.is_success() {
        if let (Some(tag), Some(if_none_match)) = (
            response.version_tag.as_deref(),
            header_str(&headers, "if-none-match"),
        ) && if_none_match.trim() == tag
        {
            return render(
                OperationResponse::new(StoreStatus::NotModified, OperationOutcome::info("not modified")),
                &options,
            );
        }
        if let (Some(last_modified), Some(if_modified_since)) = (
            response.last_modified.as_ref(),
            header_str(&headers, "if-modified-since"),
        ) && let Ok(since) = httpdate::parse_http_date(if_modified_since)
            && SystemTime::from(*last_modified.inner()) <= since
        {
            return render(
                OperationResponse::new(StoreStatus::NotModified, OperationOutcome::info("not modified")),
                &options,
            );
        }
    }

    render(response, &options)
}

pub async fn instance_update(
    State(state): State<Arc<AppState>>,
    Path((tenant, type_name, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let query = query.unwrap_or_default();
    let options = match RenderOptions::resolve(&headers, &query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    let engine = match resolve_tenant(&state, &tenant, &headers, options.format, true) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    let resource = match parse_body(&state, &headers, &body, options.format) {
        Ok(resource) => resource,
        Err(response) => return response,
    };
    let response = engine.update(
        &type_name,
        &id,
        resource,
        header_str(&headers, "if-match"),
        header_str(&headers, "if-none-match"),
    );
    render(response, &options)
}

pub async fn instance_delete(
    State(state): State<Arc<AppState>>,
    Path((tenant, type_name, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    let options = match RenderOptions::resolve(&headers, &query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    let engine = match resolve_tenant(&state, &tenant, &headers, options.format, true) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    render(engine.delete(&type_name, &id), &options)
}

pub async fn instance_operation(
    State(state): State<Arc<AppState>>,
    Path((tenant, type_name, id, operation)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    let options = match RenderOptions::resolve(&headers, &query) {
        Ok(options) => options,
        Err(response) => return response,
    };
    let engine = match resolve_tenant(&state, &tenant, &headers, options.format, true) {
        Ok(engine) => engine,
        Err(response) => return response,
    };
    let Some(operation) = operation.strip_prefix('$') else {
        return outcome_response(
            StatusCode::NOT_FOUND,
            options.format,
            &OperationOutcome::error("not-found", format!("no route for '{operation}'")),
        );
    };
    // Instance operations require the instance to exist.
    let read = engine.read(&type_name, &id);
    if !read.is_success() {
        return render(read, &options);
    }
    render(not_implemented_operation(operation), &options)
}

fn not_implemented_operation(operation: &str) -> OperationResponse {
    OperationResponse::error(
        StoreStatus::NotImplemented,
        format!("operation ${operation} is not implemented"),
    )
}

/// POST-based searches accept form-encoded parameters in the body; merge
/// them with the URL query.
fn combine_query(query: String, headers: &HeaderMap, body: &Bytes) -> String {
    let is_form = header_str(headers, "content-type")
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if !is_form || body.is_empty() {
        return query;
    }
    let body_query = String::from_utf8_lossy(body).into_owned();
    if query.is_empty() {
        body_query
    } else {
        format!("{query}&{body_query}")
    }
}

//! The SMART authorization gate and discovery document.
//!
//! Full token introspection is an external collaborator; the gate only
//! requires a bearer credential to be present when the tenant demands one.

use serde_json::{Value, json};

/// Minimal SMART discovery document for a tenant base URL.
pub fn well_known_configuration(base_url: &str) -> Value {
    let base = base_url.trim_end_matches('/');
    json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/auth/authorize"),
        "token_endpoint": format!("{base}/auth/token"),
        "capabilities": [
            "launch-standalone",
            "client-public",
            "client-confidential-symmetric",
            "permission-v2",
        ],
        "response_types_supported": ["code"],
        "code_challenge_methods_supported": ["S256"],
    })
}

/// True when the Authorization header carries a non-empty bearer token.
pub fn has_bearer_token(authorization: Option<&str>) -> bool {
    authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| !token.trim().is_empty())
        .unwrap_or(false)
}

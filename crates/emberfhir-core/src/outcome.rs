use crate::resource::Resource;
use crate::time::FhirInstant;
use serde_json::json;

/// Status of a store or engine operation, mapped onto HTTP at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Ok,
    Created,
    NoContent,
    NotModified,
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    PreconditionFailed,
    UnsupportedMediaType,
    UnprocessableEntity,
    InternalError,
    NotImplemented,
}

impl StoreStatus {
    pub fn http_code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::NoContent => 204,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::UnsupportedMediaType => 415,
            Self::UnprocessableEntity => 422,
            Self::InternalError => 500,
            Self::NotImplemented => 501,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Ok | Self::Created | Self::NoContent | Self::NotModified
        )
    }

    /// Issue code used in the outcome document for this status.
    fn issue_code(&self) -> &'static str {
        match self {
            Self::Ok | Self::Created | Self::NoContent | Self::NotModified => "informational",
            Self::BadRequest => "invalid",
            Self::Unauthorized => "security",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::PreconditionFailed => "conflict",
            Self::UnsupportedMediaType => "not-supported",
            Self::UnprocessableEntity => "processing",
            Self::InternalError => "exception",
            Self::NotImplemented => "not-supported",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "information",
        }
    }
}

#[derive(Debug, Clone)]
struct Issue {
    severity: IssueSeverity,
    code: String,
    diagnostics: String,
}

/// Human-readable diagnostic attached to every operation response.
#[derive(Debug, Clone, Default)]
pub struct OperationOutcome {
    issues: Vec<Issue>,
}

impl OperationOutcome {
    pub fn error(code: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        let mut outcome = Self::default();
        outcome.push(IssueSeverity::Error, code, diagnostics);
        outcome
    }

    pub fn info(diagnostics: impl Into<String>) -> Self {
        let mut outcome = Self::default();
        outcome.push(IssueSeverity::Information, "informational", diagnostics);
        outcome
    }

    pub fn push(
        &mut self,
        severity: IssueSeverity,
        code: impl Into<String>,
        diagnostics: impl Into<String>,
    ) {
        self.issues.push(Issue {
            severity,
            code: code.into(),
            diagnostics: diagnostics.into(),
        });
    }

    /// First diagnostic line, for logs and assertions.
    pub fn diagnostics(&self) -> &str {
        self.issues
            .first()
            .map(|i| i.diagnostics.as_str())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Render as an OperationOutcome resource tree.
    pub fn to_resource(&self) -> Resource {
        let issues: Vec<_> = self
            .issues
            .iter()
            .map(|i| {
                json!({
                    "severity": i.severity.as_str(),
                    "code": i.code,
                    "diagnostics": i.diagnostics,
                })
            })
            .collect();
        Resource::new(json!({
            "resourceType": "OperationOutcome",
            "issue": issues,
        }))
        .expect("outcome tree always carries a resourceType")
    }
}

/// Weak validator tag for a version id, `W/"<versionId>"`.
pub fn weak_etag(version_id: &str) -> String {
    format!("W/\"{version_id}\"")
}

/// The uniform return value of every public store and engine operation.
///
/// Errors never unwind out of an operation; they arrive here as a status
/// plus a populated outcome.
#[derive(Debug, Clone)]
pub struct OperationResponse {
    pub resource: Option<Resource>,
    pub outcome: OperationOutcome,
    pub status: StoreStatus,
    pub version_tag: Option<String>,
    pub last_modified: Option<FhirInstant>,
    pub location: Option<String>,
}

impl OperationResponse {
    pub fn new(status: StoreStatus, outcome: OperationOutcome) -> Self {
        Self {
            resource: None,
            outcome,
            status,
            version_tag: None,
            last_modified: None,
            location: None,
        }
    }

    /// Failure response; the issue code is derived from the status.
    pub fn error(status: StoreStatus, diagnostics: impl Into<String>) -> Self {
        Self::new(status, OperationOutcome::error(status.issue_code(), diagnostics))
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_version(mut self, version_id: &str) -> Self {
        self.version_tag = Some(weak_etag(version_id));
        self
    }

    pub fn with_last_modified(mut self, instant: FhirInstant) -> Self {
        self.last_modified = Some(instant);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

use thiserror::Error;

/// Core error types shared across the EmberFHIR crates.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Invalid instant: {0}")]
    InvalidInstant(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Invalid path expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("Unsupported wire format: {0}")]
    UnsupportedFormat(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource(message.into())
    }

    pub fn invalid_instant(message: impl Into<String>) -> Self {
        Self::InvalidInstant(message.into())
    }

    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidReference(message.into())
    }

    pub fn invalid_expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidExpression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Convenience result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

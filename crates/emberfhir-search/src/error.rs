use thiserror::Error;

/// Errors raised while parsing queries and parameter definitions.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Invalid include directive: {0}")]
    InvalidInclude(String),

    #[error("Invalid value for {param}: {message}")]
    InvalidValue { param: String, message: String },

    #[error("Invalid search parameter definition: {0}")]
    InvalidDefinition(String),

    #[error(transparent)]
    Expression(#[from] emberfhir_core::CoreError),
}

impl SearchError {
    pub fn invalid_value(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            param: param.into(),
            message: message.into(),
        }
    }

    pub fn invalid_definition(message: impl Into<String>) -> Self {
        Self::InvalidDefinition(message.into())
    }
}

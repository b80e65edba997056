use thiserror::Error;

/// Errors raised by topic parsing, evaluation and delivery.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid subscription topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl SubscriptionError {
    pub fn invalid_topic(message: impl Into<String>) -> Self {
        Self::InvalidTopic(message.into())
    }

    pub fn invalid_subscription(message: impl Into<String>) -> Self {
        Self::InvalidSubscription(message.into())
    }
}

pub type SubscriptionResult<T> = std::result::Result<T, SubscriptionError>;

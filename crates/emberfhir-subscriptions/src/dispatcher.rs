//! The dispatcher seam between evaluation and the channel transports.

use crate::types::{ChannelCode, NotificationType};
use async_trait::async_trait;

/// One outbound notification, fully rendered.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub channel: ChannelCode,
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub content_type: String,
    pub body: String,
    pub subscription_id: String,
    pub event_type: NotificationType,
}

/// Result of one send attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub success: bool,
    pub http_status: Option<u16>,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn success(http_status: u16) -> Self {
        Self {
            success: true,
            http_status: Some(http_status),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            http_status: None,
            error: Some(error.into()),
        }
    }

    pub fn http_failure(http_status: u16, error: impl Into<String>) -> Self {
        Self {
            success: false,
            http_status: Some(http_status),
            error: Some(error.into()),
        }
    }

    /// Transport-level failures (no HTTP status at all) are the only ones
    /// worth a retry.
    pub fn is_transport_failure(&self) -> bool {
        !self.success && self.http_status.is_none()
    }
}

/// Sends notifications over the configured channel transports.
///
/// Implementations live at the server edge; the core only knows this seam.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, request: NotificationRequest) -> DeliveryResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_constructors() {
        let ok = DeliveryResult::success(202);
        assert!(ok.success);
        assert_eq!(ok.http_status, Some(202));
        assert!(!ok.is_transport_failure());

        let transport = DeliveryResult::failure("connection refused");
        assert!(transport.is_transport_failure());

        let http = DeliveryResult::http_failure(500, "server error");
        assert!(!http.is_transport_failure());
        assert_eq!(http.http_status, Some(500));
    }
}

//! REST-hook transport: POST the notification bundle to the endpoint.

use emberfhir_subscriptions::{DeliveryResult, NotificationRequest};
use std::time::Duration;

/// Statuses the subscriber may answer with for a delivered notification.
const ACCEPTED_STATUSES: &[u16] = &[200, 202, 204];

pub struct RestHookChannel {
    client: reqwest::Client,
}

impl RestHookChannel {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn deliver(&self, request: &NotificationRequest) -> DeliveryResult {
        if request.endpoint.is_empty() {
            return DeliveryResult::failure("subscription has no endpoint");
        }

        let mut outbound = self
            .client
            .post(&request.endpoint)
            .header(reqwest::header::CONTENT_TYPE, request.content_type.as_str());
        for (name, value) in &request.headers {
            outbound = outbound.header(name.as_str(), value.as_str());
        }

        match outbound.body(request.body.clone()).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if ACCEPTED_STATUSES.contains(&status) {
                    tracing::debug!(
                        subscription_id = %request.subscription_id,
                        endpoint = %request.endpoint,
                        status,
                        "rest-hook delivered"
                    );
                    DeliveryResult::success(status)
                } else {
                    let body = response.text().await.unwrap_or_default();
                    DeliveryResult::http_failure(status, truncate(&body, 200))
                }
            }
            Err(e) => DeliveryResult::failure(e.to_string()),
        }
    }
}

impl Default for RestHookChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberfhir_subscriptions::{ChannelCode, NotificationType};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(endpoint: String) -> NotificationRequest {
        NotificationRequest {
            channel: ChannelCode::RestHook,
            endpoint,
            headers: vec![("X-Custom".into(), "yes".into())],
            content_type: "application/fhir+json".into(),
            body: "{\"resourceType\":\"Bundle\"}".into(),
            subscription_id: "sub1".into(),
            event_type: NotificationType::EventNotification,
        }
    }

    #[tokio::test]
    async fn posts_bundle_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/fhir+json"))
            .and(header("X-Custom", "yes"))
            .and(body_string_contains("Bundle"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = RestHookChannel::new();
        let result = channel.deliver(&request(format!("{}/hook", server.uri()))).await;
        assert!(result.success);
        assert_eq!(result.http_status, Some(200));
    }

    #[tokio::test]
    async fn accepts_202_and_204() {
        for status in [202u16, 204] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
            let channel = RestHookChannel::new();
            let result = channel.deliver(&request(server.uri())).await;
            assert!(result.success, "status {status} should be accepted");
        }
    }

    #[tokio::test]
    async fn other_statuses_are_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let channel = RestHookChannel::new();
        let result = channel.deliver(&request(server.uri())).await;
        assert!(!result.success);
        assert_eq!(result.http_status, Some(500));
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn missing_endpoint_is_rejected() {
        let channel = RestHookChannel::new();
        let result = channel.deliver(&request(String::new())).await;
        assert!(!result.success);
        assert!(result.http_status.is_none());
    }
}

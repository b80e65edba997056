//! Chat-webhook transport.
//!
//! Endpoint specs select the targets: `stream:General:fhir-events` posts to
//! a stream topic, `user:alice@example.org` sends a direct message.
//! Multiple targets are comma-separated. Clients are pooled per
//! site/identity pair.

use crate::config::ChatConfig;
use dashmap::DashMap;
use emberfhir_subscriptions::{DeliveryResult, NotificationRequest};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatTarget {
    Stream { stream: String, topic: String },
    User { email: String },
}

fn parse_targets(endpoint: &str) -> Vec<ChatTarget> {
    endpoint
        .split(',')
        .map(str::trim)
        .filter_map(|spec| {
            let mut parts = spec.splitn(3, ':');
            match parts.next()? {
                "stream" => {
                    let stream = parts.next()?.to_string();
                    let topic = parts.next().unwrap_or("notifications").to_string();
                    Some(ChatTarget::Stream { stream, topic })
                }
                "user" => Some(ChatTarget::User {
                    email: parts.next()?.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

struct ChatClient {
    site: String,
    identity: String,
    key: String,
    http: reqwest::Client,
}

impl ChatClient {
    fn new(site: &str, identity: &str, key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            site: site.trim_end_matches('/').to_string(),
            identity: identity.to_string(),
            key: key.to_string(),
            http,
        }
    }

    async fn send_markdown(&self, target: &ChatTarget, content: &str) -> DeliveryResult {
        let url = format!("{}/api/v1/messages", self.site);
        let mut form: Vec<(&str, String)> = vec![("content", content.to_string())];
        match target {
            ChatTarget::Stream { stream, topic } => {
                form.push(("type", "stream".into()));
                form.push(("to", stream.clone()));
                form.push(("topic", topic.clone()));
            }
            ChatTarget::User { email } => {
                form.push(("type", "direct".into()));
                form.push(("to", email.clone()));
            }
        }

        match self
            .http
            .post(&url)
            .basic_auth(&self.identity, Some(&self.key))
            .form(&form)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    DeliveryResult::success(status)
                } else {
                    DeliveryResult::http_failure(status, "chat webhook rejected the message")
                }
            }
            Err(e) => DeliveryResult::failure(e.to_string()),
        }
    }
}

/// Pool of chat clients keyed by site and identity.
pub struct ChatClientPool {
    clients: DashMap<String, Arc<ChatClient>>,
}

impl ChatClientPool {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    fn client(&self, config: &ChatConfig) -> Option<Arc<ChatClient>> {
        let (site, identity, key) = (
            config.site.as_deref()?,
            config.identity.as_deref()?,
            config.key.as_deref()?,
        );
        let pool_key = format!("{site}|{identity}");
        Some(
            self.clients
                .entry(pool_key)
                .or_insert_with(|| Arc::new(ChatClient::new(site, identity, key)))
                .clone(),
        )
    }

    pub async fn deliver(&self, config: &ChatConfig, request: &NotificationRequest) -> DeliveryResult {
        let Some(client) = self.client(config) else {
            return DeliveryResult::failure("chat webhook credentials are incomplete");
        };
        let targets = parse_targets(&request.endpoint);
        if targets.is_empty() {
            return DeliveryResult::failure(format!(
                "endpoint '{}' names no chat targets",
                request.endpoint
            ));
        }

        let content = render_markdown(request);
        let mut last = DeliveryResult::failure("no targets attempted");
        for target in &targets {
            last = client.send_markdown(target, &content).await;
            if !last.success {
                return last;
            }
        }
        last
    }
}

impl Default for ChatClientPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Compact markdown rendering of a notification bundle.
fn render_markdown(request: &NotificationRequest) -> String {
    let mut lines = vec![format!(
        "**Subscription {}**: {}",
        request.subscription_id,
        request.event_type.as_str()
    )];
    if let Ok(bundle) = serde_json::from_str::<Value>(&request.body)
        && let Some(entries) = bundle.get("entry").and_then(Value::as_array)
    {
        for entry in entries.iter().skip(1) {
            if let Some(reference) = entry
                .pointer("/resource/resourceType")
                .and_then(Value::as_str)
                .zip(entry.pointer("/resource/id").and_then(Value::as_str))
            {
                lines.push(format!("- `{}/{}`", reference.0, reference.1));
            }
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberfhir_subscriptions::{ChannelCode, NotificationType};

    #[test]
    fn target_parsing() {
        let targets = parse_targets("stream:General:fhir,user:alice@example.org");
        assert_eq!(
            targets,
            vec![
                ChatTarget::Stream {
                    stream: "General".into(),
                    topic: "fhir".into()
                },
                ChatTarget::User {
                    email: "alice@example.org".into()
                },
            ]
        );

        let defaulted = parse_targets("stream:General");
        assert_eq!(
            defaulted,
            vec![ChatTarget::Stream {
                stream: "General".into(),
                topic: "notifications".into()
            }]
        );

        assert!(parse_targets("http://example.org/hook").is_empty());
    }

    #[test]
    fn markdown_lists_bundle_resources() {
        let request = NotificationRequest {
            channel: ChannelCode::Zulip,
            endpoint: "stream:General".into(),
            headers: Vec::new(),
            content_type: "application/fhir+json".into(),
            body: serde_json::json!({
                "resourceType": "Bundle",
                "entry": [
                    {"resource": {"resourceType": "SubscriptionStatus"}},
                    {"resource": {"resourceType": "Encounter", "id": "e1"}}
                ]
            })
            .to_string(),
            subscription_id: "sub1".into(),
            event_type: NotificationType::EventNotification,
        };
        let text = render_markdown(&request);
        assert!(text.contains("**Subscription sub1**"));
        assert!(text.contains("`Encounter/e1`"));
    }

    #[tokio::test]
    async fn empty_targets_fail() {
        let pool = ChatClientPool::new();
        let config = ChatConfig {
            site: Some("https://chat.example.org".into()),
            identity: Some("bot@example.org".into()),
            key: Some("secret".into()),
        };
        let request = NotificationRequest {
            channel: ChannelCode::Zulip,
            endpoint: "http://not-a-chat-target".into(),
            headers: Vec::new(),
            content_type: "application/fhir+json".into(),
            body: "{}".into(),
            subscription_id: "sub1".into(),
            event_type: NotificationType::EventNotification,
        };
        let result = pool.deliver(&config, &request).await;
        assert!(!result.success);
    }
}

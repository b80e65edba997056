//! Notification channel transports.

pub mod chat;
pub mod rest_hook;

use crate::config::ChatConfig;
use async_trait::async_trait;
use chat::ChatClientPool;
use emberfhir_subscriptions::{
    ChannelCode, DeliveryResult, NotificationDispatcher, NotificationRequest,
};
use rest_hook::RestHookChannel;

/// Routes notifications to the transport for their channel code.
///
/// `email` and `websocket` are recognized channel codes with no transport;
/// sends over them fail and land in the subscription's error list.
pub struct ChannelDispatcher {
    rest_hook: RestHookChannel,
    chat: ChatClientPool,
    chat_config: Option<ChatConfig>,
}

impl ChannelDispatcher {
    pub fn new(chat_config: Option<ChatConfig>) -> Self {
        Self {
            rest_hook: RestHookChannel::new(),
            chat: ChatClientPool::new(),
            chat_config,
        }
    }
}

#[async_trait]
impl NotificationDispatcher for ChannelDispatcher {
    async fn send(&self, request: NotificationRequest) -> DeliveryResult {
        match &request.channel {
            ChannelCode::RestHook => self.rest_hook.deliver(&request).await,
            ChannelCode::Zulip => match &self.chat_config {
                Some(config) => self.chat.deliver(config, &request).await,
                None => DeliveryResult::failure("chat webhook credentials are not configured"),
            },
            ChannelCode::Email | ChannelCode::Websocket => DeliveryResult::failure(format!(
                "channel '{}' is not implemented",
                request.channel.as_str()
            )),
            ChannelCode::Other(code) => {
                DeliveryResult::failure(format!("unknown channel '{code}'"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberfhir_subscriptions::NotificationType;

    fn request(channel: ChannelCode) -> NotificationRequest {
        NotificationRequest {
            channel,
            endpoint: "http://example.org/x".into(),
            headers: Vec::new(),
            content_type: "application/fhir+json".into(),
            body: "{}".into(),
            subscription_id: "sub1".into(),
            event_type: NotificationType::EventNotification,
        }
    }

    #[tokio::test]
    async fn reserved_channels_report_unimplemented() {
        let dispatcher = ChannelDispatcher::new(None);
        let result = dispatcher.send(request(ChannelCode::Email)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not implemented"));

        let result = dispatcher.send(request(ChannelCode::Websocket)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn chat_without_credentials_fails_cleanly() {
        let dispatcher = ChannelDispatcher::new(None);
        let result = dispatcher.send(request(ChannelCode::Zulip)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("credentials"));
    }
}

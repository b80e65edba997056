//! The delivery worker: drains the evaluator's queue and applies error
//! accounting to each subscription.

use crate::dispatcher::{DeliveryResult, NotificationDispatcher};
use crate::evaluator::QueuedNotification;
use crate::types::{ERROR_STATUS_THRESHOLD, NotificationType, SubscriptionStatus};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// Drain the queue until every sender is gone. At-least-once: a transport
/// failure earns exactly one retry, then the failure is recorded and the
/// event dropped.
pub async fn run_delivery_worker(
    mut receiver: mpsc::UnboundedReceiver<QueuedNotification>,
    dispatcher: Arc<dyn NotificationDispatcher>,
) {
    while let Some(queued) = receiver.recv().await {
        let mut result = dispatcher.send(queued.request.clone()).await;
        if result.is_transport_failure() {
            result = dispatcher.send(queued.request.clone()).await;
        }
        apply_result(&queued, &result);
    }
    tracing::debug!("delivery queue closed, worker exiting");
}

/// Update subscription state from one delivery attempt.
pub fn apply_result(queued: &QueuedNotification, result: &DeliveryResult) {
    let state = &queued.state;
    if result.success {
        state.record_success();
        state.touch(OffsetDateTime::now_utc());
        if queued.event_type == NotificationType::Handshake
            && state.status() == SubscriptionStatus::Requested
        {
            state.set_status(SubscriptionStatus::Active);
            tracing::info!(subscription_id = %state.parsed.id, "handshake accepted, subscription active");
        }
        return;
    }

    let message = match (&result.error, result.http_status) {
        (Some(error), Some(status)) => format!("HTTP {status}: {error}"),
        (Some(error), None) => error.clone(),
        (None, Some(status)) => format!("HTTP {status}"),
        (None, None) => "delivery failed".to_string(),
    };
    let consecutive = state.record_error(message.clone());
    tracing::warn!(
        subscription_id = %state.parsed.id,
        event_type = queued.event_type.as_str(),
        consecutive,
        error = %message,
        "notification delivery failed"
    );

    if queued.event_type == NotificationType::Handshake {
        state.set_status(SubscriptionStatus::Error);
    } else if consecutive >= ERROR_STATUS_THRESHOLD {
        state.set_status(SubscriptionStatus::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::NotificationRequest;
    use crate::types::{
        ChannelCode, ContentLevel, ParsedSubscription, SubscriptionState,
    };
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn state() -> Arc<SubscriptionState> {
        Arc::new(SubscriptionState::new(ParsedSubscription {
            id: "sub1".into(),
            topic_url: "http://t".into(),
            channel: ChannelCode::RestHook,
            endpoint: "http://example.org/hook".into(),
            content_type: "application/fhir+json".into(),
            content: ContentLevel::FullResource,
            heartbeat_seconds: 0,
            status: SubscriptionStatus::Requested,
            headers: IndexMap::new(),
            filters_by_type: HashMap::new(),
        }))
    }

    fn queued(event_type: NotificationType, state: Arc<SubscriptionState>) -> QueuedNotification {
        QueuedNotification {
            request: NotificationRequest {
                channel: ChannelCode::RestHook,
                endpoint: "http://example.org/hook".into(),
                headers: Vec::new(),
                content_type: "application/fhir+json".into(),
                body: "{}".into(),
                subscription_id: "sub1".into(),
                event_type,
            },
            state,
            event_type,
        }
    }

    #[test]
    fn handshake_success_activates() {
        let state = state();
        let q = queued(NotificationType::Handshake, state.clone());
        apply_result(&q, &DeliveryResult::success(200));
        assert_eq!(state.status(), SubscriptionStatus::Active);
    }

    #[test]
    fn handshake_failure_errors_immediately() {
        let state = state();
        let q = queued(NotificationType::Handshake, state.clone());
        apply_result(&q, &DeliveryResult::http_failure(500, "boom"));
        assert_eq!(state.status(), SubscriptionStatus::Error);
        assert_eq!(state.errors().len(), 1);
    }

    #[test]
    fn repeated_failures_cross_the_threshold() {
        let state = state();
        state.set_status(SubscriptionStatus::Active);
        let q = queued(NotificationType::EventNotification, state.clone());

        apply_result(&q, &DeliveryResult::http_failure(503, "unavailable"));
        assert_eq!(state.status(), SubscriptionStatus::Active);
        apply_result(&q, &DeliveryResult::http_failure(503, "unavailable"));
        assert_eq!(state.status(), SubscriptionStatus::Active);
        apply_result(&q, &DeliveryResult::http_failure(503, "unavailable"));
        assert_eq!(state.status(), SubscriptionStatus::Error);
        assert_eq!(state.errors().len(), 3);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let state = state();
        state.set_status(SubscriptionStatus::Active);
        let q = queued(NotificationType::EventNotification, state.clone());

        apply_result(&q, &DeliveryResult::http_failure(503, "unavailable"));
        apply_result(&q, &DeliveryResult::http_failure(503, "unavailable"));
        apply_result(&q, &DeliveryResult::success(200));
        apply_result(&q, &DeliveryResult::http_failure(503, "unavailable"));
        assert_eq!(state.status(), SubscriptionStatus::Active);
    }

    struct FlakyDispatcher {
        attempts: Mutex<Vec<NotificationRequest>>,
        fail_first: bool,
    }

    #[async_trait]
    impl NotificationDispatcher for FlakyDispatcher {
        async fn send(&self, request: NotificationRequest) -> DeliveryResult {
            let mut attempts = self.attempts.lock();
            attempts.push(request);
            if self.fail_first && attempts.len() == 1 {
                DeliveryResult::failure("connection refused")
            } else {
                DeliveryResult::success(200)
            }
        }
    }

    #[tokio::test]
    async fn transport_failures_get_one_retry() {
        let dispatcher = Arc::new(FlakyDispatcher {
            attempts: Mutex::new(Vec::new()),
            fail_first: true,
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = state();
        state.set_status(SubscriptionStatus::Active);
        sender
            .send(queued(NotificationType::EventNotification, state.clone()))
            .unwrap();
        drop(sender);

        run_delivery_worker(receiver, dispatcher.clone()).await;
        assert_eq!(dispatcher.attempts.lock().len(), 2);
        assert_eq!(state.status(), SubscriptionStatus::Active);
        assert!(state.errors().is_empty());
    }
}

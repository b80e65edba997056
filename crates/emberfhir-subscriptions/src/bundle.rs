//! Notification bundle assembly.

use crate::types::{ContentLevel, NotificationType, SubscriptionEvent, SubscriptionState};
use serde_json::{Value, json};
use time::OffsetDateTime;

/// Build the `subscription-notification` bundle for one event.
///
/// The first entry is always the SubscriptionStatus; the focus resource and
/// its additional context follow, trimmed according to the subscription's
/// content level.
pub fn build_notification_bundle(
    state: &SubscriptionState,
    event: &SubscriptionEvent,
    base_url: &str,
) -> Value {
    let timestamp = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();

    let notification_events: Vec<Value> = event
        .event_numbers
        .iter()
        .map(|number| {
            let mut entry = json!({
                "eventNumber": number.to_string(),
                "timestamp": timestamp,
            });
            if let Some(focus) = &event.focus {
                entry["focus"] = json!({"reference": focus.key()});
            }
            entry
        })
        .collect();

    let status = json!({
        "resourceType": "SubscriptionStatus",
        "status": state.status().as_str(),
        "type": event.event_type.as_str(),
        "eventsSinceSubscriptionStart": state.events_since_start().to_string(),
        "notificationEvent": notification_events,
        "subscription": {"reference": format!("Subscription/{}", event.subscription_id)},
        "topic": event.topic_url,
    });

    let mut entries = vec![json!({
        "fullUrl": format!("urn:uuid:{}", uuid::Uuid::new_v4()),
        "resource": status,
        "request": {"method": "GET", "url": format!("Subscription/{}/$status", event.subscription_id)},
        "response": {"status": "200"},
    })];

    if event.event_type == NotificationType::EventNotification
        && state.parsed.content != ContentLevel::Empty
    {
        let focus_and_context = event
            .focus
            .iter()
            .chain(event.additional_context.iter());
        for resource in focus_and_context {
            let full_url = format!("{}/{}", base_url.trim_end_matches('/'), resource.key());
            let mut entry = json!({
                "fullUrl": full_url,
                "request": {"method": "GET", "url": resource.key()},
                "response": {"status": "200"},
            });
            if state.parsed.content == ContentLevel::FullResource {
                entry["resource"] = resource.as_json().clone();
            }
            entries.push(entry);
        }
    }

    json!({
        "resourceType": "Bundle",
        "type": "subscription-notification",
        "timestamp": timestamp,
        "entry": entries,
    })
}

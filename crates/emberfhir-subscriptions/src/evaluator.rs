//! The trigger pipeline fired on every store mutation.

use crate::bundle::build_notification_bundle;
use crate::dispatcher::NotificationRequest;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{
    CompiledQueryTrigger, CompiledTopic, NotificationShape, NotificationType, ParsedSubscription,
    SubscriptionEvent, SubscriptionState, SubscriptionStatus, TriggerInteraction,
};
use dashmap::DashMap;
use emberfhir_core::{EvalContext, Resource};
use emberfhir_search::{ParsedSearchParameter, PathCache, SearchContext, SearchParamRegistry};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// One successful store mutation, as the evaluator sees it.
#[derive(Debug, Clone)]
pub struct ResourceChange {
    pub type_name: String,
    pub interaction: TriggerInteraction,
    pub current: Option<Resource>,
    pub previous: Option<Resource>,
}

impl ResourceChange {
    /// The node notifications focus on: the current tree, or for deletes
    /// the last known one.
    pub fn focus(&self) -> Option<&Resource> {
        self.current.as_ref().or(self.previous.as_ref())
    }
}

/// Resolves a topic's notification shape against the tenant's stores.
pub trait IncludeResolver: Send + Sync {
    fn notification_context(&self, focus: &Resource, shape: &NotificationShape) -> Vec<Resource>;
}

/// Per-mutation evaluation environment, assembled by the tenant engine.
pub struct EvaluationEnv<'a> {
    pub registry: &'a SearchParamRegistry,
    pub cache: &'a PathCache,
    pub eval: &'a EvalContext,
    pub includes: &'a dyn IncludeResolver,
}

/// A rendered notification waiting for the delivery worker.
pub struct QueuedNotification {
    pub request: NotificationRequest,
    pub state: Arc<SubscriptionState>,
    pub event_type: NotificationType,
}

/// Evaluates every mutation against the registered topics and fans matched
/// events out to the delivery queue.
pub struct SubscriptionEvaluator {
    topics: DashMap<String, Arc<CompiledTopic>>,
    subscriptions: DashMap<String, Arc<SubscriptionState>>,
    subs_by_topic: DashMap<String, HashSet<String>>,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedNotification>>>,
    base_url: String,
}

impl SubscriptionEvaluator {
    /// Build the evaluator plus the receiving end of its delivery queue.
    pub fn new(base_url: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<QueuedNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let evaluator = Arc::new(Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            subs_by_topic: DashMap::new(),
            sender: Mutex::new(Some(sender)),
            base_url: base_url.into(),
        });
        (evaluator, receiver)
    }

    // -- registration ------------------------------------------------------

    /// Register or replace a topic. Topics whose trigger types are unknown
    /// to the tenant simply never see a matching mutation; they stay
    /// registered but non-executing.
    pub fn register_topic(&self, topic: CompiledTopic) {
        tracing::debug!(url = %topic.url, triggers = topic.triggers.len(), "registered topic");
        self.topics.insert(topic.url.clone(), Arc::new(topic));
    }

    pub fn remove_topic(&self, url: &str) -> Option<Arc<CompiledTopic>> {
        self.topics.remove(url).map(|(_, t)| t)
    }

    pub fn topic(&self, url: &str) -> Option<Arc<CompiledTopic>> {
        self.topics.get(url).map(|t| t.clone())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Register or replace a subscription. A brand-new registration sends
    /// the one-time handshake; a replacement keeps the event counter so
    /// numbers stay gap-free.
    pub fn register_subscription(&self, parsed: ParsedSubscription) -> Arc<SubscriptionState> {
        let id = parsed.id.clone();
        let topic_url = parsed.topic_url.clone();
        let previous = self.subscriptions.get(&id).map(|s| s.clone());

        let state = Arc::new(SubscriptionState::new(parsed));
        if let Some(previous) = &previous {
            state.resume_event_count(previous.events_since_start());
            if previous.parsed.topic_url != topic_url
                && let Some(mut old) = self.subs_by_topic.get_mut(&previous.parsed.topic_url)
            {
                old.remove(&id);
            }
        }

        self.subscriptions.insert(id.clone(), state.clone());
        self.subs_by_topic
            .entry(topic_url)
            .or_default()
            .insert(id.clone());

        if previous.is_none() {
            state.set_status(SubscriptionStatus::Requested);
            let handshake = SubscriptionEvent {
                subscription_id: id,
                topic_url: state.parsed.topic_url.clone(),
                event_type: NotificationType::Handshake,
                event_numbers: Vec::new(),
                focus: None,
                additional_context: Vec::new(),
            };
            self.enqueue(&state, handshake);
        }
        state
    }

    pub fn remove_subscription(&self, id: &str) -> Option<Arc<SubscriptionState>> {
        let removed = self.subscriptions.remove(id).map(|(_, s)| s);
        if let Some(state) = &removed
            && let Some(mut subs) = self.subs_by_topic.get_mut(&state.parsed.topic_url)
        {
            subs.remove(id);
        }
        removed
    }

    pub fn subscription(&self, id: &str) -> Option<Arc<SubscriptionState>> {
        self.subscriptions.get(id).map(|s| s.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // -- evaluation --------------------------------------------------------

    /// Run the trigger pipeline for one mutation. Never fails the mutation:
    /// evaluation errors are recorded against the owning subscription.
    pub fn evaluate(&self, change: &ResourceChange, env: &EvaluationEnv<'_>) {
        let Some(focus) = change.focus() else {
            return;
        };

        let mut notified: HashSet<String> = HashSet::new();

        for topic in self.topics.iter() {
            if !topic.is_executable() {
                continue;
            }
            let Some(triggers) = topic.triggers.get(&change.type_name) else {
                continue;
            };

            let matched = triggers
                .iter()
                .filter(|t| t.applies_to(change.interaction))
                .any(|trigger| {
                    if trigger.interaction_only() {
                        return true;
                    }
                    if let Some(path) = &trigger.path_criteria {
                        let node = change
                            .current
                            .as_ref()
                            .unwrap_or(focus)
                            .as_json();
                        if path.evaluate_boolean(node, env.eval) {
                            return true;
                        }
                    }
                    if let Some(query) = &trigger.query_criteria {
                        return self.query_trigger_matches(query, change, env);
                    }
                    false
                });

            if !matched {
                continue;
            }

            let Some(subscriber_ids) = self
                .subs_by_topic
                .get(topic.url.as_str())
                .map(|s| s.clone())
            else {
                continue;
            };

            for subscription_id in subscriber_ids {
                if notified.contains(&subscription_id) {
                    continue;
                }
                let Some(state) = self.subscription(&subscription_id) else {
                    continue;
                };
                match state.status() {
                    SubscriptionStatus::Off | SubscriptionStatus::Error => continue,
                    SubscriptionStatus::Requested | SubscriptionStatus::Active => {}
                }

                let filters = state
                    .parsed
                    .filters_by_type
                    .get(&change.type_name)
                    .or_else(|| state.parsed.filters_by_type.get("*"));
                let fires = match filters {
                    None => true,
                    Some(filters) => self.filters_match(focus, filters, &change.type_name, env),
                };
                if !fires {
                    continue;
                }

                let additional_context = topic
                    .shapes
                    .get(&change.type_name)
                    .map(|shape| env.includes.notification_context(focus, shape))
                    .unwrap_or_default();

                let event_number = state.next_event_number();
                let event = SubscriptionEvent {
                    subscription_id: subscription_id.clone(),
                    topic_url: topic.url.clone(),
                    event_type: NotificationType::EventNotification,
                    event_numbers: vec![event_number],
                    focus: Some(focus.clone()),
                    additional_context,
                };
                self.enqueue(&state, event);
                notified.insert(subscription_id);
            }
        }
    }

    fn filters_match(
        &self,
        focus: &Resource,
        filters: &[ParsedSearchParameter],
        type_name: &str,
        env: &EvaluationEnv<'_>,
    ) -> bool {
        if filters.is_empty() {
            return true;
        }
        let ctx = SearchContext {
            type_name,
            registry: env.registry,
            cache: env.cache,
            eval: env.eval,
        };
        emberfhir_search::matches(focus, filters, &ctx)
    }

    fn query_trigger_matches(
        &self,
        trigger: &CompiledQueryTrigger,
        change: &ResourceChange,
        env: &EvaluationEnv<'_>,
    ) -> bool {
        let test = |resource: &Resource, parameters: &[ParsedSearchParameter]| {
            self.filters_match(resource, parameters, &change.type_name, env)
        };

        let previous_passes = match &change.previous {
            Some(previous) if !trigger.previous.is_empty() => test(previous, &trigger.previous),
            Some(_) => true,
            // Auto-pass / auto-fail substitutes for the missing node.
            None => trigger.result_for_create.auto_result(),
        };
        let current_passes = match &change.current {
            Some(current) if !trigger.current.is_empty() => test(current, &trigger.current),
            Some(_) => true,
            None => trigger.result_for_delete.auto_result(),
        };

        if trigger.require_both {
            previous_passes && current_passes
        } else {
            previous_passes || current_passes
        }
    }

    // -- timers ------------------------------------------------------------

    /// Heartbeat sweep; the manager runs this every two seconds. Fires for
    /// active subscriptions whose heartbeat window has elapsed.
    pub fn heartbeat(&self, now: OffsetDateTime) {
        for entry in self.subscriptions.iter() {
            let state = entry.value();
            if state.parsed.heartbeat_seconds == 0 {
                continue;
            }
            if state.status() != SubscriptionStatus::Active {
                continue;
            }
            let elapsed = (now - state.last_communication()).whole_seconds();
            if elapsed < state.parsed.heartbeat_seconds as i64 {
                continue;
            }
            state.touch(now);
            let event = SubscriptionEvent {
                subscription_id: state.parsed.id.clone(),
                topic_url: state.parsed.topic_url.clone(),
                event_type: NotificationType::Heartbeat,
                event_numbers: Vec::new(),
                focus: None,
                additional_context: Vec::new(),
            };
            self.enqueue(state, event);
        }
    }

    /// `query-status` / `query-event` notification types are recognized but
    /// deliberately unimplemented.
    pub fn queue_query_notification(
        &self,
        _subscription_id: &str,
        notification_type: NotificationType,
    ) -> SubscriptionResult<()> {
        Err(SubscriptionError::NotImplemented(format!(
            "{} notifications",
            notification_type.as_str()
        )))
    }

    // -- queue -------------------------------------------------------------

    fn enqueue(&self, state: &Arc<SubscriptionState>, event: SubscriptionEvent) {
        let body = build_notification_bundle(state, &event, &self.base_url);
        let request = NotificationRequest {
            channel: state.parsed.channel.clone(),
            endpoint: state.parsed.endpoint.clone(),
            headers: state.parsed.header_pairs(),
            content_type: state.parsed.content_type.clone(),
            body: body.to_string(),
            subscription_id: event.subscription_id.clone(),
            event_type: event.event_type,
        };
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender
                    .send(QueuedNotification {
                        request,
                        state: state.clone(),
                        event_type: event.event_type,
                    })
                    .is_err()
                {
                    tracing::warn!(
                        subscription_id = %event.subscription_id,
                        "delivery queue is gone, dropping notification"
                    );
                }
            }
            None => {
                tracing::trace!(
                    subscription_id = %event.subscription_id,
                    "evaluator closed, dropping notification"
                );
            }
        }
    }

    /// Close the delivery queue; the worker drains what was already queued
    /// and exits.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

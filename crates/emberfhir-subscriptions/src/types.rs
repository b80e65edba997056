//! Compiled, runtime forms of topics and subscriptions.

use emberfhir_core::{Interaction, PathExpression, Resource};
use emberfhir_search::ParsedSearchParameter;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use time::OffsetDateTime;

/// Errors kept per subscription are capped to the most recent ten.
pub const MAX_RECORDED_ERRORS: usize = 10;

/// Consecutive delivery failures before a subscription flips to `error`.
pub const ERROR_STATUS_THRESHOLD: u32 = 3;

// =============================================================================
// TOPICS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    Draft,
    Active,
    Retired,
    #[default]
    Unknown,
}

impl From<&str> for TopicStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "draft" => Self::Draft,
            "active" => Self::Active,
            "retired" => Self::Retired,
            _ => Self::Unknown,
        }
    }
}

/// Mutation kinds a trigger can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerInteraction {
    Create,
    Update,
    Delete,
}

impl TriggerInteraction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn from_interaction(interaction: Interaction) -> Option<Self> {
        match interaction {
            Interaction::Create => Some(Self::Create),
            Interaction::Update => Some(Self::Update),
            Interaction::Delete => Some(Self::Delete),
            _ => None,
        }
    }
}

impl From<&str> for TriggerInteraction {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "create" => Self::Create,
            "delete" => Self::Delete,
            _ => Self::Update,
        }
    }
}

/// What a query-shape test reports when the tested node does not exist
/// (previous on create, current on delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryResultBehavior {
    #[default]
    TestPasses,
    TestFails,
    NoTest,
}

impl From<&str> for QueryResultBehavior {
    fn from(s: &str) -> Self {
        match s {
            "test-fails" => Self::TestFails,
            "no-test" => Self::NoTest,
            _ => Self::TestPasses,
        }
    }
}

impl QueryResultBehavior {
    /// The auto-pass / auto-fail substitution for a missing node.
    pub fn auto_result(&self) -> bool {
        !matches!(self, Self::TestFails)
    }
}

/// Query-shape trigger, compiled to parsed parameter lists.
#[derive(Debug, Clone)]
pub struct CompiledQueryTrigger {
    pub previous: Vec<ParsedSearchParameter>,
    pub result_for_create: QueryResultBehavior,
    pub current: Vec<ParsedSearchParameter>,
    pub result_for_delete: QueryResultBehavior,
    pub require_both: bool,
}

/// One resource trigger of a topic, in executable form.
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    pub interactions: Vec<TriggerInteraction>,
    pub path_criteria: Option<Arc<PathExpression>>,
    pub query_criteria: Option<CompiledQueryTrigger>,
    pub description: Option<String>,
}

impl CompiledTrigger {
    pub fn applies_to(&self, interaction: TriggerInteraction) -> bool {
        self.interactions.contains(&interaction)
    }

    /// An interaction-only trigger matches as soon as the interaction gate
    /// opens.
    pub fn interaction_only(&self) -> bool {
        self.path_criteria.is_none() && self.query_criteria.is_none()
    }
}

/// `_include` / `_revinclude` directives shaping a notification.
#[derive(Debug, Clone, Default)]
pub struct NotificationShape {
    pub includes: Vec<String>,
    pub rev_includes: Vec<String>,
}

/// Pre-compiled executable form of one topic.
#[derive(Debug, Clone)]
pub struct CompiledTopic {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub status: TopicStatus,
    /// Triggers grouped by resource type name.
    pub triggers: HashMap<String, Vec<CompiledTrigger>>,
    /// Notification shape per resource type name.
    pub shapes: HashMap<String, NotificationShape>,
}

impl CompiledTopic {
    pub fn is_executable(&self) -> bool {
        !matches!(self.status, TopicStatus::Retired)
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCode {
    RestHook,
    Zulip,
    Email,
    Websocket,
    Other(String),
}

impl ChannelCode {
    pub fn parse(s: &str) -> Self {
        match s {
            "rest-hook" => Self::RestHook,
            "zulip" => Self::Zulip,
            "email" => Self::Email,
            "websocket" => Self::Websocket,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RestHook => "rest-hook",
            Self::Zulip => "zulip",
            Self::Email => "email",
            Self::Websocket => "websocket",
            Self::Other(code) => code.as_str(),
        }
    }
}

/// How much of the focus resource a notification carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentLevel {
    Empty,
    IdOnly,
    #[default]
    FullResource,
}

impl From<&str> for ContentLevel {
    fn from(s: &str) -> Self {
        match s {
            "empty" => Self::Empty,
            "id-only" => Self::IdOnly,
            _ => Self::FullResource,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionStatus {
    #[default]
    Off,
    Requested,
    Active,
    Error,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

impl From<&str> for SubscriptionStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "requested" => Self::Requested,
            "active" => Self::Active,
            "error" => Self::Error,
            _ => Self::Off,
        }
    }
}

/// Immutable snapshot of a subscription resource.
#[derive(Debug, Clone)]
pub struct ParsedSubscription {
    pub id: String,
    pub topic_url: String,
    pub channel: ChannelCode,
    pub endpoint: String,
    pub content_type: String,
    pub content: ContentLevel,
    pub heartbeat_seconds: u64,
    pub status: SubscriptionStatus,
    /// Header name to ordered values, preserving declaration order.
    pub headers: IndexMap<String, Vec<String>>,
    /// Filters grouped by the resource type they apply to.
    pub filters_by_type: HashMap<String, Vec<ParsedSearchParameter>>,
}

impl ParsedSubscription {
    /// Flatten headers to the `(name, value)` pairs the dispatcher sends.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (name, values) in &self.headers {
            for value in values {
                pairs.push((name.clone(), value.clone()));
            }
        }
        pairs
    }
}

/// Runtime state of one subscription: the parsed snapshot plus counters
/// and error accounting.
#[derive(Debug)]
pub struct SubscriptionState {
    pub parsed: ParsedSubscription,
    status: RwLock<SubscriptionStatus>,
    event_counter: AtomicU64,
    last_communication: RwLock<OffsetDateTime>,
    errors: Mutex<VecDeque<String>>,
    consecutive_failures: AtomicU32,
}

impl SubscriptionState {
    pub fn new(parsed: ParsedSubscription) -> Self {
        let status = parsed.status;
        Self {
            parsed,
            status: RwLock::new(status),
            event_counter: AtomicU64::new(0),
            last_communication: RwLock::new(OffsetDateTime::now_utc()),
            errors: Mutex::new(VecDeque::new()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: SubscriptionStatus) {
        *self.status.write() = status;
    }

    /// Next event number; strictly increasing, gap-free, starting at 1.
    pub fn next_event_number(&self) -> u64 {
        self.event_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Events issued since the subscription started.
    pub fn events_since_start(&self) -> u64 {
        self.event_counter.load(Ordering::SeqCst)
    }

    /// Carry the counter across a re-registration so event numbers stay
    /// gap-free for the subscriber.
    pub fn resume_event_count(&self, count: u64) {
        self.event_counter.store(count, Ordering::SeqCst);
    }

    pub fn last_communication(&self) -> OffsetDateTime {
        *self.last_communication.read()
    }

    pub fn touch(&self, now: OffsetDateTime) {
        *self.last_communication.write() = now;
    }

    /// Record a delivery or evaluation error; returns the consecutive
    /// failure count.
    pub fn record_error(&self, message: impl Into<String>) -> u32 {
        let mut errors = self.errors.lock();
        if errors.len() == MAX_RECORDED_ERRORS {
            errors.pop_front();
        }
        errors.push_back(message.into());
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().iter().cloned().collect()
    }
}

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    Handshake,
    Heartbeat,
    EventNotification,
    QueryStatus,
    QueryEvent,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Heartbeat => "heartbeat",
            Self::EventNotification => "event-notification",
            Self::QueryStatus => "query-status",
            Self::QueryEvent => "query-event",
        }
    }
}

/// One event handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub subscription_id: String,
    pub topic_url: String,
    pub event_type: NotificationType,
    /// Empty for handshakes and heartbeats.
    pub event_numbers: Vec<u64>,
    pub focus: Option<Resource>,
    pub additional_context: Vec<Resource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed() -> ParsedSubscription {
        ParsedSubscription {
            id: "sub1".into(),
            topic_url: "http://example.org/topic/t1".into(),
            channel: ChannelCode::RestHook,
            endpoint: "http://example.org/hook".into(),
            content_type: "application/fhir+json".into(),
            content: ContentLevel::FullResource,
            heartbeat_seconds: 0,
            status: SubscriptionStatus::Requested,
            headers: IndexMap::new(),
            filters_by_type: HashMap::new(),
        }
    }

    #[test]
    fn event_numbers_are_contiguous_from_one() {
        let state = SubscriptionState::new(parsed());
        assert_eq!(state.next_event_number(), 1);
        assert_eq!(state.next_event_number(), 2);
        assert_eq!(state.next_event_number(), 3);
        assert_eq!(state.events_since_start(), 3);
    }

    #[test]
    fn error_list_is_bounded() {
        let state = SubscriptionState::new(parsed());
        for i in 0..15 {
            state.record_error(format!("boom {i}"));
        }
        let errors = state.errors();
        assert_eq!(errors.len(), MAX_RECORDED_ERRORS);
        assert_eq!(errors.first().unwrap(), "boom 5");
        assert_eq!(errors.last().unwrap(), "boom 14");
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let state = SubscriptionState::new(parsed());
        assert_eq!(state.record_error("a"), 1);
        assert_eq!(state.record_error("b"), 2);
        state.record_success();
        assert_eq!(state.record_error("c"), 1);
    }

    #[test]
    fn channel_codes_round_trip() {
        assert_eq!(ChannelCode::parse("rest-hook"), ChannelCode::RestHook);
        assert_eq!(ChannelCode::parse("zulip"), ChannelCode::Zulip);
        assert_eq!(
            ChannelCode::parse("carrier-pigeon"),
            ChannelCode::Other("carrier-pigeon".into())
        );
        assert_eq!(ChannelCode::RestHook.as_str(), "rest-hook");
    }

    #[test]
    fn query_behavior_auto_results() {
        assert!(QueryResultBehavior::TestPasses.auto_result());
        assert!(QueryResultBehavior::NoTest.auto_result());
        assert!(!QueryResultBehavior::TestFails.auto_result());
    }

    #[test]
    fn header_pairs_preserve_order() {
        let mut p = parsed();
        p.headers
            .insert("X-First".into(), vec!["a".into(), "b".into()]);
        p.headers.insert("X-Second".into(), vec!["c".into()]);
        let pairs = p.header_pairs();
        assert_eq!(
            pairs,
            vec![
                ("X-First".to_string(), "a".to_string()),
                ("X-First".to_string(), "b".to_string()),
                ("X-Second".to_string(), "c".to_string()),
            ]
        );
    }
}

//! Topic-based subscription evaluation.
//!
//! Topics are compiled into executable trigger pipelines at registration
//! time; every store mutation is then evaluated through
//! [`evaluator::SubscriptionEvaluator`], and matched events flow through an
//! in-process queue to a [`dispatcher::NotificationDispatcher`].

pub mod bundle;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod parse;
pub mod types;

pub use bundle::build_notification_bundle;
pub use delivery::run_delivery_worker;
pub use dispatcher::{DeliveryResult, NotificationDispatcher, NotificationRequest};
pub use error::SubscriptionError;
pub use evaluator::{
    EvaluationEnv, IncludeResolver, QueuedNotification, ResourceChange, SubscriptionEvaluator,
};
pub use parse::{RegistrySource, is_topic_resource, parse_subscription, parse_topic};
pub use types::{
    ChannelCode, CompiledQueryTrigger, CompiledTopic, CompiledTrigger, ContentLevel,
    NotificationShape, NotificationType, ParsedSubscription, QueryResultBehavior,
    SubscriptionEvent, SubscriptionState, SubscriptionStatus, TopicStatus, TriggerInteraction,
};

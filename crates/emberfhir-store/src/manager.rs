//! The process-wide tenant manager: owns the tenant map, the background
//! timers and the delivery workers.

use crate::engine::TenantEngine;
use crate::types::TenantSettings;
use dashmap::DashMap;
use emberfhir_core::{CoreError, WireCodec};
use emberfhir_subscriptions::{NotificationDispatcher, run_delivery_worker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Capacity enforcement and received-notification pruning cadence.
const USAGE_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat sweep cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

pub struct TenantManager {
    tenants: DashMap<String, Arc<TenantEngine>>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    codec: Arc<dyn WireCodec>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    timer_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TenantManager {
    pub fn new(
        dispatcher: Arc<dyn NotificationDispatcher>,
        codec: Arc<dyn WireCodec>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenants: DashMap::new(),
            dispatcher,
            codec,
            worker_handles: Mutex::new(Vec::new()),
            timer_handles: Mutex::new(Vec::new()),
        })
    }

    /// Register a tenant, run its startup load and spawn its delivery
    /// worker. Tenants must be registered before the first request is
    /// accepted.
    pub fn add_tenant(&self, settings: TenantSettings) -> Result<Arc<TenantEngine>, CoreError> {
        let name = settings.name.clone();
        if name.is_empty() {
            return Err(CoreError::configuration("tenant name must not be empty"));
        }
        if self.tenants.contains_key(&name) {
            return Err(CoreError::configuration(format!(
                "tenant '{name}' is already registered"
            )));
        }

        let (engine, receiver) = TenantEngine::new(settings, self.codec.clone());
        engine.load_directory()?;

        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(run_delivery_worker(receiver, dispatcher));
        self.worker_handles.lock().push(handle);

        tracing::info!(tenant = %name, "tenant registered");
        self.tenants.insert(name, engine.clone());
        Ok(engine)
    }

    pub fn tenant(&self, name: &str) -> Option<Arc<TenantEngine>> {
        self.tenants.get(name).map(|t| t.clone())
    }

    pub fn tenant_names(&self) -> Vec<String> {
        self.tenants.iter().map(|t| t.key().clone()).collect()
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Spawn the capacity and heartbeat timers.
    pub fn start_timers(self: Arc<Self>) {
        let manager = self.clone();
        let usage = tokio::spawn(async move {
            let mut interval = tokio::time::interval(USAGE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for tenant in manager.tenants.iter() {
                    tenant.check_usage();
                }
            }
        });

        let manager = self.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = OffsetDateTime::now_utc();
                for tenant in manager.tenants.iter() {
                    tenant.heartbeat_sweep(now);
                }
            }
        });

        let mut timers = self.timer_handles.lock();
        timers.push(usage);
        timers.push(heartbeat);
    }

    /// Stop timers first, then close the evaluators and drain the delivery
    /// workers.
    pub async fn shutdown(&self) {
        for handle in self.timer_handles.lock().drain(..) {
            handle.abort();
        }
        for tenant in self.tenants.iter() {
            tenant.evaluator().close();
        }
        let handles: Vec<JoinHandle<()>> = self.worker_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("tenant manager stopped");
    }
}

impl std::fmt::Debug for TenantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantManager")
            .field("tenants", &self.tenants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use emberfhir_core::codec::JsonCodec;
    use emberfhir_core::{FhirVersion, Resource, StoreStatus};
    use emberfhir_subscriptions::{DeliveryResult, NotificationRequest};
    use serde_json::json;

    struct RecordingDispatcher {
        sent: Mutex<Vec<NotificationRequest>>,
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn send(&self, request: NotificationRequest) -> DeliveryResult {
            self.sent.lock().push(request);
            DeliveryResult::success(200)
        }
    }

    fn manager() -> (Arc<TenantManager>, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher {
            sent: Mutex::new(Vec::new()),
        });
        let manager = TenantManager::new(dispatcher.clone(), Arc::new(JsonCodec));
        (manager, dispatcher)
    }

    #[tokio::test]
    async fn add_tenant_and_route() {
        let (manager, _dispatcher) = manager();
        let settings = TenantSettings::new("r4", FhirVersion::R4, "http://localhost:5826/r4");
        manager.add_tenant(settings).unwrap();
        assert_eq!(manager.tenant_count(), 1);
        assert!(manager.tenant("r4").is_some());
        assert!(manager.tenant("nope").is_none());

        let engine = manager.tenant("r4").unwrap();
        let response = engine.create(
            "Patient",
            Resource::new(json!({"resourceType": "Patient", "id": "p1"})).unwrap(),
            true,
        );
        assert_eq!(response.status, StoreStatus::Created);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_tenant_is_rejected() {
        let (manager, _dispatcher) = manager();
        let settings = TenantSettings::new("r4", FhirVersion::R4, "http://localhost:5826/r4");
        manager.add_tenant(settings.clone()).unwrap();
        assert!(manager.add_tenant(settings).is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn notifications_reach_the_dispatcher() {
        let (manager, dispatcher) = manager();
        let engine = manager
            .add_tenant(TenantSettings::new(
                "t",
                FhirVersion::R5,
                "http://localhost:5826/t",
            ))
            .unwrap();

        engine.create(
            "SubscriptionTopic",
            Resource::new(json!({
                "resourceType": "SubscriptionTopic",
                "id": "t1",
                "url": "http://example.org/topics/patient",
                "status": "active",
                "resourceTrigger": [{"resource": "Patient", "supportedInteraction": ["create"]}]
            }))
            .unwrap(),
            true,
        );
        engine.create(
            "Subscription",
            Resource::new(json!({
                "resourceType": "Subscription",
                "id": "sub1",
                "status": "requested",
                "topic": "http://example.org/topics/patient",
                "channelType": {"code": "rest-hook"},
                "endpoint": "http://example.org/hook"
            }))
            .unwrap(),
            true,
        );
        engine.create(
            "Patient",
            Resource::new(json!({"resourceType": "Patient", "id": "p1"})).unwrap(),
            true,
        );

        // Close the queue and drain the worker.
        manager.shutdown().await;

        let sent = dispatcher.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].subscription_id, "sub1");
        assert_eq!(sent[1].endpoint, "http://example.org/hook");
    }
}

//! The per-type resource store: a concurrency-safe versioned map with
//! secondary indexes and conditional-precondition enforcement.

use arc_swap::ArcSwap;
use dashmap::{DashMap, DashSet};
use emberfhir_core::{
    EvalContext, OperationOutcome, OperationResponse, Resource, StoreStatus, now_utc,
};
use emberfhir_search::{ParsedSearchParameter, PathCache, SearchContext, SearchParamDef, SearchParamRegistry};
use emberfhir_subscriptions::{ResourceChange, TriggerInteraction};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

/// Fully-qualified identifiers (`Type/id`) that no runtime mutation may
/// change. Populated at startup when a tenant protects loaded content.
#[derive(Debug, Default)]
pub struct ProtectedResources {
    keys: DashSet<String>,
}

impl ProtectedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Engine-side hooks a store drives around every mutation.
///
/// `validate` runs before anything is stored (special types parse to their
/// executable form first); `committed` runs after the write lock is
/// released and feeds registrations and subscription evaluation.
pub trait StoreObserver: Send + Sync {
    fn validate(&self, resource: &Resource) -> Result<(), String>;
    fn committed(&self, change: ResourceChange);
}

/// One `(tenant, typeName)` map with versioning and secondary indexes.
///
/// Mutations are linearizable under the per-store write lock; point reads
/// go straight to the concurrent map.
pub struct ResourceStore {
    type_name: String,
    resources: DashMap<String, Resource>,
    canonical_index: DashMap<String, String>,
    identifier_index: DashMap<String, String>,
    registry: ArcSwap<SearchParamRegistry>,
    write_lock: Mutex<()>,
    observer: RwLock<Option<Weak<dyn StoreObserver>>>,
}

impl ResourceStore {
    pub fn new(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let registry = SearchParamRegistry::for_type(&type_name);
        Self {
            type_name,
            resources: DashMap::new(),
            canonical_index: DashMap::new(),
            identifier_index: DashMap::new(),
            registry: ArcSwap::from_pointee(registry),
            write_lock: Mutex::new(()),
            observer: RwLock::new(None),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn set_observer(&self, observer: Weak<dyn StoreObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn StoreObserver>> {
        self.observer.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn registry(&self) -> Arc<SearchParamRegistry> {
        self.registry.load_full()
    }

    /// Add or replace an executable search parameter.
    pub fn register_search_param(&self, def: SearchParamDef) {
        let mut next = SearchParamRegistry::clone(&self.registry.load());
        next.insert(def);
        self.registry.store(Arc::new(next));
    }

    pub fn unregister_search_param(&self, name: &str) {
        let mut next = SearchParamRegistry::clone(&self.registry.load());
        next.remove(name);
        self.registry.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    /// Lock-free point read.
    pub fn get(&self, id: &str) -> Option<Resource> {
        self.resources.get(id).map(|r| r.clone())
    }

    pub fn resolve_canonical(&self, url: &str) -> Option<Resource> {
        let id = self.canonical_index.get(url).map(|id| id.clone())?;
        self.get(&id)
    }

    pub fn resolve_identifier(&self, key: &str) -> Option<Resource> {
        let id = self.identifier_index.get(key).map(|id| id.clone())?;
        self.get(&id)
    }

    // -- interactions ------------------------------------------------------

    pub fn read(&self, id: &str) -> OperationResponse {
        match self.get(id) {
            Some(resource) => {
                let mut response = OperationResponse::new(
                    StoreStatus::Ok,
                    OperationOutcome::info(format!("read {}/{id}", self.type_name)),
                );
                if let Some(version) = resource.version_id() {
                    response = response.with_version(version);
                }
                if let Some(instant) = resource.last_updated() {
                    response = response.with_last_modified(instant);
                }
                response.with_resource(resource)
            }
            None => OperationResponse::error(
                StoreStatus::NotFound,
                format!("{}/{id} is not known to this tenant", self.type_name),
            ),
        }
    }

    pub fn create(&self, mut source: Resource, allow_client_id: bool) -> OperationResponse {
        if source.type_name() != self.type_name {
            return OperationResponse::error(
                StoreStatus::BadRequest,
                format!(
                    "resource type {} does not match the {} endpoint",
                    source.type_name(),
                    self.type_name
                ),
            );
        }

        // Special types must parse to their executable form before anything
        // is stored.
        if let Some(observer) = self.observer()
            && let Err(message) = observer.validate(&source)
        {
            return OperationResponse::error(StoreStatus::BadRequest, message);
        }

        if !allow_client_id || source.id().map(str::is_empty).unwrap_or(true) {
            source.set_id(&emberfhir_core::id::next_id());
        }
        let id = source.id().unwrap_or_default().to_string();

        {
            let _guard = self.write_lock.lock();
            if self.resources.contains_key(&id) {
                return OperationResponse::error(
                    StoreStatus::Conflict,
                    format!("{}/{id} already exists", self.type_name),
                );
            }
            let instant = now_utc();
            source.stamp_meta("1", &instant);
            self.index_resource(&source);
            self.resources.insert(id.clone(), source.clone());
        }

        if let Some(observer) = self.observer() {
            observer.committed(ResourceChange {
                type_name: self.type_name.clone(),
                interaction: TriggerInteraction::Create,
                current: Some(source.clone()),
                previous: None,
            });
        }

        let last_updated = source.last_updated();
        let mut response = OperationResponse::new(
            StoreStatus::Created,
            OperationOutcome::info(format!("created {}/{id}", self.type_name)),
        )
        .with_version("1")
        .with_location(format!("{}/{id}", self.type_name));
        if let Some(instant) = last_updated {
            response = response.with_last_modified(instant);
        }
        response.with_resource(source)
    }

    pub fn update(
        &self,
        mut source: Resource,
        allow_create: bool,
        if_match: Option<&str>,
        if_none_match: Option<&str>,
        protected: &ProtectedResources,
    ) -> OperationResponse {
        if source.type_name() != self.type_name {
            return OperationResponse::error(
                StoreStatus::BadRequest,
                format!(
                    "resource type {} does not match the {} endpoint",
                    source.type_name(),
                    self.type_name
                ),
            );
        }
        let Some(id) = source.id().map(str::to_string).filter(|id| !id.is_empty()) else {
            return OperationResponse::error(
                StoreStatus::BadRequest,
                "update requires a resource id",
            );
        };

        if protected.contains(&format!("{}/{id}", self.type_name)) {
            return OperationResponse::error(
                StoreStatus::Unauthorized,
                format!("{}/{id} is protected and cannot be changed", self.type_name),
            );
        }

        if let Some(observer) = self.observer()
            && let Err(message) = observer.validate(&source)
        {
            return OperationResponse::error(StoreStatus::BadRequest, message);
        }

        let created;
        let previous;
        let new_version;
        {
            let _guard = self.write_lock.lock();
            previous = self.get(&id);

            // Conditional precondition matrix.
            if let Some(if_none_match) = if_none_match
                && let Some(prior) = &previous
            {
                if if_none_match.trim() == "*" {
                    return OperationResponse::error(
                        StoreStatus::PreconditionFailed,
                        format!("If-None-Match: * failed, {}/{id} exists", self.type_name),
                    );
                }
                if parse_etag(if_none_match) == prior.version_id().map(str::to_string) {
                    return OperationResponse::error(
                        StoreStatus::PreconditionFailed,
                        format!("If-None-Match failed for {}/{id}", self.type_name),
                    );
                }
            }
            if let Some(if_match) = if_match
                && let Some(prior) = &previous
                && parse_etag(if_match) != prior.version_id().map(str::to_string)
            {
                return OperationResponse::error(
                    StoreStatus::PreconditionFailed,
                    format!(
                        "If-Match {} does not match current version {} of {}/{id}",
                        if_match,
                        prior.version_id().unwrap_or("<none>"),
                        self.type_name
                    ),
                );
            }

            match &previous {
                None => {
                    if !allow_create {
                        return OperationResponse::error(
                            StoreStatus::BadRequest,
                            format!("{}/{id} does not exist and update-as-create is disabled", self.type_name),
                        );
                    }
                    created = true;
                    new_version = "1".to_string();
                }
                Some(prior) => {
                    created = false;
                    new_version = prior
                        .version_id()
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(|v| (v + 1).to_string())
                        .unwrap_or_else(|| "1".to_string());
                    self.unindex_resource(prior);
                }
            }

            let instant = now_utc();
            source.stamp_meta(&new_version, &instant);
            self.index_resource(&source);
            self.resources.insert(id.clone(), source.clone());
        }

        if let Some(observer) = self.observer() {
            observer.committed(ResourceChange {
                type_name: self.type_name.clone(),
                interaction: if created {
                    TriggerInteraction::Create
                } else {
                    TriggerInteraction::Update
                },
                current: Some(source.clone()),
                previous: previous.clone(),
            });
        }

        let status = if created { StoreStatus::Created } else { StoreStatus::Ok };
        let last_updated = source.last_updated();
        let mut response = OperationResponse::new(
            status,
            OperationOutcome::info(format!("updated {}/{id}", self.type_name)),
        )
        .with_version(&new_version)
        .with_location(format!("{}/{id}", self.type_name));
        if let Some(instant) = last_updated {
            response = response.with_last_modified(instant);
        }
        response.with_resource(source)
    }

    pub fn delete(&self, id: &str, protected: &ProtectedResources) -> OperationResponse {
        if protected.contains(&format!("{}/{id}", self.type_name)) {
            return OperationResponse::error(
                StoreStatus::Unauthorized,
                format!("{}/{id} is protected and cannot be deleted", self.type_name),
            );
        }

        let removed;
        {
            let _guard = self.write_lock.lock();
            match self.resources.remove(id) {
                Some((_, resource)) => {
                    self.unindex_resource(&resource);
                    removed = resource;
                }
                None => {
                    return OperationResponse::error(
                        StoreStatus::NotFound,
                        format!("{}/{id} is not known to this tenant", self.type_name),
                    );
                }
            }
        }

        if let Some(observer) = self.observer() {
            observer.committed(ResourceChange {
                type_name: self.type_name.clone(),
                interaction: TriggerInteraction::Delete,
                current: None,
                previous: Some(removed.clone()),
            });
        }

        OperationResponse::new(
            StoreStatus::NoContent,
            OperationOutcome::info(format!("deleted {}/{id}", self.type_name)),
        )
        .with_resource(removed)
    }

    /// Evaluate the parameter conjunction against every resource in the
    /// store. Enumeration order is unspecified.
    pub fn search(
        &self,
        parameters: &[ParsedSearchParameter],
        cache: &PathCache,
        eval: &EvalContext,
    ) -> Vec<Resource> {
        let registry = self.registry();
        let ctx = SearchContext {
            type_name: &self.type_name,
            registry: &registry,
            cache,
            eval,
        };
        // Snapshot first so testers can re-enter the store through the
        // element resolver without holding shard locks.
        let snapshot: Vec<Resource> = self.resources.iter().map(|e| e.value().clone()).collect();
        snapshot
            .into_iter()
            .filter(|resource| emberfhir_search::matches(resource, parameters, &ctx))
            .collect()
    }

    /// Snapshot for transaction rollback.
    pub fn snapshot(&self) -> Vec<Resource> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    /// Restore a snapshot, rebuilding the secondary indexes.
    pub fn restore(&self, snapshot: Vec<Resource>) {
        let _guard = self.write_lock.lock();
        self.resources.clear();
        self.canonical_index.clear();
        self.identifier_index.clear();
        for resource in snapshot {
            if let Some(id) = resource.id() {
                self.index_resource(&resource);
                self.resources.insert(id.to_string(), resource);
            }
        }
    }

    // -- secondary indexes -------------------------------------------------

    fn index_resource(&self, resource: &Resource) {
        let Some(id) = resource.id() else { return };
        if let Some(url) = resource.canonical_url() {
            self.canonical_index.insert(url.to_string(), id.to_string());
        }
        for key in resource.identifier_keys() {
            self.identifier_index.insert(key, id.to_string());
        }
    }

    fn unindex_resource(&self, resource: &Resource) {
        if let Some(url) = resource.canonical_url() {
            self.canonical_index.remove(url);
        }
        for key in resource.identifier_keys() {
            self.identifier_index.remove(&key);
        }
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("type_name", &self.type_name)
            .field("resources", &self.resources.len())
            .finish()
    }
}

/// Strip the weak prefix and quotes off an entity tag.
fn parse_etag(tag: &str) -> Option<String> {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    let tag = tag.trim_matches('"');
    if tag.is_empty() { None } else { Some(tag.to_string()) }
}

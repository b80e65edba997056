//! The tenant engine: owns one store per supported type, routes
//! interactions, expands includes, processes bundles and runs the
//! capacity and notification-TTL housekeeping.

use crate::store::{ProtectedResources, ResourceStore, StoreObserver};
use crate::types::{SUPPORTED_TYPES, TenantSettings};
use arc_swap::ArcSwapOption;
use emberfhir_core::{
    CoreError, ElementResolver, EvalContext, OperationOutcome, OperationResponse, Resource,
    ResourceReference, StoreStatus, WireCodec, WireFormat,
};
use emberfhir_search::{
    IncludeDirective, ParsedQuery, ParsedSearchParameter, ParsedValue, PathCache,
    SearchParamRegistry, SummaryMode, ValueSetIndex,
};
use emberfhir_subscriptions::{
    EvaluationEnv, IncludeResolver, NotificationShape, QueuedNotification, RegistrySource,
    ResourceChange, SubscriptionEvaluator, TriggerInteraction, is_topic_resource,
    parse_subscription, parse_topic,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Weak};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;

/// `:iterate` include expansion stops after this many rounds; advertised in
/// the capability document.
pub const MAX_INCLUDE_DEPTH: usize = 5;

/// Received notifications older than this are pruned by the usage timer.
pub const RECEIVED_NOTIFICATION_TTL: Duration = Duration::minutes(10);

pub struct TenantEngine {
    settings: TenantSettings,
    stores: HashMap<String, Arc<ResourceStore>>,
    protected: ProtectedResources,
    evaluator: Arc<SubscriptionEvaluator>,
    value_sets: Arc<ValueSetIndex>,
    path_cache: Arc<PathCache>,
    capability: ArcSwapOption<Resource>,
    /// FIFO of created `Type/id` keys, drained by capacity enforcement.
    created_queue: Mutex<VecDeque<String>>,
    /// Subscription reference to received-notification instants.
    received_notifications: Mutex<HashMap<String, Vec<OffsetDateTime>>>,
    /// Tenant-wide advisory barrier for transaction bundles.
    write_barrier: Mutex<()>,
    codec: Arc<dyn WireCodec>,
    self_weak: RwLock<Option<Weak<TenantEngine>>>,
}

impl TenantEngine {
    /// Build the engine and the receiving end of its notification queue.
    /// The caller hands the receiver to a delivery worker.
    pub fn new(
        settings: TenantSettings,
        codec: Arc<dyn WireCodec>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<QueuedNotification>) {
        let (evaluator, receiver) = SubscriptionEvaluator::new(&settings.base_url);
        let stores: HashMap<String, Arc<ResourceStore>> = SUPPORTED_TYPES
            .iter()
            .map(|t| ((*t).to_string(), Arc::new(ResourceStore::new(*t))))
            .collect();

        let engine = Arc::new(Self {
            settings,
            stores,
            protected: ProtectedResources::new(),
            evaluator,
            value_sets: Arc::new(ValueSetIndex::new()),
            path_cache: Arc::new(PathCache::new()),
            capability: ArcSwapOption::empty(),
            created_queue: Mutex::new(VecDeque::new()),
            received_notifications: Mutex::new(HashMap::new()),
            write_barrier: Mutex::new(()),
            codec,
            self_weak: RwLock::new(None),
        });

        *engine.self_weak.write() = Some(Arc::downgrade(&engine));
        let engine_dyn: Arc<dyn StoreObserver> = engine.clone();
        let observer: Weak<dyn StoreObserver> = Arc::downgrade(&engine_dyn);
        for store in engine.stores.values() {
            store.set_observer(observer.clone());
        }
        (engine, receiver)
    }

    pub fn settings(&self) -> &TenantSettings {
        &self.settings
    }

    pub fn store(&self, type_name: &str) -> Option<&Arc<ResourceStore>> {
        self.stores.get(type_name)
    }

    pub fn evaluator(&self) -> &Arc<SubscriptionEvaluator> {
        &self.evaluator
    }

    pub fn protected(&self) -> &ProtectedResources {
        &self.protected
    }

    pub fn value_sets(&self) -> &Arc<ValueSetIndex> {
        &self.value_sets
    }

    fn self_arc(&self) -> Option<Arc<TenantEngine>> {
        self.self_weak.read().as_ref().and_then(Weak::upgrade)
    }

    /// Evaluation context for search and trigger tests, wired to this
    /// tenant's stores and terminology index.
    fn eval_context(&self) -> EvalContext {
        let mut ctx = EvalContext::new().with_terminology(self.value_sets.clone());
        if let Some(engine) = self.self_arc() {
            ctx = ctx.with_resolver(engine);
        }
        ctx
    }

    fn absolute(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            relative
        )
    }

    // -- interaction routing ----------------------------------------------

    pub fn read(&self, type_name: &str, id: &str) -> OperationResponse {
        match self.store(type_name) {
            Some(store) => store.read(id),
            None => unknown_type(type_name),
        }
    }

    pub fn create(&self, type_name: &str, resource: Resource, allow_client_id: bool) -> OperationResponse {
        let Some(store) = self.store(type_name) else {
            return unknown_type(type_name);
        };
        let mut response = store.create(resource, allow_client_id);
        if let Some(location) = response.location.take() {
            response.location = Some(self.absolute(&location));
        }
        response
    }

    pub fn update(
        &self,
        type_name: &str,
        id: &str,
        resource: Resource,
        if_match: Option<&str>,
        if_none_match: Option<&str>,
    ) -> OperationResponse {
        let Some(store) = self.store(type_name) else {
            return unknown_type(type_name);
        };
        if resource.id() != Some(id) {
            return OperationResponse::error(
                StoreStatus::UnprocessableEntity,
                format!(
                    "resource id {} does not match the request path id {id}",
                    resource.id().unwrap_or("<none>")
                ),
            );
        }
        let mut response = store.update(resource, true, if_match, if_none_match, &self.protected);
        if let Some(location) = response.location.take() {
            response.location = Some(self.absolute(&location));
        }
        response
    }

    pub fn delete(&self, type_name: &str, id: &str) -> OperationResponse {
        match self.store(type_name) {
            Some(store) => store.delete(id, &self.protected),
            None => unknown_type(type_name),
        }
    }

    /// Type-level search; returns a searchset bundle.
    pub fn type_search(&self, type_name: &str, raw_query: &str) -> OperationResponse {
        let Some(store) = self.store(type_name) else {
            return unknown_type(type_name);
        };
        let registry = store.registry();
        let query = ParsedQuery::parse(raw_query, &registry);
        let eval = self.eval_context();

        let mut matches = store.search(&query.parameters, &self.path_cache, &eval);
        self.sort_matches(&mut matches, &query);
        let total = matches.len();

        if query.result.summary == SummaryMode::Count {
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "searchset",
                "total": total,
            });
            return bundle_response(bundle);
        }

        if let Some(count) = query.result.count {
            matches.truncate(count);
        }

        let includes = self.expand_includes(&matches, &query.result.includes, &query.result.revincludes);
        let bundle = self.search_bundle(type_name, &matches, &includes, total, &query);
        bundle_response(bundle)
    }

    /// System-level search across stores, honoring `_type`.
    pub fn system_search(&self, raw_query: &str) -> OperationResponse {
        let type_names = system_search_types(raw_query);
        let registry = common_registry();
        let query = ParsedQuery::parse(raw_query, &registry);
        let eval = self.eval_context();

        let mut matches = Vec::new();
        let selected: Vec<&str> = if type_names.is_empty() {
            SUPPORTED_TYPES.to_vec()
        } else {
            type_names.iter().map(String::as_str).collect()
        };
        for type_name in selected {
            if let Some(store) = self.store(type_name) {
                matches.extend(store.search(&query.parameters, &self.path_cache, &eval));
            }
        }
        self.sort_matches(&mut matches, &query);
        let total = matches.len();
        if let Some(count) = query.result.count {
            matches.truncate(count);
        }
        let bundle = self.search_bundle("", &matches, &[], total, &query);
        bundle_response(bundle)
    }

    fn sort_matches(&self, matches: &mut [Resource], query: &ParsedQuery) {
        for key in query.result.sort.iter().rev() {
            matches.sort_by(|a, b| {
                let ordering = match key.field.as_str() {
                    "_id" => a.id().cmp(&b.id()),
                    "_lastUpdated" => a.last_updated().cmp(&b.last_updated()),
                    field => {
                        let left = a.field(field).and_then(Value::as_str).unwrap_or("");
                        let right = b.field(field).and_then(Value::as_str).unwrap_or("");
                        left.cmp(right)
                    }
                };
                if key.descending { ordering.reverse() } else { ordering }
            });
        }
    }

    fn search_bundle(
        &self,
        type_name: &str,
        matches: &[Resource],
        includes: &[Resource],
        total: usize,
        query: &ParsedQuery,
    ) -> Value {
        let mut entries = Vec::new();
        for resource in matches {
            entries.push(json!({
                "fullUrl": self.absolute(&resource.key()),
                "resource": resource.as_json(),
                "search": {"mode": "match"},
            }));
        }
        for resource in includes {
            entries.push(json!({
                "fullUrl": self.absolute(&resource.key()),
                "resource": resource.as_json(),
                "search": {"mode": "include"},
            }));
        }

        let mut self_link = if type_name.is_empty() {
            self.absolute("_search")
        } else {
            self.absolute(type_name)
        };
        let query_string = query.self_link_query();
        if !query_string.is_empty() {
            self_link = format!("{self_link}?{query_string}");
        }

        json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "total": total,
            "link": [{"relation": "self", "url": self_link}],
            "entry": entries,
        })
    }

    // -- include expansion -------------------------------------------------

    /// Expand `_include` / `_revinclude` over the matched set. Iterating
    /// directives re-run against each round of newly added resources until
    /// a fixed point or the depth bound.
    pub fn expand_includes(
        &self,
        matches: &[Resource],
        includes: &[IncludeDirective],
        revincludes: &[IncludeDirective],
    ) -> Vec<Resource> {
        if includes.is_empty() && revincludes.is_empty() {
            return Vec::new();
        }

        let mut seen: HashSet<String> = matches.iter().map(Resource::key).collect();
        let mut collected = Vec::new();
        let mut frontier: Vec<Resource> = matches.to_vec();

        for depth in 0..=MAX_INCLUDE_DEPTH {
            let mut added = Vec::new();
            for focus in &frontier {
                for directive in includes {
                    if depth > 0 && !directive.iterate {
                        continue;
                    }
                    self.resolve_include(focus, directive, &mut seen, &mut added);
                }
                for directive in revincludes {
                    if depth > 0 && !directive.iterate {
                        continue;
                    }
                    self.resolve_revinclude(focus, directive, &mut seen, &mut added);
                }
            }
            if added.is_empty() {
                break;
            }
            collected.extend(added.iter().cloned());
            frontier = added;
        }
        collected
    }

    fn resolve_include(
        &self,
        focus: &Resource,
        directive: &IncludeDirective,
        seen: &mut HashSet<String>,
        out: &mut Vec<Resource>,
    ) {
        if directive.source_type != focus.type_name() {
            return;
        }
        let Some(store) = self.store(&directive.source_type) else {
            return;
        };
        let registry = store.registry();
        let Some(def) = registry.get(&directive.param) else {
            return;
        };
        let cache_key = format!("{}.{}", directive.source_type, directive.param);
        let Ok(expr) = self.path_cache.get_or_compile(&cache_key, &def.expression) else {
            return;
        };

        for element in expr.evaluate(focus.as_json(), &EvalContext::new()) {
            let Some(reference) = ResourceReference::from_element(&element) else {
                continue;
            };
            let (Some(target_type), Some(target_id)) =
                (reference.resource_type.as_deref(), reference.id.as_deref())
            else {
                continue;
            };
            if let Some(wanted) = &directive.target_type
                && wanted != target_type
            {
                continue;
            }
            let key = format!("{target_type}/{target_id}");
            if seen.contains(&key) {
                continue;
            }
            if let Some(target_store) = self.store(target_type)
                && let Some(resource) = target_store.get(target_id)
            {
                seen.insert(key);
                out.push(resource);
            }
        }
    }

    fn resolve_revinclude(
        &self,
        focus: &Resource,
        directive: &IncludeDirective,
        seen: &mut HashSet<String>,
        out: &mut Vec<Resource>,
    ) {
        let Some(store) = self.store(&directive.source_type) else {
            return;
        };
        // Synthesize `param=FocusType/focusId` against the reverse store.
        let parameter = ParsedSearchParameter::new(
            directive.param.clone(),
            vec![ParsedValue::with_comparator(
                emberfhir_search::SearchComparator::Eq,
                focus.key(),
            )],
        );
        let eval = self.eval_context();
        for resource in store.search(std::slice::from_ref(&parameter), &self.path_cache, &eval) {
            let key = resource.key();
            if seen.insert(key) {
                out.push(resource);
            }
        }
    }

    // -- bundles -----------------------------------------------------------

    /// Process a batch or transaction bundle.
    pub fn process_bundle(&self, bundle: Resource) -> OperationResponse {
        let bundle_type = bundle
            .field("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match bundle_type.as_str() {
            "batch" => self.process_batch(&bundle, "batch-response"),
            "transaction" => self.process_transaction(&bundle),
            other => OperationResponse::error(
                StoreStatus::BadRequest,
                format!("bundle type '{other}' is not processable; use batch or transaction"),
            ),
        }
    }

    fn bundle_entries(bundle: &Resource) -> Vec<Value> {
        bundle
            .field("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn process_batch(&self, bundle: &Resource, response_type: &str) -> OperationResponse {
        let mut entries = Vec::new();
        for entry in Self::bundle_entries(bundle) {
            let response = self.execute_entry(&entry);
            entries.push(entry_response(&response));
        }
        bundle_response(json!({
            "resourceType": "Bundle",
            "type": response_type,
            "entry": entries,
        }))
    }

    fn process_transaction(&self, bundle: &Resource) -> OperationResponse {
        let entries = Self::bundle_entries(bundle);

        // All-or-nothing: snapshot every store the bundle touches, execute
        // under the tenant-wide barrier, restore on the first failure.
        let _barrier = self.write_barrier.lock();

        let mut touched: HashSet<String> = HashSet::new();
        for entry in &entries {
            if let Some((type_name, _)) = split_entry_url(entry) {
                touched.insert(type_name);
            }
        }
        let snapshots: Vec<(String, Vec<Resource>)> = touched
            .iter()
            .filter_map(|t| self.store(t).map(|s| (t.clone(), s.snapshot())))
            .collect();

        let mut responses = Vec::new();
        for entry in &entries {
            let response = self.execute_entry(entry);
            if !response.is_success() {
                for (type_name, snapshot) in &snapshots {
                    if let Some(store) = self.store(type_name) {
                        store.restore(snapshot.clone());
                    }
                }
                let diagnostics = format!(
                    "transaction aborted: {}",
                    response.outcome.diagnostics()
                );
                return OperationResponse::error(response.status, diagnostics);
            }
            responses.push(entry_response(&response));
        }

        bundle_response(json!({
            "resourceType": "Bundle",
            "type": "transaction-response",
            "entry": responses,
        }))
    }

    fn execute_entry(&self, entry: &Value) -> OperationResponse {
        let method = entry
            .pointer("/request/method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_uppercase();
        let Some((type_name, id)) = split_entry_url(entry) else {
            return OperationResponse::error(
                StoreStatus::BadRequest,
                "bundle entry has no usable request.url",
            );
        };
        let resource = entry
            .get("resource")
            .cloned()
            .map(Resource::new)
            .transpose()
            .unwrap_or_default();

        let url = entry
            .pointer("/request/url")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();

        match method.as_str() {
            "GET" | "HEAD" => match &id {
                Some(id) => self.read(&type_name, id),
                None => self.type_search(&type_name, query),
            },
            "POST" => match resource {
                Some(resource) => self.create(&type_name, resource, true),
                None => OperationResponse::error(
                    StoreStatus::BadRequest,
                    "POST entry is missing a resource",
                ),
            },
            "PUT" => match (resource, id) {
                (Some(resource), Some(id)) => self.update(&type_name, &id, resource, None, None),
                _ => OperationResponse::error(
                    StoreStatus::BadRequest,
                    "PUT entry needs Type/id and a resource",
                ),
            },
            "DELETE" => match id {
                Some(id) => self.delete(&type_name, &id),
                None => OperationResponse::error(
                    StoreStatus::BadRequest,
                    "DELETE entry needs Type/id",
                ),
            },
            "PATCH" => OperationResponse::error(
                StoreStatus::NotImplemented,
                "PATCH bundle entries are not implemented",
            ),
            other => OperationResponse::error(
                StoreStatus::BadRequest,
                format!("bundle entry method '{other}' is not supported"),
            ),
        }
    }

    // -- capability document -----------------------------------------------

    /// Capability statement, cached until a SearchParameter registration
    /// invalidates it.
    pub fn capabilities(&self) -> Resource {
        if let Some(cached) = self.capability.load_full() {
            return (*cached).clone();
        }
        let built = self.build_capability();
        self.capability.store(Some(Arc::new(built.clone())));
        built
    }

    pub fn invalidate_capability(&self) {
        self.capability.store(None);
    }

    fn build_capability(&self) -> Resource {
        let mut type_names: Vec<&String> = self.stores.keys().collect();
        type_names.sort();

        let resources: Vec<Value> = type_names
            .iter()
            .map(|type_name| {
                let store = &self.stores[*type_name];
                let registry = store.registry();
                let mut params: Vec<&emberfhir_search::SearchParamDef> = registry.defs().collect();
                params.sort_by(|a, b| a.name.cmp(&b.name));
                let search_params: Vec<Value> = params
                    .iter()
                    .map(|def| {
                        let mut p = json!({
                            "name": def.name,
                            "type": def.param_type.as_str(),
                        });
                        if let Some(doc) = &def.documentation {
                            p["documentation"] = json!(doc);
                        }
                        p
                    })
                    .collect();
                json!({
                    "type": type_name,
                    "interaction": [
                        {"code": "read"},
                        {"code": "create"},
                        {"code": "update"},
                        {"code": "delete"},
                        {"code": "search-type"},
                    ],
                    "searchParam": search_params,
                })
            })
            .collect();

        let formats: Vec<&str> = self.settings.formats.iter().map(|f| f.mime()).collect();
        Resource::new(json!({
            "resourceType": "CapabilityStatement",
            "id": format!("{}-capabilities", self.settings.name),
            "status": "active",
            "date": emberfhir_core::now_utc().to_string(),
            "kind": "instance",
            "fhirVersion": self.settings.version.fhir_version_literal(),
            "format": formats,
            "software": {
                "name": "EmberFHIR",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "implementation": {
                "description": format!(
                    "In-memory tenant '{}'; _include:iterate depth bound {MAX_INCLUDE_DEPTH}",
                    self.settings.name
                ),
                "url": self.settings.base_url,
            },
            "rest": [{
                "mode": "server",
                "resource": resources,
                "interaction": [{"code": "batch"}, {"code": "transaction"}, {"code": "search-system"}],
            }],
        }))
        .expect("capability tree always carries a resourceType")
    }

    // -- housekeeping ------------------------------------------------------

    /// Capacity enforcement plus received-notification pruning; the manager
    /// runs this every 30 seconds.
    pub fn check_usage(&self) {
        self.enforce_capacity();
        self.prune_received_notifications(OffsetDateTime::now_utc());
    }

    fn enforce_capacity(&self) {
        let max = self.settings.max_resources;
        if max == 0 {
            return;
        }
        let mut queue = self.created_queue.lock();
        queue.retain(|key| {
            let (type_name, id) = key.split_once('/').unwrap_or((key.as_str(), ""));
            self.store(type_name).map(|s| s.contains(id)).unwrap_or(false)
        });
        while queue.len() > max {
            let Some(key) = queue.pop_front() else { break };
            if self.protected.contains(&key) {
                continue;
            }
            let Some((type_name, id)) = key.split_once('/') else {
                continue;
            };
            if let Some(store) = self.store(type_name) {
                tracing::info!(tenant = %self.settings.name, key = %key, "evicting resource over capacity");
                store.delete(id, &self.protected);
            }
        }
    }

    /// Record a notification received for a subscription reference.
    pub fn track_received_notification(&self, subscription_ref: &str) {
        self.received_notifications
            .lock()
            .entry(subscription_ref.to_string())
            .or_default()
            .push(OffsetDateTime::now_utc());
    }

    pub fn received_notification_count(&self, subscription_ref: &str) -> usize {
        self.received_notifications
            .lock()
            .get(subscription_ref)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop entries older than the TTL window and reap emptied references.
    pub fn prune_received_notifications(&self, now: OffsetDateTime) {
        let cutoff = now - RECEIVED_NOTIFICATION_TTL;
        let mut received = self.received_notifications.lock();
        for instants in received.values_mut() {
            instants.retain(|t| *t > cutoff);
        }
        received.retain(|_, instants| !instants.is_empty());
    }

    /// Heartbeat sweep; the manager runs this every 2 seconds.
    pub fn heartbeat_sweep(&self, now: OffsetDateTime) {
        self.evaluator.heartbeat(now);
    }

    // -- startup load ------------------------------------------------------

    /// Recursively load `*.json` / `*.xml` files from the configured
    /// directory, each as a create with client-assigned ids. Returns the
    /// number of resources loaded.
    pub fn load_directory(&self) -> Result<usize, CoreError> {
        let Some(dir) = &self.settings.load_directory else {
            return Ok(0);
        };
        let mut files = Vec::new();
        collect_load_files(dir, &mut files)?;
        files.sort();

        let mut loaded = 0;
        for path in files {
            let Some(format) = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(WireFormat::from_extension)
            else {
                continue;
            };
            let bytes = std::fs::read(&path).map_err(|e| {
                CoreError::configuration(format!("cannot read {}: {e}", path.display()))
            })?;
            let resource = match self.codec.parse(format, &bytes) {
                Ok(resource) => resource,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping unparseable load file");
                    continue;
                }
            };
            let type_name = resource.type_name().to_string();
            let response = self.create(&type_name, resource, true);
            if response.is_success() {
                loaded += 1;
                if self.settings.protect_loaded
                    && let Some(resource) = &response.resource
                {
                    self.protected.insert(resource.key());
                }
            } else {
                tracing::warn!(
                    file = %path.display(),
                    diagnostics = response.outcome.diagnostics(),
                    "load file rejected"
                );
            }
        }
        tracing::info!(tenant = %self.settings.name, loaded, "loaded startup content");
        Ok(loaded)
    }
}

impl std::fmt::Debug for TenantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantEngine")
            .field("tenant", &self.settings.name)
            .field("stores", &self.stores.len())
            .finish()
    }
}

// -- collaborator trait implementations -------------------------------------

impl StoreObserver for TenantEngine {
    fn validate(&self, resource: &Resource) -> Result<(), String> {
        if is_topic_resource(resource) {
            parse_topic(resource, self).map(|_| ()).map_err(|e| e.to_string())
        } else {
            match resource.type_name() {
                "Subscription" => parse_subscription(resource, self)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                "SearchParameter" => {
                    emberfhir_search::registry::from_search_parameter_resource(resource)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
                _ => Ok(()),
            }
        }
    }

    fn committed(&self, change: ResourceChange) {
        self.apply_side_effects(&change);

        if change.interaction == TriggerInteraction::Create
            && let Some(current) = &change.current
        {
            self.created_queue.lock().push_back(current.key());
        }

        // Trigger pipeline; errors here never fail the mutation.
        let Some(store) = self.store(&change.type_name) else {
            return;
        };
        let registry = store.registry();
        let mut eval = self.eval_context();
        if let Some(current) = &change.current {
            eval = eval.with_var("current", current.as_json().clone());
            eval = eval.with_var("resource", current.as_json().clone());
        }
        if let Some(previous) = &change.previous {
            eval = eval.with_var("previous", previous.as_json().clone());
        }
        let env = EvaluationEnv {
            registry: &registry,
            cache: &self.path_cache,
            eval: &eval,
            includes: self,
        };
        self.evaluator.evaluate(&change, &env);
    }
}

impl TenantEngine {
    fn apply_side_effects(&self, change: &ResourceChange) {
        let registered = change.current.as_ref();
        let removed = change.previous.as_ref();

        match change.type_name.as_str() {
            "SearchParameter" => {
                if let Some(previous) = removed
                    && let Ok((bases, def)) =
                        emberfhir_search::registry::from_search_parameter_resource(previous)
                {
                    for base in bases {
                        if let Some(store) = self.store(&base) {
                            store.unregister_search_param(&def.name);
                            self.path_cache.invalidate(&format!("{base}.{}", def.name));
                        }
                    }
                }
                if let Some(current) = registered
                    && let Ok((bases, def)) =
                        emberfhir_search::registry::from_search_parameter_resource(current)
                {
                    for base in bases {
                        if let Some(store) = self.store(&base) {
                            self.path_cache.invalidate(&format!("{base}.{}", def.name));
                            store.register_search_param(def.clone());
                            tracing::debug!(base = %base, name = %def.name, "registered search parameter");
                        }
                    }
                }
                self.invalidate_capability();
            }
            "ValueSet" => {
                if let Some(previous) = removed
                    && let Some(url) = previous.canonical_url()
                {
                    self.value_sets.remove(url);
                }
                if let Some(current) = registered {
                    self.value_sets.register(current);
                }
            }
            "Subscription" => {
                match registered {
                    Some(current) => {
                        if let Ok(parsed) = parse_subscription(current, self) {
                            self.evaluator.register_subscription(parsed);
                        }
                    }
                    None => {
                        if let Some(previous) = removed
                            && let Some(id) = previous.id()
                        {
                            self.evaluator.remove_subscription(id);
                        }
                    }
                }
            }
            _ => {
                let topic_changed = registered.map(is_topic_resource).unwrap_or(false)
                    || removed.map(is_topic_resource).unwrap_or(false);
                if topic_changed {
                    match registered {
                        Some(current) => {
                            if let Ok(topic) = parse_topic(current, self) {
                                self.evaluator.register_topic(topic);
                            }
                        }
                        None => {
                            if let Some(previous) = removed
                                && let Some(url) = previous.canonical_url()
                            {
                                self.evaluator.remove_topic(url);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl ElementResolver for TenantEngine {
    fn resolve(&self, reference: &str) -> Option<Resource> {
        let parsed = ResourceReference::parse(reference)?;
        let type_name = parsed.resource_type.as_deref()?;
        let id = parsed.id.as_deref()?;
        self.store(type_name)?.get(id)
    }
}

impl RegistrySource for TenantEngine {
    fn registry_for(&self, type_name: &str) -> Option<Arc<SearchParamRegistry>> {
        self.store(type_name).map(|s| s.registry())
    }
}

impl IncludeResolver for TenantEngine {
    fn notification_context(&self, focus: &Resource, shape: &NotificationShape) -> Vec<Resource> {
        let includes: Vec<IncludeDirective> = shape
            .includes
            .iter()
            .filter_map(|v| IncludeDirective::parse(v, false).ok())
            .collect();
        let revincludes: Vec<IncludeDirective> = shape
            .rev_includes
            .iter()
            .filter_map(|v| IncludeDirective::parse(v, false).ok())
            .collect();
        self.expand_includes(std::slice::from_ref(focus), &includes, &revincludes)
    }
}

// -- helpers ----------------------------------------------------------------

fn unknown_type(type_name: &str) -> OperationResponse {
    OperationResponse::error(
        StoreStatus::NotFound,
        format!("resource type '{type_name}' is not supported by this tenant"),
    )
}

fn bundle_response(bundle: Value) -> OperationResponse {
    match Resource::new(bundle) {
        Ok(resource) => OperationResponse::new(
            StoreStatus::Ok,
            OperationOutcome::info("search complete"),
        )
        .with_resource(resource),
        Err(e) => OperationResponse::error(StoreStatus::InternalError, e.to_string()),
    }
}

fn entry_response(response: &OperationResponse) -> Value {
    let status_line = format!("{}", response.status.http_code());
    let mut entry = json!({
        "response": {"status": status_line},
    });
    if let Some(tag) = &response.version_tag {
        entry["response"]["etag"] = json!(tag);
    }
    if let Some(location) = &response.location {
        entry["response"]["location"] = json!(location);
    }
    if let Some(resource) = &response.resource {
        entry["resource"] = resource.as_json().clone();
    } else if !response.is_success() {
        entry["response"]["outcome"] = response.outcome.to_resource().into_json();
    }
    entry
}

/// `(Type, Option<id>)` from a bundle entry's request url.
fn split_entry_url(entry: &Value) -> Option<(String, Option<String>)> {
    let url = entry.pointer("/request/url").and_then(Value::as_str)?;
    let path = url.split('?').next().unwrap_or(url);
    let mut segments = path.trim_matches('/').split('/');
    let type_name = segments.next()?.to_string();
    if type_name.is_empty() {
        return None;
    }
    let id = segments.next().map(str::to_string);
    Some((type_name, id))
}

fn common_registry() -> SearchParamRegistry {
    let mut registry = SearchParamRegistry::new();
    for def in emberfhir_search::registry::common_parameters() {
        registry.insert(def);
    }
    registry
}

/// `_type` values from a raw system-search query.
fn system_search_types(raw_query: &str) -> Vec<String> {
    let mut types = Vec::new();
    for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        if key == "_type" {
            types.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
    }
    types
}

fn collect_load_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<(), CoreError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| CoreError::configuration(format!("cannot read {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry
            .map_err(|e| CoreError::configuration(format!("cannot read {}: {e}", dir.display())))?;
        let path = entry.path();
        if path.is_dir() {
            collect_load_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberfhir_core::codec::JsonCodec;
    use emberfhir_core::FhirVersion;
    use emberfhir_subscriptions::NotificationType;
    use serde_json::json;

    fn engine_with(
        settings: TenantSettings,
    ) -> (Arc<TenantEngine>, mpsc::UnboundedReceiver<QueuedNotification>) {
        TenantEngine::new(settings, Arc::new(JsonCodec))
    }

    fn engine() -> (Arc<TenantEngine>, mpsc::UnboundedReceiver<QueuedNotification>) {
        engine_with(TenantSettings::new(
            "t",
            FhirVersion::R5,
            "http://localhost:5826/t",
        ))
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<QueuedNotification>) -> Vec<QueuedNotification> {
        let mut out = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            out.push(item);
        }
        out
    }

    fn resource(value: Value) -> Resource {
        Resource::new(value).unwrap()
    }

    #[test]
    fn create_returns_absolute_location_and_etag() {
        let (engine, _rx) = engine();
        let response = engine.create(
            "Patient",
            resource(json!({"resourceType": "Patient", "id": "p1"})),
            true,
        );
        assert_eq!(response.status, StoreStatus::Created);
        assert_eq!(
            response.location.as_deref(),
            Some("http://localhost:5826/t/Patient/p1")
        );
        assert_eq!(response.version_tag.as_deref(), Some("W/\"1\""));
    }

    #[test]
    fn unknown_type_is_not_found() {
        let (engine, _rx) = engine();
        let response = engine.read("FrobulatorDevice", "x");
        assert_eq!(response.status, StoreStatus::NotFound);
    }

    #[test]
    fn update_requires_matching_path_id() {
        let (engine, _rx) = engine();
        let response = engine.update(
            "Patient",
            "p1",
            resource(json!({"resourceType": "Patient", "id": "p2"})),
            None,
            None,
        );
        assert_eq!(response.status, StoreStatus::UnprocessableEntity);
    }

    #[test]
    fn revinclude_adds_referencing_resources() {
        let (engine, _rx) = engine();
        engine.create(
            "Patient",
            resource(json!({"resourceType": "Patient", "id": "p1"})),
            true,
        );
        engine.create(
            "Observation",
            resource(json!({
                "resourceType": "Observation",
                "id": "o1",
                "status": "final",
                "subject": {"reference": "Patient/p1"}
            })),
            true,
        );

        let response = engine.type_search("Patient", "_id=p1&_revinclude=Observation:subject");
        let bundle = response.resource.unwrap();
        let entries = bundle.as_json()["entry"].as_array().unwrap().clone();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["search"]["mode"], "match");
        assert_eq!(entries[0]["resource"]["id"], "p1");
        assert_eq!(entries[1]["search"]["mode"], "include");
        assert_eq!(entries[1]["resource"]["id"], "o1");
        assert_eq!(bundle.as_json()["total"], 1);
    }

    #[test]
    fn include_resolves_references_with_dedupe() {
        let (engine, _rx) = engine();
        engine.create(
            "Patient",
            resource(json!({"resourceType": "Patient", "id": "p1"})),
            true,
        );
        for id in ["o1", "o2"] {
            engine.create(
                "Observation",
                resource(json!({
                    "resourceType": "Observation",
                    "id": id,
                    "status": "final",
                    "subject": {"reference": "Patient/p1"}
                })),
                true,
            );
        }

        let response = engine.type_search("Observation", "_include=Observation:subject");
        let bundle = response.resource.unwrap();
        let entries = bundle.as_json()["entry"].as_array().unwrap().clone();
        // Two matches, one shared include.
        assert_eq!(entries.len(), 3);
        let include_count = entries
            .iter()
            .filter(|e| e["search"]["mode"] == "include")
            .count();
        assert_eq!(include_count, 1);
    }

    #[test]
    fn iterate_includes_follow_chains_with_cycle_protection() {
        let (engine, _rx) = engine();
        engine.create(
            "Patient",
            resource(json!({"resourceType": "Patient", "id": "p1"})),
            true,
        );
        engine.create(
            "Encounter",
            resource(json!({
                "resourceType": "Encounter",
                "id": "e1",
                "status": "finished",
                "subject": {"reference": "Patient/p1"}
            })),
            true,
        );
        engine.create(
            "Observation",
            resource(json!({
                "resourceType": "Observation",
                "id": "o1",
                "status": "final",
                "encounter": {"reference": "Encounter/e1"}
            })),
            true,
        );

        let response = engine.type_search(
            "Observation",
            "_id=o1&_include=Observation:encounter&_include:iterate=Encounter:subject",
        );
        let bundle = response.resource.unwrap();
        let entries = bundle.as_json()["entry"].as_array().unwrap().clone();
        let ids: Vec<&str> = entries
            .iter()
            .map(|e| e["resource"]["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["o1", "e1", "p1"]);
    }

    #[test]
    fn summary_count_returns_total_only() {
        let (engine, _rx) = engine();
        for id in ["p1", "p2"] {
            engine.create(
                "Patient",
                resource(json!({"resourceType": "Patient", "id": id})),
                true,
            );
        }
        let response = engine.type_search("Patient", "_summary=count");
        let bundle = response.resource.unwrap();
        assert_eq!(bundle.as_json()["total"], 2);
        assert!(bundle.as_json().get("entry").is_none());
    }

    #[test]
    fn capacity_evicts_oldest_non_protected() {
        let (engine, _rx) = engine_with(
            TenantSettings::new("t", FhirVersion::R4, "http://localhost:5826/t")
                .with_max_resources(2),
        );
        for id in ["a", "b", "c"] {
            engine.create(
                "Patient",
                resource(json!({"resourceType": "Patient", "id": id})),
                true,
            );
        }
        engine.check_usage();

        let store = engine.store("Patient").unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.contains("a"));
        assert!(store.contains("b"));
        assert!(store.contains("c"));
        assert_eq!(engine.read("Patient", "a").status, StoreStatus::NotFound);
    }

    #[test]
    fn capacity_skips_protected_resources() {
        let (engine, _rx) = engine_with(
            TenantSettings::new("t", FhirVersion::R4, "http://localhost:5826/t")
                .with_max_resources(2),
        );
        for id in ["a", "b", "c"] {
            engine.create(
                "Patient",
                resource(json!({"resourceType": "Patient", "id": id})),
                true,
            );
        }
        engine.protected().insert("Patient/a");
        engine.check_usage();

        let store = engine.store("Patient").unwrap();
        assert!(store.contains("a"));
        assert!(store.contains("b"));
        assert!(store.contains("c"));
    }

    #[test]
    fn transaction_rolls_back_on_failure() {
        let (engine, _rx) = engine();
        engine.create(
            "Patient",
            resource(json!({"resourceType": "Patient", "id": "existing"})),
            true,
        );

        let bundle = resource(json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "resource": {"resourceType": "Patient", "id": "new1"},
                    "request": {"method": "PUT", "url": "Patient/new1"}
                },
                {
                    "request": {"method": "DELETE", "url": "Patient/missing"}
                }
            ]
        }));
        let response = engine.process_bundle(bundle);
        assert!(!response.is_success());

        let store = engine.store("Patient").unwrap();
        assert!(store.contains("existing"));
        assert!(!store.contains("new1"));
    }

    #[test]
    fn batch_reports_per_entry_outcomes() {
        let (engine, _rx) = engine();
        let bundle = resource(json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {
                    "resource": {"resourceType": "Patient", "id": "b1"},
                    "request": {"method": "POST", "url": "Patient"}
                },
                {
                    "request": {"method": "DELETE", "url": "Patient/missing"}
                }
            ]
        }));
        let response = engine.process_bundle(bundle);
        assert!(response.is_success());
        let entries = response.resource.unwrap().as_json()["entry"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["response"]["status"], "201");
        assert_eq!(entries[1]["response"]["status"], "404");
        // The first entry committed despite the second failing.
        assert!(engine.store("Patient").unwrap().contains("b1"));
    }

    #[test]
    fn capability_is_cached_until_search_parameter_registration() {
        let (engine, _rx) = engine();
        let first = engine.capabilities();
        assert_eq!(first.type_name(), "CapabilityStatement");
        let again = engine.capabilities();
        assert_eq!(first, again);

        let response = engine.create(
            "SearchParameter",
            resource(json!({
                "resourceType": "SearchParameter",
                "id": "sp1",
                "url": "http://example.org/SearchParameter/pet-name",
                "code": "pet-name",
                "base": ["Patient"],
                "type": "string",
                "expression": "Patient.petName"
            })),
            true,
        );
        assert_eq!(response.status, StoreStatus::Created);

        let rebuilt = engine.capabilities();
        let rest = &rebuilt.as_json()["rest"][0]["resource"];
        let patient = rest
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["type"] == "Patient")
            .unwrap();
        let has_pet_name = patient["searchParam"]
            .as_array()
            .unwrap()
            .iter()
            .any(|p| p["name"] == "pet-name");
        assert!(has_pet_name);

        // And the parameter is immediately executable.
        engine.create(
            "Patient",
            resource(json!({"resourceType": "Patient", "id": "p1", "petName": "Rex"})),
            true,
        );
        let hits = engine.type_search("Patient", "pet-name=rex");
        let bundle = hits.resource.unwrap();
        assert_eq!(bundle.as_json()["total"], 1);
    }

    #[test]
    fn invalid_topic_fails_create_with_bad_request() {
        let (engine, _rx) = engine();
        let response = engine.create(
            "SubscriptionTopic",
            resource(json!({
                "resourceType": "SubscriptionTopic",
                "id": "t1",
                "status": "active"
            })),
            true,
        );
        assert_eq!(response.status, StoreStatus::BadRequest);
        assert_eq!(engine.evaluator().topic_count(), 0);
    }

    #[test]
    fn topic_subscription_and_mutation_produce_one_notification() {
        let (engine, mut rx) = engine();
        engine.create(
            "SubscriptionTopic",
            resource(json!({
                "resourceType": "SubscriptionTopic",
                "id": "t1",
                "url": "http://example.org/topics/encounter",
                "status": "active",
                "resourceTrigger": [{
                    "resource": "Encounter",
                    "supportedInteraction": ["create"]
                }]
            })),
            true,
        );
        engine.create(
            "Subscription",
            resource(json!({
                "resourceType": "Subscription",
                "id": "sub1",
                "status": "requested",
                "topic": "http://example.org/topics/encounter",
                "channelType": {"code": "rest-hook"},
                "endpoint": "http://example.org/x"
            })),
            true,
        );
        let queued = drain(&mut rx);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event_type, NotificationType::Handshake);

        engine.create(
            "Encounter",
            resource(json!({"resourceType": "Encounter", "id": "e1", "status": "planned"})),
            true,
        );
        let queued = drain(&mut rx);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event_type, NotificationType::EventNotification);
        let body: Value = serde_json::from_str(&queued[0].request.body).unwrap();
        assert_eq!(
            body["entry"][0]["resource"]["notificationEvent"][0]["eventNumber"],
            "1"
        );
        assert_eq!(queued[0].request.endpoint, "http://example.org/x");
    }

    #[test]
    fn deleted_subscription_goes_silent() {
        let (engine, mut rx) = engine();
        engine.create(
            "SubscriptionTopic",
            resource(json!({
                "resourceType": "SubscriptionTopic",
                "id": "t1",
                "url": "http://example.org/topics/encounter",
                "status": "active",
                "resourceTrigger": [{"resource": "Encounter", "supportedInteraction": ["create"]}]
            })),
            true,
        );
        engine.create(
            "Subscription",
            resource(json!({
                "resourceType": "Subscription",
                "id": "sub1",
                "status": "requested",
                "topic": "http://example.org/topics/encounter",
                "channelType": {"code": "rest-hook"},
                "endpoint": "http://example.org/x"
            })),
            true,
        );
        drain(&mut rx);

        let response = engine.delete("Subscription", "sub1");
        assert_eq!(response.status, StoreStatus::NoContent);
        assert_eq!(engine.evaluator().subscription_count(), 0);

        engine.create(
            "Encounter",
            resource(json!({"resourceType": "Encounter", "id": "e1"})),
            true,
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn notification_shape_adds_additional_context() {
        let (engine, mut rx) = engine();
        engine.create(
            "Patient",
            resource(json!({"resourceType": "Patient", "id": "p1"})),
            true,
        );
        engine.create(
            "SubscriptionTopic",
            resource(json!({
                "resourceType": "SubscriptionTopic",
                "id": "t1",
                "url": "http://example.org/topics/encounter",
                "status": "active",
                "resourceTrigger": [{"resource": "Encounter", "supportedInteraction": ["create"]}],
                "notificationShape": [{
                    "resource": "Encounter",
                    "include": ["Encounter:subject"]
                }]
            })),
            true,
        );
        engine.create(
            "Subscription",
            resource(json!({
                "resourceType": "Subscription",
                "id": "sub1",
                "status": "requested",
                "topic": "http://example.org/topics/encounter",
                "channelType": {"code": "rest-hook"},
                "endpoint": "http://example.org/x"
            })),
            true,
        );
        drain(&mut rx);

        engine.create(
            "Encounter",
            resource(json!({
                "resourceType": "Encounter",
                "id": "e1",
                "status": "planned",
                "subject": {"reference": "Patient/p1"}
            })),
            true,
        );
        let queued = drain(&mut rx);
        assert_eq!(queued.len(), 1);
        let body: Value = serde_json::from_str(&queued[0].request.body).unwrap();
        let entries = body["entry"].as_array().unwrap();
        // Status, focus, additional context.
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2]["resource"]["resourceType"], "Patient");
    }

    #[test]
    fn received_notifications_prune_after_ttl() {
        let (engine, _rx) = engine();
        engine.track_received_notification("Subscription/sub1");
        engine.track_received_notification("Subscription/sub1");
        assert_eq!(engine.received_notification_count("Subscription/sub1"), 2);

        engine.prune_received_notifications(OffsetDateTime::now_utc() + Duration::minutes(5));
        assert_eq!(engine.received_notification_count("Subscription/sub1"), 2);

        engine.prune_received_notifications(OffsetDateTime::now_utc() + Duration::minutes(11));
        assert_eq!(engine.received_notification_count("Subscription/sub1"), 0);
    }

    #[test]
    fn load_directory_creates_and_protects() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(
            dir.path().join("patient.json"),
            serde_json::to_vec(&json!({"resourceType": "Patient", "id": "loaded1"})).unwrap(),
        )
        .unwrap();
        std::fs::write(
            nested.join("obs.json"),
            serde_json::to_vec(&json!({
                "resourceType": "Observation",
                "id": "loaded2",
                "status": "final"
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let (engine, _rx) = engine_with(
            TenantSettings::new("t", FhirVersion::R4, "http://localhost:5826/t")
                .with_load_directory(dir.path())
                .with_protect_loaded(true),
        );
        let loaded = engine.load_directory().unwrap();
        assert_eq!(loaded, 2);
        assert!(engine.store("Patient").unwrap().contains("loaded1"));
        assert!(engine.store("Observation").unwrap().contains("loaded2"));

        // Protected content rejects mutation.
        let response = engine.delete("Patient", "loaded1");
        assert_eq!(response.status, StoreStatus::Unauthorized);
        let response = engine.update(
            "Patient",
            "loaded1",
            resource(json!({"resourceType": "Patient", "id": "loaded1", "active": false})),
            None,
            None,
        );
        assert_eq!(response.status, StoreStatus::Unauthorized);
    }

    #[test]
    fn system_search_honors_type_filter() {
        let (engine, _rx) = engine();
        engine.create(
            "Patient",
            resource(json!({"resourceType": "Patient", "id": "p1"})),
            true,
        );
        engine.create(
            "Observation",
            resource(json!({"resourceType": "Observation", "id": "o1", "status": "final"})),
            true,
        );

        let response = engine.system_search("_type=Patient");
        let bundle = response.resource.unwrap();
        assert_eq!(bundle.as_json()["total"], 1);

        let response = engine.system_search("_type=Patient,Observation");
        let bundle = response.resource.unwrap();
        assert_eq!(bundle.as_json()["total"], 2);
    }
}

//! Generic staged resource wrapper
//!
//! [`StagedResource`] owns one resource's representation together with its
//! pending ledger, its dependency graph and the wrappers of its named children.
//! Every concrete wrapper in this crate is a thin typed layer over it.
//!
//! Child wrappers exist twice: the committed view built from the last
//! representation, and the would-be view rebuilt after every staging call so
//! reads see pending writes.
//!
//! # Example
//!
//! ```ignore
//! let mut gateway = StagedResource::load("application-gateways", service, "rg1", "ag1").await?;
//! gateway.stage_add("backends", "pool1", json!({}))?;
//! gateway.commit().await?;
//! ```

use super::children::{ChildRegistry, ChildResource};
use super::registry::{get_kind, CollectionDef, KeyMode, ResourceKindDef};
use crate::arm::resource_id::{child_id, resource_id, ResourceId};
use crate::arm::service::ResourceService;
use crate::dag::{Creatable, DependencyGraph, TaskKey};
use crate::error::{FluentError, Result};
use crate::ledger::{EntityState, Ledger};
use crate::naming::{RandomNamer, ResourceNamer};
use crate::reconcile::{self, ReconcileReport};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Copies a dependency result (second argument) into a target payload.
pub type BindingFn = Arc<dyn Fn(&mut Value, &Value) + Send + Sync>;

/// Where a dependency result is written at commit time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingTarget {
    /// The resource's own representation
    Root,
    /// A named child, pending or existing
    Entity { collection: String, name: String },
}

#[derive(Clone)]
struct DependencyBinding {
    key: TaskKey,
    target: BindingTarget,
    apply: BindingFn,
}

/// Summary of the last successful commit
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub report: ReconcileReport,
    /// Dependency tasks that were part of this commit cycle
    pub dependencies_created: usize,
    pub committed_at: DateTime<Utc>,
}

type ChildMap = BTreeMap<String, BTreeMap<String, Box<dyn ChildResource>>>;

pub struct StagedResource {
    kind: ResourceKindDef,
    subscription_id: String,
    resource_group: String,
    name: String,
    inner: Value,
    ledger: Ledger,
    dependencies: DependencyGraph,
    bindings: Vec<DependencyBinding>,
    committed: ChildMap,
    children: ChildMap,
    factories: ChildRegistry,
    service: Arc<dyn ResourceService>,
    namer: Arc<dyn ResourceNamer>,
    last_commit: Option<CommitOutcome>,
}

impl fmt::Debug for StagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedResource")
            .field("kind", &self.kind.resource_type)
            .field("resource_group", &self.resource_group)
            .field("name", &self.name)
            .field("ledger", &self.ledger)
            .field("dependencies", &self.dependencies.keys())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl StagedResource {
    /// Start defining a new resource of the registered kind `kind_key`.
    pub fn define(
        kind_key: &str,
        service: Arc<dyn ResourceService>,
        resource_group: &str,
        name: &str,
    ) -> Result<Self> {
        let kind = lookup_kind(kind_key)?;
        Ok(Self::with_kind(
            kind,
            service,
            resource_group,
            name,
            json!({ "name": name }),
        ))
    }

    /// Wrap a representation that was read elsewhere.
    pub fn from_inner(
        kind_key: &str,
        service: Arc<dyn ResourceService>,
        resource_group: &str,
        inner: Value,
    ) -> Result<Self> {
        let kind = lookup_kind(kind_key)?;
        let name = inner
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| FluentError::Validation("representation has no name".to_string()))?
            .to_string();
        let subscription_id = inner
            .get("id")
            .and_then(Value::as_str)
            .and_then(ResourceId::parse)
            .map(|id| id.subscription_id)
            .unwrap_or_default();

        let mut resource = Self::with_kind(kind, service, resource_group, &name, inner);
        resource.subscription_id = subscription_id;
        resource.rebuild_children();
        Ok(resource)
    }

    /// Read an existing resource through `service`.
    pub async fn load(
        kind_key: &str,
        service: Arc<dyn ResourceService>,
        resource_group: &str,
        name: &str,
    ) -> Result<Self> {
        tracing::debug!("loading {} {}/{}", kind_key, resource_group, name);
        let inner = service
            .get_by_resource_group(resource_group, name)
            .await
            .map_err(|e| FluentError::remote("get", e))?;
        Self::from_inner(kind_key, service, resource_group, inner)
    }

    fn with_kind(
        kind: ResourceKindDef,
        service: Arc<dyn ResourceService>,
        resource_group: &str,
        name: &str,
        inner: Value,
    ) -> Self {
        Self {
            ledger: Ledger::new(kind.collection_names()),
            kind,
            subscription_id: String::new(),
            resource_group: resource_group.to_string(),
            name: name.to_string(),
            inner,
            dependencies: DependencyGraph::new(),
            bindings: Vec::new(),
            committed: ChildMap::new(),
            children: ChildMap::new(),
            factories: ChildRegistry::default(),
            service,
            namer: Arc::new(RandomNamer),
            last_commit: None,
        }
    }

    /// Subscription used to synthesize ids while the resource does not exist yet
    pub fn with_subscription(mut self, subscription_id: &str) -> Self {
        self.subscription_id = subscription_id.to_string();
        self
    }

    pub fn with_namer(mut self, namer: Arc<dyn ResourceNamer>) -> Self {
        self.namer = namer;
        self
    }

    pub fn with_child_registry(mut self, factories: ChildRegistry) -> Self {
        self.factories = factories;
        self.rebuild_children();
        self
    }

    pub fn kind(&self) -> &ResourceKindDef {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    /// Current authoritative representation
    pub fn inner(&self) -> &Value {
        &self.inner
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn dependencies(&self) -> &DependencyGraph {
        &self.dependencies
    }

    pub fn namer(&self) -> &dyn ResourceNamer {
        self.namer.as_ref()
    }

    pub fn last_commit(&self) -> Option<&CommitOutcome> {
        self.last_commit.as_ref()
    }

    /// Whether the resource has never been written
    pub fn is_in_create_mode(&self) -> bool {
        self.inner.get("id").and_then(Value::as_str).is_none()
    }

    /// The id the resource has, or will have once created
    pub fn future_resource_id(&self) -> String {
        match self.inner.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => resource_id(
                &self.subscription_id,
                &self.resource_group,
                &self.kind.provider,
                &self.kind.resource_type,
                &self.name,
            ),
        }
    }

    /// SubResource pointing at a child of this resource, e.g. for a rule's backend pool
    pub fn child_reference(&self, collection: &str, name: &str) -> Result<Value> {
        let def = self.collection_def(collection)?;
        let child_type = def.child_type.as_deref().unwrap_or(&def.name);
        Ok(json!({ "id": child_id(&self.future_resource_id(), child_type, name) }))
    }

    pub fn collection_def(&self, collection: &str) -> Result<&CollectionDef> {
        self.kind
            .collection(collection)
            .ok_or_else(|| FluentError::UnknownCollection(collection.to_string()))
    }

    /// Lifecycle tag of a child as seen through the pending ledger
    pub fn entity_state(&self, collection: &str, name: &str) -> Option<EntityState> {
        let def = self.kind.collection(collection)?;
        let exists = reconcile::find_entity(&self.inner, def, name).is_some();
        self.ledger
            .state_of(collection, &reconcile::normalize_key(def.key, name), exists)
    }

    /// Stage a new child. Fails if the name exists and is not staged for removal.
    pub fn stage_add(&mut self, collection: &str, name: &str, payload: Value) -> Result<&mut Self> {
        let def = self.collection_def(collection)?;
        let payload = normalize_payload(def, name, payload)?;
        let key = reconcile::normalize_key(def.key, name);

        match self.entity_state(collection, name) {
            Some(EntityState::Existing | EntityState::ToUpdate) => {
                return Err(FluentError::Validation(format!(
                    "{} '{}' already exists in {}",
                    collection, name, self.name
                )));
            }
            Some(EntityState::ToAdd) | Some(EntityState::ToRemove) | None => {}
        }

        self.ledger.stage_add(collection, &key, payload)?;
        self.rebuild_pending_children();
        Ok(self)
    }

    /// Stage removal of an existing or pending child.
    pub fn stage_remove(&mut self, collection: &str, name: &str) -> Result<&mut Self> {
        let key = reconcile::normalize_key(self.collection_def(collection)?.key, name);
        if self.entity_state(collection, name).is_none() {
            return Err(FluentError::Validation(format!(
                "{} '{}' not found in {}",
                collection, name, self.name
            )));
        }
        self.ledger.stage_remove(collection, &key)?;
        self.rebuild_pending_children();
        Ok(self)
    }

    /// Stage an edit of an existing or pending child.
    pub fn stage_update<F>(&mut self, collection: &str, name: &str, mutator: F) -> Result<&mut Self>
    where
        F: Fn(&mut Value) + Send + Sync + 'static,
    {
        let key = reconcile::normalize_key(self.collection_def(collection)?.key, name);
        match self.entity_state(collection, name) {
            Some(EntityState::ToRemove) => {
                return Err(FluentError::Validation(format!(
                    "{} '{}' is staged for removal",
                    collection, name
                )));
            }
            None => {
                return Err(FluentError::Validation(format!(
                    "{} '{}' not found in {}",
                    collection, name, self.name
                )));
            }
            Some(_) => {}
        }
        self.ledger.stage_update(collection, &key, Arc::new(mutator))?;
        self.rebuild_pending_children();
        Ok(self)
    }

    /// Stage detachment of everything the collection currently holds.
    pub fn stage_clear(&mut self, collection: &str) -> Result<&mut Self> {
        self.ledger.stage_clear(collection)?;
        self.rebuild_pending_children();
        Ok(self)
    }

    /// Stage an edit of the resource's own fields.
    pub fn stage_root_update<F>(&mut self, mutator: F) -> &mut Self
    where
        F: Fn(&mut Value) + Send + Sync + 'static,
    {
        self.ledger.stage_root_update(Arc::new(mutator));
        self.rebuild_pending_children();
        self
    }

    /// Register a resource that must be created before this one is written.
    pub fn register_dependency(&mut self, unit: Arc<dyn Creatable>) -> TaskKey {
        self.dependencies.register_dependency(unit)
    }

    /// Copy the result of dependency `key` into `target` at commit time.
    pub fn bind_dependency<F>(&mut self, key: &str, target: BindingTarget, apply: F) -> Result<&mut Self>
    where
        F: Fn(&mut Value, &Value) + Send + Sync + 'static,
    {
        if self.dependencies.state(key).is_none() {
            return Err(FluentError::UnknownDependency(key.to_string()));
        }
        let target = match target {
            BindingTarget::Entity { collection, name } => {
                let name = reconcile::normalize_key(self.collection_def(&collection)?.key, &name);
                BindingTarget::Entity { collection, name }
            }
            BindingTarget::Root => BindingTarget::Root,
        };
        self.bindings.push(DependencyBinding {
            key: key.to_string(),
            target,
            apply: Arc::new(apply),
        });
        Ok(self)
    }

    /// Child wrappers of a collection as they will be once the ledger is
    /// applied, in key order
    pub fn children(&self, collection: &str) -> Vec<&dyn ChildResource> {
        child_list(&self.children, collection)
    }

    /// Child wrappers of a collection as of the last read or commit
    pub fn committed_children(&self, collection: &str) -> Vec<&dyn ChildResource> {
        child_list(&self.committed, collection)
    }

    /// Would-be child of a collection as its concrete wrapper type
    pub fn child<T: ChildResource + 'static>(&self, collection: &str, name: &str) -> Option<&T> {
        let def = self.kind.collection(collection)?;
        self.children
            .get(collection)?
            .get(&reconcile::normalize_key(def.key, name))?
            .as_any()
            .downcast_ref::<T>()
    }

    /// Would-be entities of a collection once the ledger is applied
    pub fn pending_view(&self, collection: &str) -> Result<Vec<Value>> {
        let def = self.collection_def(collection)?;
        let (preview, _) = self.preview();
        Ok(reconcile::entities(&preview, def).to_vec())
    }

    /// Reconcile the ledger onto a copy of the representation. No dependency
    /// is created and the service is not called.
    pub fn preview(&self) -> (Value, ReconcileReport) {
        let mut working = self.inner.clone();
        let report = reconcile::reconcile(&mut working, &self.kind, &self.ledger);
        (working, report)
    }

    /// Create pending dependencies, reconcile the ledger and write the
    /// resource with a single create-or-update call.
    ///
    /// On failure nothing local changes: the representation and the ledger are
    /// kept and completed dependencies are not created again on retry.
    pub async fn commit(&mut self) -> Result<&Value> {
        if self.dependencies.has_pending() {
            self.dependencies.resolve_all().await?;
        }

        let mut working = self.inner.clone();
        let mut ledger = self.ledger.clone();
        self.apply_bindings(&mut working, &mut ledger)?;
        let report = reconcile::reconcile(&mut working, &self.kind, &ledger);

        tracing::info!(
            "committing {} {}/{} (removed {}, added {}, updated {}, cleared {} references)",
            self.kind.display_name,
            self.resource_group,
            self.name,
            report.removed,
            report.added,
            report.updated,
            report.cleared_references
        );

        let response = self
            .service
            .create_or_update(&self.resource_group, &self.name, &working)
            .await
            .map_err(|e| {
                tracing::error!("createOrUpdate of {} failed: {:#}", self.name, e);
                FluentError::remote("createOrUpdate", e)
            })?;

        self.inner = if response.is_null() { working } else { response };
        self.last_commit = Some(CommitOutcome {
            report,
            dependencies_created: self.dependencies.len(),
            committed_at: Utc::now(),
        });
        self.ledger.clear();
        self.bindings.clear();
        self.dependencies.clear();
        self.rebuild_children();
        Ok(&self.inner)
    }

    /// [`commit`](Self::commit) on a private current-thread runtime.
    ///
    /// Fails with `Validation` when called from inside a Tokio runtime, where
    /// blocking on the commit would stall the caller's executor.
    pub fn commit_blocking(&mut self) -> Result<&Value> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(FluentError::Validation(
                "commit_blocking called inside an async runtime, use commit().await".to_string(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FluentError::remote("commit", e.into()))?;
        runtime.block_on(self.commit())
    }

    /// Re-read the resource. Staged operations are kept.
    pub async fn refresh(&mut self) -> Result<&Value> {
        let inner = self
            .service
            .get_by_resource_group(&self.resource_group, &self.name)
            .await
            .map_err(|e| FluentError::remote("get", e))?;
        self.inner = inner;
        self.rebuild_children();
        Ok(&self.inner)
    }

    /// Delete the remote resource.
    pub async fn delete(self) -> Result<()> {
        self.service
            .delete(&self.resource_group, &self.name)
            .await
            .map_err(|e| FluentError::remote("delete", e))
    }

    fn apply_bindings(&self, working: &mut Value, ledger: &mut Ledger) -> Result<()> {
        for binding in &self.bindings {
            let result = self
                .dependencies
                .result(&binding.key)
                .ok_or_else(|| FluentError::UnknownDependency(binding.key.clone()))?;

            match &binding.target {
                BindingTarget::Root => (binding.apply)(working, result),
                BindingTarget::Entity { collection, name } => {
                    if let Some(payload) = ledger.pending_add_mut(collection, name) {
                        (binding.apply)(payload, result);
                        continue;
                    }
                    let def = self.collection_def(collection)?;
                    let entity = reconcile::find_entity_mut(working, def, name).ok_or_else(|| {
                        FluentError::Validation(format!(
                            "binding target {}/{} does not exist",
                            collection, name
                        ))
                    })?;
                    (binding.apply)(entity, result);
                }
            }
        }
        Ok(())
    }

    fn rebuild_children(&mut self) {
        self.committed = self.wrap_children(&self.inner);
        self.rebuild_pending_children();
    }

    fn rebuild_pending_children(&mut self) {
        let (preview, _) = self.preview();
        self.children = self.wrap_children(&preview);
    }

    fn wrap_children(&self, representation: &Value) -> ChildMap {
        let parent_id = self.future_resource_id();
        let mut children = ChildMap::new();
        for def in &self.kind.collections {
            let wrappers = reconcile::entities(representation, def)
                .iter()
                .filter_map(|entity| {
                    let key = reconcile::entity_key(entity, def.key)?;
                    let wrapper = self.factories.build(&def.name, &key, entity, &parent_id);
                    Some((key, wrapper))
                })
                .collect();
            children.insert(def.name.clone(), wrappers);
        }
        children
    }
}

fn child_list<'a>(children: &'a ChildMap, collection: &str) -> Vec<&'a dyn ChildResource> {
    children
        .get(collection)
        .map(|c| c.values().map(|child| child.as_ref()).collect())
        .unwrap_or_default()
}

fn lookup_kind(kind_key: &str) -> Result<ResourceKindDef> {
    get_kind(kind_key)
        .cloned()
        .ok_or_else(|| FluentError::UnknownResourceKind(kind_key.to_string()))
}

/// Make sure a staged payload carries the key it is staged under.
fn normalize_payload(def: &CollectionDef, name: &str, payload: Value) -> Result<Value> {
    let mut payload = match payload {
        Value::Null => json!({}),
        Value::Object(_) => payload,
        _ => {
            return Err(FluentError::Validation(format!(
                "payload of {} '{}' must be an object",
                def.name, name
            )))
        }
    };

    match def.key {
        KeyMode::Name => {
            if let Some(obj) = payload.as_object_mut() {
                obj.entry("name").or_insert_with(|| Value::from(name));
            }
            if payload["name"].as_str() != Some(name) {
                return Err(FluentError::Validation(format!(
                    "payload name does not match '{}'",
                    name
                )));
            }
        }
        KeyMode::Id => {
            let id = payload.get("id").and_then(Value::as_str);
            if !id.is_some_and(|id| id.eq_ignore_ascii_case(name)) {
                return Err(FluentError::Validation(format!(
                    "{} entries need an id matching '{}'",
                    def.name, name
                )));
            }
        }
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::service::mock::EchoService;
    use crate::dag::ResourceDefinition;
    use crate::resource::children::DataDisk;

    fn gateway(service: Arc<EchoService>) -> StagedResource {
        StagedResource::define("application-gateways", service, "rg1", "ag1")
            .unwrap()
            .with_subscription("sub1")
    }

    #[tokio::test]
    async fn test_commit_adds_backend_once() {
        let service = Arc::new(EchoService::default());
        let mut ag = gateway(Arc::clone(&service));
        ag.stage_add("backends", "pool1", json!({})).unwrap();
        ag.stage_add("backends", "pool1", json!({})).unwrap();

        let inner = ag.commit().await.unwrap();
        assert_eq!(inner["properties"]["backendAddressPools"].as_array().unwrap().len(), 1);
        assert_eq!(service.writes(), 1);
        assert!(ag.ledger().is_empty());
        assert_eq!(ag.children("backends").len(), 1);
        assert_eq!(ag.last_commit().unwrap().report.added, 1);
    }

    #[tokio::test]
    async fn test_new_disks_get_luns_zero_and_one() {
        let service = Arc::new(EchoService::default());
        let mut vmss = StagedResource::define("virtual-machine-scale-sets", service, "rg1", "vmss1").unwrap();
        vmss.stage_add("dataDisks", "d1", json!({ "lun": -1, "diskSizeGB": 100 }))
            .unwrap()
            .stage_add("dataDisks", "d2", json!({ "lun": -1, "diskSizeGB": 200 }))
            .unwrap();
        vmss.commit().await.unwrap();

        assert_eq!(vmss.child::<DataDisk>("dataDisks", "d1").unwrap().lun(), Some(0));
        assert_eq!(vmss.child::<DataDisk>("dataDisks", "d2").unwrap().lun(), Some(1));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_state() {
        let service = Arc::new(EchoService::failing(1));
        let mut ag = gateway(Arc::clone(&service));
        ag.stage_add("probes", "probe1", json!({ "properties": { "path": "/" } })).unwrap();
        let before = ag.inner().clone();

        let err = ag.commit().await.unwrap_err();
        assert!(matches!(err, FluentError::RemoteOperation { ref operation, .. } if operation == "createOrUpdate"));
        assert_eq!(ag.inner(), &before);
        assert_eq!(ag.entity_state("probes", "probe1"), Some(EntityState::ToAdd));
        assert!(ag.last_commit().is_none());

        ag.commit().await.unwrap();
        assert_eq!(ag.entity_state("probes", "probe1"), Some(EntityState::Existing));
        assert_eq!(service.writes(), 2);
    }

    #[tokio::test]
    async fn test_retry_does_not_recreate_dependencies() {
        let parent = Arc::new(EchoService::failing(1));
        let deps = Arc::new(EchoService::default());
        let mut ag = gateway(Arc::clone(&parent));

        let pip: Arc<dyn Creatable> = Arc::new(ResourceDefinition::new(
            deps.clone(),
            "rg1",
            "pip1",
            json!({ "id": "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/publicIPAddresses/pip1" }),
        ));
        let key = ag.register_dependency(pip);
        ag.stage_add("frontends", "fe1", json!({})).unwrap();
        ag.bind_dependency(
            &key,
            BindingTarget::Entity { collection: "frontends".into(), name: "fe1".into() },
            |frontend, pip| frontend["properties"]["publicIPAddress"] = json!({ "id": pip["id"] }),
        )
        .unwrap();

        assert!(ag.commit().await.is_err());
        ag.commit().await.unwrap();

        assert_eq!(deps.writes(), 1);
        let frontend = &ag.inner()["properties"]["frontendIPConfigurations"][0];
        assert!(frontend["properties"]["publicIPAddress"]["id"]
            .as_str()
            .unwrap()
            .ends_with("/publicIPAddresses/pip1"));
        assert!(ag.dependencies().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_failure_skips_parent_write() {
        let parent = Arc::new(EchoService::default());
        let deps = Arc::new(EchoService::failing(1));
        let mut ag = gateway(Arc::clone(&parent));
        ag.register_dependency(Arc::new(ResourceDefinition::new(deps, "rg1", "pip1", json!({}))));

        let err = ag.commit().await.unwrap_err();
        assert!(matches!(err, FluentError::DependencyExecution { .. }));
        assert_eq!(parent.writes(), 0);
    }

    #[tokio::test]
    async fn test_root_binding_substitutes_result() {
        let service = Arc::new(EchoService::default());
        let deps = Arc::new(EchoService::default());
        let mut ag = gateway(Arc::clone(&service));
        let key = ag.register_dependency(Arc::new(ResourceDefinition::new(
            deps,
            "rg1",
            "group",
            json!({ "location": "westeurope" }),
        )));
        ag.bind_dependency(&key, BindingTarget::Root, |inner, group| {
            inner["location"] = group["location"].clone();
        })
        .unwrap();

        ag.commit().await.unwrap();
        assert_eq!(ag.inner()["location"], "westeurope");
    }

    #[test]
    fn test_staging_validation() {
        let service = Arc::new(EchoService::default());
        let inner = json!({
            "id": "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/applicationGateways/ag1",
            "name": "ag1",
            "properties": { "probes": [ { "name": "probe1" } ] }
        });
        let mut ag = StagedResource::from_inner("application-gateways", service, "rg1", inner).unwrap();

        assert!(!ag.is_in_create_mode());
        assert!(matches!(
            ag.stage_add("probes", "probe1", json!({})),
            Err(FluentError::Validation(_))
        ));
        assert!(matches!(
            ag.stage_update("probes", "missing", |_| {}),
            Err(FluentError::Validation(_))
        ));
        assert!(matches!(
            ag.stage_remove("backends", "missing"),
            Err(FluentError::Validation(_))
        ));
        assert!(matches!(
            ag.stage_add("nope", "x", json!({})),
            Err(FluentError::UnknownCollection(_))
        ));

        // replacing an existing entity is a remove followed by an add
        ag.stage_remove("probes", "probe1").unwrap();
        ag.stage_add("probes", "probe1", json!({ "port": 81 })).unwrap();
        assert_eq!(ag.pending_view("probes").unwrap(), vec![json!({ "name": "probe1", "port": 81 })]);
    }

    #[test]
    fn test_child_reference_uses_child_type() {
        let ag = gateway(Arc::new(EchoService::default()));
        assert!(ag.is_in_create_mode());
        assert_eq!(
            ag.child_reference("backends", "pool1").unwrap()["id"],
            "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/applicationGateways/ag1/backendAddressPools/pool1"
        );
    }

    #[test]
    fn test_commit_blocking_matches_async() {
        let service = Arc::new(EchoService::default());
        let mut ag = gateway(Arc::clone(&service));
        ag.stage_add("frontendPorts", "port80", json!({ "properties": { "port": 80 } }))
            .unwrap();
        ag.commit_blocking().unwrap();
        assert_eq!(ag.entity_state("frontendPorts", "port80"), Some(EntityState::Existing));
        assert_eq!(service.writes(), 1);
    }

    #[tokio::test]
    async fn test_commit_blocking_rejected_inside_runtime() {
        let service = Arc::new(EchoService::default());
        let mut ag = gateway(Arc::clone(&service));
        ag.stage_add("backends", "pool1", json!({})).unwrap();

        assert!(matches!(ag.commit_blocking(), Err(FluentError::Validation(_))));
        assert_eq!(service.writes(), 0);
        assert_eq!(ag.entity_state("backends", "pool1"), Some(EntityState::ToAdd));
    }

    #[tokio::test]
    async fn test_children_read_pending_writes() {
        let service = Arc::new(EchoService::default());
        let mut vmss = StagedResource::define("virtual-machine-scale-sets", service, "rg1", "vmss1").unwrap();
        vmss.stage_add("dataDisks", "d1", json!({ "lun": -1, "diskSizeGB": 100 })).unwrap();

        assert_eq!(vmss.children("dataDisks").len(), 1);
        assert!(vmss.committed_children("dataDisks").is_empty());
        assert_eq!(vmss.child::<DataDisk>("dataDisks", "d1").unwrap().lun(), Some(0));

        vmss.stage_update("dataDisks", "d1", |disk| disk["diskSizeGB"] = json!(128)).unwrap();
        assert_eq!(vmss.child::<DataDisk>("dataDisks", "d1").unwrap().size_in_gb(), Some(128));

        vmss.commit().await.unwrap();
        vmss.stage_remove("dataDisks", "d1").unwrap();
        assert!(vmss.children("dataDisks").is_empty());
        assert_eq!(vmss.committed_children("dataDisks").len(), 1);
    }

    #[test]
    fn test_id_keyed_entries_use_full_id() {
        let service = Arc::new(EchoService::default());
        let mut vmss = StagedResource::define("virtual-machine-scale-sets", service, "rg1", "vmss1").unwrap();
        let public = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/public/backendAddressPools/backend";
        let internal = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/internal/backendAddressPools/backend";

        vmss.stage_add("loadBalancerBackends", public, json!({ "id": public })).unwrap();
        vmss.stage_add("loadBalancerBackends", internal, json!({ "id": internal })).unwrap();
        assert_eq!(vmss.children("loadBalancerBackends").len(), 2);
        assert_eq!(
            vmss.entity_state("loadBalancerBackends", &public.to_uppercase()),
            Some(EntityState::ToAdd)
        );
        assert!(matches!(
            vmss.stage_add("loadBalancerBackends", "backend", json!({ "id": public })),
            Err(FluentError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_and_delete() {
        let service = Arc::new(EchoService::default());
        let mut ag = gateway(Arc::clone(&service));
        ag.stage_add("backends", "pool1", json!({})).unwrap();
        ag.commit().await.unwrap();

        let mut again = StagedResource::load("application-gateways", service.clone(), "rg1", "ag1")
            .await
            .unwrap();
        assert_eq!(again.children("backends")[0].name(), "pool1");
        again.refresh().await.unwrap();
        again.delete().await.unwrap();
        assert!(service.last_body.lock().unwrap().is_none());
    }
}

//! Virtual machine scale set wrapper
//!
//! Adds the scale set specific parts on top of [`StagedResource`]: create-mode
//! defaults and OS disk containers for unmanaged disks, which need a storage
//! account that may have to be created first.

use super::capabilities::{HasDataDisks, HasExtensions, HasLoadBalancerAssociations, Staged};
use super::staged::{BindingTarget, StagedResource};
use crate::arm::resource_id::{merge_path, name_from_resource_id};
use crate::arm::service::ResourceService;
use crate::dag::{Creatable, ResourceDefinition, TaskKey};
use crate::error::{FluentError, Result};
use crate::reconcile;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

pub const KIND: &str = "virtual-machine-scale-sets";

const OS_DISK: &str = "/properties/virtualMachineProfile/storageProfile/osDisk";
const VHD_CONTAINERS: &str = "/properties/virtualMachineProfile/storageProfile/osDisk/vhdContainers";
const DEFAULT_CONTAINER: &str = "vhds";
const DEFAULT_CAPACITY: u64 = 2;

pub struct ScaleSet {
    resource: StagedResource,
    region: Option<String>,
    storage_service: Option<Arc<dyn ResourceService>>,
    unmanaged_disks: bool,
    /// Storage accounts created for this commit cycle
    storage_account_keys: Vec<TaskKey>,
    /// Blob endpoints of existing accounts attached this cycle
    existing_storage_accounts: Vec<String>,
    defaults_staged: bool,
}

impl fmt::Debug for ScaleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScaleSet")
            .field("resource", &self.resource)
            .field("region", &self.region)
            .field("unmanaged_disks", &self.unmanaged_disks)
            .field("storage_account_keys", &self.storage_account_keys)
            .finish()
    }
}

impl ScaleSet {
    pub fn define(service: Arc<dyn ResourceService>, resource_group: &str, name: &str) -> Result<Self> {
        Ok(Self::from_staged(StagedResource::define(
            KIND,
            service,
            resource_group,
            name,
        )?))
    }

    pub async fn load(service: Arc<dyn ResourceService>, resource_group: &str, name: &str) -> Result<Self> {
        Ok(Self::from_staged(
            StagedResource::load(KIND, service, resource_group, name).await?,
        ))
    }

    pub fn from_staged(resource: StagedResource) -> Self {
        let region = resource
            .inner()
            .get("location")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            resource,
            region,
            storage_service: None,
            unmanaged_disks: false,
            storage_account_keys: Vec::new(),
            existing_storage_accounts: Vec::new(),
            defaults_staged: false,
        }
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn with_region(&mut self, region: &str) -> &mut Self {
        self.region = Some(region.to_string());
        let region = region.to_string();
        self.resource.stage_root_update(move |inner| {
            if let Some(obj) = inner.as_object_mut() {
                obj.insert("location".into(), json!(region));
            }
        });
        self
    }

    pub fn with_sku(&mut self, sku_name: &str, tier: &str) -> &mut Self {
        let sku_name = sku_name.to_string();
        let tier = tier.to_string();
        self.resource.stage_root_update(move |inner| {
            if let Some(sku) = reconcile::ensure_object(inner, "/sku") {
                sku.insert("name".into(), json!(sku_name));
                sku.insert("tier".into(), json!(tier));
            }
        });
        self
    }

    pub fn with_capacity(&mut self, capacity: u64) -> &mut Self {
        self.resource.stage_root_update(move |inner| {
            if let Some(sku) = reconcile::ensure_object(inner, "/sku") {
                sku.insert("capacity".into(), json!(capacity));
            }
        });
        self
    }

    /// Keep OS disks as VHDs in storage accounts created through `storage_service`.
    pub fn with_unmanaged_disks(&mut self, storage_service: Arc<dyn ResourceService>) -> &mut Self {
        self.unmanaged_disks = true;
        self.storage_service = Some(storage_service);
        self
    }

    pub fn is_managed_disk_enabled(&self) -> bool {
        !self.unmanaged_disks
    }

    /// Create a storage account for the OS disk containers before the scale set.
    pub fn with_new_storage_account(&mut self, name: &str) -> Result<&mut Self> {
        let service = self.storage_service.clone().ok_or_else(|| {
            FluentError::Validation("new storage accounts need unmanaged disks".to_string())
        })?;
        let region = self.region.clone().ok_or_else(|| {
            FluentError::Validation("region must be set before defining a storage account".to_string())
        })?;

        let account: Arc<dyn Creatable> = Arc::new(
            ResourceDefinition::new(
                service,
                self.resource.resource_group(),
                name,
                json!({
                    "location": region,
                    "kind": "Storage",
                    "sku": { "name": "Standard_LRS" }
                }),
            )
            .with_key_prefix("storage"),
        );
        self.with_new_storage_account_creatable(account)
    }

    /// Like [`with_new_storage_account`](Self::with_new_storage_account) for a
    /// caller-built definition. Its result must carry `properties.primaryEndpoints.blob`.
    pub fn with_new_storage_account_creatable(&mut self, account: Arc<dyn Creatable>) -> Result<&mut Self> {
        let key = self.resource.register_dependency(account);
        let container = self.container_name();
        self.resource
            .bind_dependency(&key, BindingTarget::Root, move |inner, account| {
                match account
                    .pointer("/properties/primaryEndpoints/blob")
                    .and_then(Value::as_str)
                {
                    Some(blob) => push_vhd_container(inner, merge_path(blob, &container)),
                    None => tracing::warn!("storage account result has no blob endpoint"),
                }
            })?;
        self.storage_account_keys.push(key);
        Ok(self)
    }

    /// Put OS disk containers into an existing storage account.
    pub fn with_existing_storage_account(&mut self, account: &Value) -> Result<&mut Self> {
        let blob = account
            .pointer("/properties/primaryEndpoints/blob")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                FluentError::Validation("storage account has no primary blob endpoint".to_string())
            })?;
        let url = merge_path(blob, &self.container_name());
        self.existing_storage_accounts.push(blob.to_string());
        self.resource
            .stage_root_update(move |inner| push_vhd_container(inner, url.clone()));
        Ok(self)
    }

    /// OS disk container URLs
    pub fn vhd_containers(&self) -> Vec<String> {
        self.resource
            .inner()
            .pointer(VHD_CONTAINERS)
            .and_then(Value::as_array)
            .map(|urls| urls.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Container of the first existing VHD URL, or `vhds`
    fn container_name(&self) -> String {
        self.vhd_containers()
            .first()
            .map(|url| name_from_resource_id(url).to_string())
            .unwrap_or_else(|| DEFAULT_CONTAINER.to_string())
    }

    /// Stage create-mode defaults and register the implicit storage account.
    pub fn before_commit(&mut self) -> Result<()> {
        if self.unmanaged_disks && self.has_pending_data_disks()? {
            return Err(FluentError::Validation(
                "data disks cannot be combined with unmanaged disks".to_string(),
            ));
        }
        if !self.resource.is_in_create_mode() {
            return Ok(());
        }

        if !self.defaults_staged {
            self.stage_create_defaults();
            self.defaults_staged = true;
        }

        let has_containers = !self.vhd_containers().is_empty();
        if self.unmanaged_disks
            && !has_containers
            && self.storage_account_keys.is_empty()
            && self.existing_storage_accounts.is_empty()
        {
            let name = self
                .resource
                .namer()
                .unique_name("stg", 24)
                .replace('-', "");
            tracing::info!("scale set {} gets default storage account {}", self.resource.name(), name);
            self.with_new_storage_account(&name)?;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<&Value> {
        self.before_commit()?;
        self.resource.commit().await?;
        self.after_commit();
        Ok(self.resource.inner())
    }

    pub fn commit_blocking(&mut self) -> Result<&Value> {
        self.before_commit()?;
        self.resource.commit_blocking()?;
        self.after_commit();
        Ok(self.resource.inner())
    }

    fn after_commit(&mut self) {
        self.storage_account_keys.clear();
        self.existing_storage_accounts.clear();
        self.defaults_staged = false;
    }

    fn has_pending_data_disks(&self) -> Result<bool> {
        Ok(!self.resource.ledger().pending("dataDisks")?.adds().is_empty())
    }

    fn stage_create_defaults(&mut self) {
        let unmanaged = self.unmanaged_disks;
        let os_disk_name = format!("{}-os-disk", self.resource.name());
        self.resource.stage_root_update(move |inner| {
            if let Some(sku) = reconcile::ensure_object(inner, "/sku") {
                sku.entry("capacity").or_insert(json!(DEFAULT_CAPACITY));
            }
            if let Some(policy) = reconcile::ensure_object(inner, "/properties/upgradePolicy") {
                policy.entry("mode").or_insert(json!("Automatic"));
            }

            let Some(os_disk) = reconcile::ensure_object(inner, OS_DISK) else {
                return;
            };
            os_disk.entry("createOption").or_insert(json!("FromImage"));
            os_disk.entry("caching").or_insert(json!("ReadWrite"));
            if unmanaged {
                os_disk.remove("managedDisk");
                os_disk.entry("name").or_insert(json!(os_disk_name));
            } else {
                os_disk.remove("vhdContainers");
                let managed = os_disk.entry("managedDisk").or_insert(json!({}));
                if let Some(managed) = managed.as_object_mut() {
                    managed
                        .entry("storageAccountType")
                        .or_insert(json!("Standard_LRS"));
                }
            }
        });
    }
}

fn push_vhd_container(inner: &mut Value, url: String) {
    let Some(urls) = reconcile::ensure_array(inner, VHD_CONTAINERS) else {
        return;
    };
    let url = Value::from(url);
    if !urls.contains(&url) {
        urls.push(url);
    }
}

impl Staged for ScaleSet {
    fn staged(&self) -> &StagedResource {
        &self.resource
    }

    fn staged_mut(&mut self) -> &mut StagedResource {
        &mut self.resource
    }
}

impl HasExtensions for ScaleSet {}
impl HasDataDisks for ScaleSet {}
impl HasLoadBalancerAssociations for ScaleSet {}

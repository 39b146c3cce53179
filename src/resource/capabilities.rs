//! Capability traits shared by resource wrappers
//!
//! Each trait is a set of fluent operations over one or two collections. A
//! wrapper opts in by implementing [`Staged`] and the capability markers it
//! supports; all behavior lives in default methods over [`StagedResource`].

use super::children::{BackendPool, DataDisk, Extension};
use super::staged::StagedResource;
use crate::arm::resource_id::child_id;
use crate::error::{FluentError, Result};
use crate::ledger::EntityState;
use crate::reconcile;
use serde_json::{json, Value};

/// Access to the staging object behind a wrapper
pub trait Staged {
    fn staged(&self) -> &StagedResource;
    fn staged_mut(&mut self) -> &mut StagedResource;
}

impl Staged for StagedResource {
    fn staged(&self) -> &StagedResource {
        self
    }

    fn staged_mut(&mut self) -> &mut StagedResource {
        self
    }
}

/// VM extensions (`extensions` collection)
pub trait HasExtensions: Staged {
    fn with_extension(
        &mut self,
        name: &str,
        publisher: &str,
        type_name: &str,
        version: &str,
    ) -> Result<&mut Self> {
        let payload = json!({
            "name": name,
            "properties": {
                "publisher": publisher,
                "type": type_name,
                "typeHandlerVersion": version,
                "autoUpgradeMinorVersion": true
            }
        });
        self.staged_mut().stage_add("extensions", name, payload)?;
        Ok(self)
    }

    /// Replace the public settings of an extension
    fn with_extension_settings(&mut self, name: &str, settings: Value) -> Result<&mut Self> {
        self.staged_mut().stage_update("extensions", name, move |ext| {
            ext["properties"]["settings"] = settings.clone();
        })?;
        Ok(self)
    }

    fn without_extension(&mut self, name: &str) -> Result<&mut Self> {
        self.staged_mut().stage_remove("extensions", name)?;
        Ok(self)
    }

    fn extensions(&self) -> Vec<&Extension> {
        self.staged()
            .children("extensions")
            .into_iter()
            .filter_map(|c| c.as_any().downcast_ref::<Extension>())
            .collect()
    }
}

/// Data disks addressed by logical unit number (`dataDisks` collection)
pub trait HasDataDisks: Staged {
    /// Empty disk on the first free lun
    fn with_new_data_disk(&mut self, size_in_gb: u32) -> Result<&mut Self> {
        let name = self.staged().namer().unique_name("disk", 20);
        let payload = json!({
            "name": name,
            "lun": -1,
            "createOption": "Empty",
            "diskSizeGB": size_in_gb
        });
        self.staged_mut().stage_add("dataDisks", &name, payload)?;
        Ok(self)
    }

    fn with_new_data_disk_at(&mut self, lun: u32, size_in_gb: u32) -> Result<&mut Self> {
        if data_disk_name_at(self.staged(), lun as i64)?.is_some() {
            return Err(FluentError::Validation(format!("lun {} is already in use", lun)));
        }
        let name = self.staged().namer().unique_name("disk", 20);
        let payload = json!({
            "name": name,
            "lun": lun,
            "createOption": "Empty",
            "diskSizeGB": size_in_gb
        });
        self.staged_mut().stage_add("dataDisks", &name, payload)?;
        Ok(self)
    }

    fn with_data_disk_updated(&mut self, lun: u32, size_in_gb: u32) -> Result<&mut Self> {
        let name = data_disk_name_at(self.staged(), lun as i64)?
            .ok_or_else(|| FluentError::Validation(format!("no data disk at lun {}", lun)))?;
        self.staged_mut().stage_update("dataDisks", &name, move |disk| {
            disk["diskSizeGB"] = json!(size_in_gb);
        })?;
        Ok(self)
    }

    fn without_data_disk(&mut self, lun: u32) -> Result<&mut Self> {
        let name = data_disk_name_at(self.staged(), lun as i64)?
            .ok_or_else(|| FluentError::Validation(format!("no data disk at lun {}", lun)))?;
        self.staged_mut().stage_remove("dataDisks", &name)?;
        Ok(self)
    }

    fn data_disks(&self) -> Vec<&DataDisk> {
        self.staged()
            .children("dataDisks")
            .into_iter()
            .filter_map(|c| c.as_any().downcast_ref::<DataDisk>())
            .collect()
    }
}

/// Name of the disk that holds `lun` once the ledger is applied. Pending
/// disks still waiting for a free lun hold none; the one the preview shows
/// them on is provisional.
fn data_disk_name_at(staged: &StagedResource, lun: i64) -> Result<Option<String>> {
    let def = staged.collection_def("dataDisks")?;
    let unassigned: Vec<&str> = staged
        .ledger()
        .pending("dataDisks")?
        .adds()
        .iter()
        .filter(|(_, disk)| disk.get("lun").and_then(Value::as_i64).map_or(true, |l| l < 0))
        .map(|(name, _)| name.as_str())
        .collect();

    Ok(staged
        .pending_view("dataDisks")?
        .iter()
        .filter(|d| d.get("lun").and_then(Value::as_i64) == Some(lun))
        .filter_map(|d| reconcile::entity_key(d, def.key))
        .find(|name| !unassigned.contains(&name.as_str())))
}

/// Backend address pools (`backends` collection)
pub trait HasBackends: Staged {
    /// Empty pool; no-op if it is already staged
    fn with_backend(&mut self, name: &str) -> Result<&mut Self> {
        if self.staged().entity_state("backends", name).is_none() {
            self.staged_mut().stage_add(
                "backends",
                name,
                json!({ "name": name, "properties": { "backendAddresses": [] } }),
            )?;
        }
        Ok(self)
    }

    fn with_backend_ip_address(&mut self, name: &str, ip_address: &str) -> Result<&mut Self> {
        self.with_backend(name)?;
        let address = json!({ "ipAddress": ip_address });
        self.staged_mut()
            .stage_update("backends", name, move |pool| push_backend_address(pool, &address))?;
        Ok(self)
    }

    fn with_backend_fqdn(&mut self, name: &str, fqdn: &str) -> Result<&mut Self> {
        self.with_backend(name)?;
        let address = json!({ "fqdn": fqdn });
        self.staged_mut()
            .stage_update("backends", name, move |pool| push_backend_address(pool, &address))?;
        Ok(self)
    }

    /// Remove an IP address from every pool that has it
    fn without_backend_ip_address(&mut self, ip_address: &str) -> Result<&mut Self> {
        let def = self.staged().collection_def("backends")?.clone();
        let holders: Vec<String> = self
            .staged()
            .pending_view("backends")?
            .iter()
            .filter(|pool| backend_addresses(pool).any(|a| a["ipAddress"] == ip_address))
            .filter_map(|pool| reconcile::entity_key(pool, def.key))
            .collect();

        for name in holders {
            let ip = ip_address.to_string();
            self.staged_mut().stage_update("backends", &name, move |pool| {
                if let Some(addrs) = pool
                    .pointer_mut("/properties/backendAddresses")
                    .and_then(Value::as_array_mut)
                {
                    addrs.retain(|a| a["ipAddress"] != ip.as_str());
                }
            })?;
        }
        Ok(self)
    }

    fn without_backend(&mut self, name: &str) -> Result<&mut Self> {
        self.staged_mut().stage_remove("backends", name)?;
        Ok(self)
    }

    fn backends(&self) -> Vec<&BackendPool> {
        self.staged()
            .children("backends")
            .into_iter()
            .filter_map(|c| c.as_any().downcast_ref::<BackendPool>())
            .collect()
    }
}

fn backend_addresses(pool: &Value) -> impl Iterator<Item = &Value> {
    pool.pointer("/properties/backendAddresses")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn push_backend_address(pool: &mut Value, address: &Value) {
    let Some(addrs) = reconcile::ensure_array(pool, "/properties/backendAddresses") else {
        return;
    };
    if !addrs.contains(address) {
        addrs.push(address.clone());
    }
}

/// Associations that are absent or on their way out get (re)attached
fn needs_attach(state: Option<EntityState>) -> bool {
    matches!(state, None | Some(EntityState::ToRemove))
}

fn attach(staged: &mut StagedResource, collection: &str, id: &str) -> Result<()> {
    if needs_attach(staged.entity_state(collection, id)) {
        staged.stage_add(collection, id, json!({ "id": id }))?;
    }
    Ok(())
}

/// Load balancer backend and NAT pool associations of a scale set
/// (`loadBalancerBackends` and `loadBalancerInboundNatPools`, keyed by full id
/// so pools of the same name on two load balancers stay apart)
pub trait HasLoadBalancerAssociations: Staged {
    fn with_load_balancer_backends(&mut self, load_balancer_id: &str, pools: &[&str]) -> Result<&mut Self> {
        for pool in pools {
            let id = child_id(load_balancer_id, "backendAddressPools", pool);
            attach(self.staged_mut(), "loadBalancerBackends", &id)?;
        }
        Ok(self)
    }

    fn with_load_balancer_nat_pools(&mut self, load_balancer_id: &str, pools: &[&str]) -> Result<&mut Self> {
        for pool in pools {
            let id = child_id(load_balancer_id, "inboundNatPools", pool);
            attach(self.staged_mut(), "loadBalancerInboundNatPools", &id)?;
        }
        Ok(self)
    }

    fn without_load_balancer_backends(&mut self, load_balancer_id: &str, pools: &[&str]) -> Result<&mut Self> {
        for pool in pools {
            let id = child_id(load_balancer_id, "backendAddressPools", pool);
            self.staged_mut().stage_remove("loadBalancerBackends", &id)?;
        }
        Ok(self)
    }

    fn without_load_balancer_nat_pools(&mut self, load_balancer_id: &str, pools: &[&str]) -> Result<&mut Self> {
        for pool in pools {
            let id = child_id(load_balancer_id, "inboundNatPools", pool);
            self.staged_mut().stage_remove("loadBalancerInboundNatPools", &id)?;
        }
        Ok(self)
    }

    /// Detach every current association, then attach to another load balancer.
    fn with_load_balancer_replaced(
        &mut self,
        load_balancer_id: &str,
        backends: &[&str],
        nat_pools: &[&str],
    ) -> Result<&mut Self> {
        self.staged_mut().stage_clear("loadBalancerBackends")?;
        self.staged_mut().stage_clear("loadBalancerInboundNatPools")?;
        self.with_load_balancer_backends(load_balancer_id, backends)?;
        self.with_load_balancer_nat_pools(load_balancer_id, nat_pools)
    }

    /// Ids of the backend pools the resource is attached to
    fn load_balancer_backend_ids(&self) -> Vec<String> {
        self.staged()
            .children("loadBalancerBackends")
            .into_iter()
            .filter_map(|c| c.inner().get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

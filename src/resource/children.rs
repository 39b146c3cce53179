//! Child entity wrappers
//!
//! Wrappers are rebuilt wholesale from the representation after every read or
//! successful write. Which wrapper a collection gets is decided by a
//! [`ChildRegistry`] of plain factory functions.

use crate::arm::resource_id::child_id;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Read-only view of one named child of a resource.
pub trait ChildResource: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// The child's JSON payload as last returned by the service
    fn inner(&self) -> &Value;

    /// Id of the owning resource. Kept as a string so children never own their parent.
    fn parent_id(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Builds a wrapper from `(name, payload, parent id)`.
pub type ChildFactory = fn(&str, &Value, &str) -> Box<dyn ChildResource>;

macro_rules! child_wrapper {
    ($(#[$meta:meta])* $ty:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $ty {
            name: String,
            inner: Value,
            parent_id: String,
        }

        impl $ty {
            pub fn new(name: &str, inner: &Value, parent_id: &str) -> Self {
                Self {
                    name: name.to_string(),
                    inner: inner.clone(),
                    parent_id: parent_id.to_string(),
                }
            }

            fn factory(name: &str, inner: &Value, parent_id: &str) -> Box<dyn ChildResource> {
                Box::new(Self::new(name, inner, parent_id))
            }

            /// Field of the `properties` bag
            pub fn property(&self, field: &str) -> Option<&Value> {
                self.inner.get("properties").and_then(|p| p.get(field))
            }
        }

        impl ChildResource for $ty {
            fn name(&self) -> &str {
                &self.name
            }

            fn inner(&self) -> &Value {
                &self.inner
            }

            fn parent_id(&self) -> &str {
                &self.parent_id
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

child_wrapper!(
    /// Fallback wrapper for collections without a dedicated type
    NamedChild
);

child_wrapper!(
    /// Scale set data disk
    DataDisk
);

child_wrapper!(
    /// Scale set VM extension
    Extension
);

child_wrapper!(
    /// Backend address pool of a gateway or load balancer
    BackendPool
);

child_wrapper!(
    /// Frontend IP configuration
    Frontend
);

impl NamedChild {
    /// Properties bag, if the payload has one
    pub fn properties(&self) -> Option<&Value> {
        self.inner.get("properties")
    }
}

impl DataDisk {
    pub fn lun(&self) -> Option<i64> {
        self.inner.get("lun").and_then(Value::as_i64)
    }

    pub fn size_in_gb(&self) -> Option<i64> {
        self.inner.get("diskSizeGB").and_then(Value::as_i64)
    }

    pub fn caching(&self) -> Option<&str> {
        self.inner.get("caching").and_then(Value::as_str)
    }
}

impl Extension {
    pub fn publisher(&self) -> Option<&str> {
        self.property("publisher").and_then(Value::as_str)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.property("type").and_then(Value::as_str)
    }

    pub fn version(&self) -> Option<&str> {
        self.property("typeHandlerVersion").and_then(Value::as_str)
    }

    pub fn auto_upgrade_minor_version(&self) -> bool {
        self.property("autoUpgradeMinorVersion")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

impl BackendPool {
    /// Id of this pool, synthesized from the parent when the service has not assigned one
    pub fn id(&self) -> String {
        self.inner
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| child_id(&self.parent_id, "backendAddressPools", &self.name))
    }

    /// IP addresses or FQDNs registered in the pool
    pub fn addresses(&self) -> Vec<&str> {
        self.property("backendAddresses")
            .and_then(Value::as_array)
            .map(|addrs| {
                addrs
                    .iter()
                    .filter_map(|a| a.get("ipAddress").or_else(|| a.get("fqdn")))
                    .filter_map(Value::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Frontend {
    pub fn public_ip_address_id(&self) -> Option<&str> {
        self.property("publicIPAddress")
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
    }

    pub fn is_public(&self) -> bool {
        self.public_ip_address_id().is_some()
    }

    pub fn subnet_id(&self) -> Option<&str> {
        self.property("subnet")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
    }
}

/// Factory functions keyed by collection name
#[derive(Clone)]
pub struct ChildRegistry {
    factories: HashMap<String, ChildFactory>,
}

impl Default for ChildRegistry {
    /// Registry with the wrappers this crate ships
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("dataDisks", DataDisk::factory);
        registry.register("extensions", Extension::factory);
        registry.register("backends", BackendPool::factory);
        registry.register("frontends", Frontend::factory);
        registry
    }
}

impl fmt::Debug for ChildRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("ChildRegistry").field("collections", &keys).finish()
    }
}

impl ChildRegistry {
    /// Registry where every collection gets [`NamedChild`]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, collection: &str, factory: ChildFactory) {
        self.factories.insert(collection.to_string(), factory);
    }

    pub fn build(
        &self,
        collection: &str,
        name: &str,
        inner: &Value,
        parent_id: &str,
    ) -> Box<dyn ChildResource> {
        match self.factories.get(collection) {
            Some(factory) => factory(name, inner, parent_id),
            None => NamedChild::factory(name, inner, parent_id),
        }
    }
}

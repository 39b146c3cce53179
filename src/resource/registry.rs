//! Resource Kind Registry - Load resource kind definitions from JSON
//!
//! Each kind declares where its named child collections live inside the
//! representation and which child fields reference which collections. The
//! ledger and the reconciliation pass are driven entirely by these tables.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Embedded kind JSON files (compiled into the binary)
const RESOURCE_FILES: &[&str] = &[
    include_str!("../resources/compute.json"),
    include_str!("../resources/network.json"),
    include_str!("../resources/storage.json"),
];

/// How entities of a collection are keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// The entity's `name` field
    #[default]
    Name,
    /// Full `id` of the entity, compared case-insensitively (reference sets
    /// such as load-balancer backend associations)
    Id,
}

/// A named child collection inside a representation
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionDef {
    pub name: String,
    /// JSON pointer to the array
    pub path: String,
    #[serde(default)]
    pub key: KeyMode,
    /// Integer field filled by first-unused-slot allocation when `-1` or absent
    #[serde(default)]
    pub slot_field: Option<String>,
    /// ARM child type used when synthesizing ids, e.g. `backendAddressPools`
    #[serde(default)]
    pub child_type: Option<String>,
}

/// A SubResource-style link from entities of one collection to another
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceDef {
    pub source: String,
    /// JSON pointer inside each source entity to `{"id": ..}` or a list of them
    pub field: String,
    pub target: String,
}

/// Resource kind definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceKindDef {
    pub display_name: String,
    pub provider: String,
    pub resource_type: String,
    pub api_version: String,
    #[serde(default)]
    pub collections: Vec<CollectionDef>,
    #[serde(default)]
    pub references: Vec<ReferenceDef>,
}

impl ResourceKindDef {
    pub fn collection(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Root structure of resources/*.json
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    #[serde(default)]
    pub resources: HashMap<String, ResourceKindDef>,
}

/// Global registry loaded from JSON
static REGISTRY: OnceLock<ResourceConfig> = OnceLock::new();

/// Get the kind registry (loads from embedded JSON on first access)
pub fn get_registry() -> &'static ResourceConfig {
    REGISTRY.get_or_init(|| {
        let mut final_config = ResourceConfig {
            resources: HashMap::new(),
        };

        for content in RESOURCE_FILES {
            let partial: ResourceConfig = serde_json::from_str(content)
                .unwrap_or_else(|e| panic!("Failed to parse embedded resource JSON: {}", e));
            final_config.resources.extend(partial.resources);
        }

        final_config
    })
}

/// Get a kind definition by key
pub fn get_kind(key: &str) -> Option<&'static ResourceKindDef> {
    get_registry().resources.get(key)
}

/// Get all kind keys, sorted
pub fn get_all_kind_keys() -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = get_registry()
        .resources
        .keys()
        .map(|s| s.as_str())
        .collect();
    keys.sort_unstable();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_loads_successfully() {
        let registry = get_registry();
        assert!(!registry.resources.is_empty(), "Registry should have kinds");
    }

    #[test]
    fn test_scale_set_kind_exists() {
        let kind = get_kind("virtual-machine-scale-sets").expect("scale sets should exist");
        assert_eq!(kind.provider, "Microsoft.Compute");
        assert_eq!(
            kind.collection("dataDisks").and_then(|c| c.slot_field.as_deref()),
            Some("lun")
        );
        assert_eq!(
            kind.collection("loadBalancerBackends").map(|c| c.key),
            Some(KeyMode::Id)
        );
    }

    #[test]
    fn test_references_point_at_declared_collections() {
        for key in get_all_kind_keys() {
            let kind = get_kind(key).unwrap();
            for reference in &kind.references {
                assert!(kind.collection(&reference.source).is_some(), "{key}: {}", reference.source);
                assert!(kind.collection(&reference.target).is_some(), "{key}: {}", reference.target);
            }
        }
    }

    #[test]
    fn test_get_all_kind_keys() {
        let keys = get_all_kind_keys();
        assert!(keys.contains(&"application-gateways"));
        assert!(keys.contains(&"storage-accounts"));
        assert!(keys.contains(&"virtual-networks"));
    }
}

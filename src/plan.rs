//! Mutation plans
//!
//! A plan is a YAML document naming one resource and the operations to stage
//! against it:
//!
//! ```yaml
//! kind: application-gateways
//! resource_group: rg1
//! name: ag1
//! operations:
//!   - op: add
//!     collection: backends
//!     name: pool1
//!     payload:
//!       properties:
//!         backendAddresses:
//!           - ipAddress: 10.0.0.4
//!   - op: update
//!     collection: probes
//!     name: probe1
//!     set:
//!       /properties/path: /healthz
//!   - op: remove
//!     collection: listeners
//!     name: old
//!   - op: set
//!     values:
//!       /properties/enableHttp2: true
//! ```

use crate::error::{FluentError, Result};
use crate::reconcile;
use crate::resource::StagedResource;
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// One staged operation
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Add {
        collection: String,
        name: String,
        #[serde(default)]
        payload: Value,
    },
    Remove {
        collection: String,
        name: String,
    },
    /// Set fields of a child, addressed by JSON pointer
    Update {
        collection: String,
        name: String,
        set: BTreeMap<String, Value>,
    },
    Clear {
        collection: String,
    },
    /// Set fields of the resource itself
    Set {
        values: BTreeMap<String, Value>,
    },
}

/// A resource and the operations to stage against it
#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    /// Registered kind key, e.g. `virtual-machine-scale-sets`
    pub kind: String,
    #[serde(default)]
    pub resource_group: Option<String>,
    pub name: String,
    /// Define the resource instead of reading it first
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Plan {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse plan")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {:?}", path))?;
        Self::from_yaml(&content)
    }

    /// Stage every operation; returns how many were staged.
    pub fn apply(&self, resource: &mut StagedResource) -> Result<usize> {
        for operation in &self.operations {
            tracing::debug!("staging {:?}", operation);
            match operation {
                Operation::Add {
                    collection,
                    name,
                    payload,
                } => {
                    resource.stage_add(collection, name, payload.clone())?;
                }
                Operation::Remove { collection, name } => {
                    resource.stage_remove(collection, name)?;
                }
                Operation::Update {
                    collection,
                    name,
                    set,
                } => {
                    let fields = checked_fields(set)?;
                    resource.stage_update(collection, name, move |entity| {
                        set_fields(entity, &fields)
                    })?;
                }
                Operation::Clear { collection } => {
                    resource.stage_clear(collection)?;
                }
                Operation::Set { values } => {
                    let fields = checked_fields(values)?;
                    resource.stage_root_update(move |inner| set_fields(inner, &fields));
                }
            }
        }
        Ok(self.operations.len())
    }
}

/// Split each pointer into parent and field, rejecting anything that is not
/// a non-root JSON pointer.
fn checked_fields(fields: &BTreeMap<String, Value>) -> Result<Vec<(String, String, Value)>> {
    fields
        .iter()
        .map(|(pointer, value)| {
            let (parent, field) = pointer
                .rsplit_once('/')
                .filter(|(parent, field)| (parent.is_empty() || parent.starts_with('/')) && !field.is_empty())
                .ok_or_else(|| FluentError::Validation(format!("invalid field pointer '{}'", pointer)))?;
            Ok((parent.to_string(), field.replace("~1", "/").replace("~0", "~"), value.clone()))
        })
        .collect()
}

fn set_fields(target: &mut Value, fields: &[(String, String, Value)]) {
    for (parent, field, value) in fields {
        match reconcile::ensure_object(target, parent) {
            Some(obj) => {
                obj.insert(field.clone(), value.clone());
            }
            None => tracing::warn!("cannot set {}/{}: path is blocked", parent, field),
        }
    }
}

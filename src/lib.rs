//! armfluent - staged, fluent edits of Azure Resource Manager resources
//!
//! Child collections of a resource (backend pools, data disks, listeners, ...)
//! are edited locally through a change ledger and written back with a single
//! create-or-update call. Resources the parent depends on (storage accounts,
//! public IPs) are created first through a dependency graph, and their results
//! are bound into the parent before it is written.

pub mod arm;
pub mod config;
pub mod dag;
pub mod error;
pub mod ledger;
pub mod naming;
pub mod plan;
pub mod reconcile;
pub mod resource;

pub use error::{FluentError, Result};

/// Version injected at compile time via ARMFLUENT_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("ARMFLUENT_VERSION") {
    Some(v) => v,
    None => "dev",
};

//! Resource abstraction layer
//!
//! Resource kinds are data: each one is described in a JSON file under
//! `src/resources/` (collections, where they live in the representation and
//! which children reference which). The generic [`StagedResource`] drives
//! staging and commits from those definitions, and the typed wrappers only add
//! what is specific to their resource.
//!
//! # Architecture
//!
//! - [`registry`] - Loads and caches resource kind definitions from embedded JSON
//! - [`children`] - Typed views of named children, built through a factory registry
//! - [`staged`] - The staging and commit engine shared by every wrapper
//! - [`capabilities`] - Fluent operations shared by several wrappers
//! - [`scale_set`] / [`app_gateway`] - Resource specific wrappers
//!
//! # Resource Definitions
//!
//! - `compute.json` - Virtual machine scale sets
//! - `network.json` - Public IPs, virtual networks, load balancers, application gateways
//! - `storage.json` - Storage accounts
//!
//! # Example
//!
//! ```ignore
//! use armfluent::resource::{ApplicationGateway, HasBackends};
//!
//! let mut gateway = ApplicationGateway::load(service, "rg1", "ag1").await?;
//! gateway.with_backend_ip_address("pool1", "10.0.0.4")?;
//! gateway.commit().await?;
//! ```

pub mod app_gateway;
pub mod capabilities;
pub mod children;
mod registry;
pub mod scale_set;
pub mod staged;

pub use app_gateway::ApplicationGateway;
pub use capabilities::{HasBackends, HasDataDisks, HasExtensions, HasLoadBalancerAssociations, Staged};
pub use children::{BackendPool, ChildRegistry, ChildResource, DataDisk, Extension, Frontend, NamedChild};
pub use registry::*;
pub use scale_set::ScaleSet;
pub use staged::{BindingTarget, CommitOutcome, StagedResource};

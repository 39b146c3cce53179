//! ARM API interaction module
//!
//! REST plumbing underneath the fluent core. Authentication is out of scope:
//! callers hand the client a bearer token.
//!
//! # Module Structure
//!
//! - [`client`] - subscription-scoped client and URL builders
//! - [`http`] - HTTP utilities for REST API calls
//! - [`resource_id`] - parsing and synthesizing ARM resource ids
//! - [`service`] - the [`service::ResourceService`] boundary used by commits
//!
//! # Example
//!
//! ```ignore
//! use armfluent::arm::{client::ArmClient, service::ArmResourceService};
//!
//! let client = ArmClient::new(DEFAULT_ENDPOINT, "sub-id", &token)?;
//! let kind = armfluent::resource::get_kind("virtual-machine-scale-sets").unwrap();
//! let service = ArmResourceService::for_kind(client, kind);
//! ```

pub mod client;
pub mod http;
pub mod resource_id;
pub mod service;

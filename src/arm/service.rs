//! Remote resource service boundary
//!
//! The commit engine only talks to the remote side through [`ResourceService`],
//! which keeps it testable with in-memory doubles.

use super::client::ArmClient;
use crate::resource::ResourceKindDef;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Read/write access to one resource type in ARM.
#[async_trait]
pub trait ResourceService: Send + Sync {
    /// Fetch the current representation of a resource
    async fn get_by_resource_group(&self, resource_group: &str, name: &str) -> Result<Value>;

    /// Create or fully replace a resource, returning the stored representation
    async fn create_or_update(&self, resource_group: &str, name: &str, body: &Value)
        -> Result<Value>;

    /// Delete a resource
    async fn delete(&self, resource_group: &str, name: &str) -> Result<()>;
}

/// [`ResourceService`] over the ARM REST API
#[derive(Clone)]
pub struct ArmResourceService {
    client: ArmClient,
    provider: String,
    resource_type: String,
    api_version: String,
}

impl ArmResourceService {
    pub fn new(client: ArmClient, provider: &str, resource_type: &str, api_version: &str) -> Self {
        Self {
            client,
            provider: provider.to_string(),
            resource_type: resource_type.to_string(),
            api_version: api_version.to_string(),
        }
    }

    /// Service for a registered resource kind
    pub fn for_kind(client: ArmClient, kind: &ResourceKindDef) -> Self {
        Self::new(client, &kind.provider, &kind.resource_type, &kind.api_version)
    }

    fn url(&self, resource_group: &str, name: &str) -> String {
        self.client.resource_url(
            resource_group,
            &self.provider,
            &self.resource_type,
            name,
            &self.api_version,
        )
    }
}

#[async_trait]
impl ResourceService for ArmResourceService {
    async fn get_by_resource_group(&self, resource_group: &str, name: &str) -> Result<Value> {
        self.client.get(&self.url(resource_group, name)).await
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        body: &Value,
    ) -> Result<Value> {
        tracing::info!(
            "createOrUpdate {}/{} in {}",
            self.resource_type,
            name,
            resource_group
        );
        self.client.put(&self.url(resource_group, name), body).await
    }

    async fn delete(&self, resource_group: &str, name: &str) -> Result<()> {
        tracing::info!("delete {}/{} in {}", self.resource_type, name, resource_group);
        self.client.delete(&self.url(resource_group, name)).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Echoes every write back; optionally fails a number of writes first.
    #[derive(Default)]
    pub(crate) struct EchoService {
        pub(crate) failures_left: AtomicUsize,
        pub(crate) writes: AtomicUsize,
        pub(crate) last_body: Mutex<Option<Value>>,
    }

    impl EchoService {
        pub(crate) fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Self::default()
            }
        }

        pub(crate) fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceService for EchoService {
        async fn get_by_resource_group(&self, _group: &str, _name: &str) -> Result<Value> {
            let body = self.last_body.lock().unwrap().clone();
            body.ok_or_else(|| anyhow::anyhow!("API request failed: 404 Not Found"))
        }

        async fn create_or_update(&self, _group: &str, _name: &str, body: &Value) -> Result<Value> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("API request failed: 500 Internal Server Error"));
            }
            *self.last_body.lock().unwrap() = Some(body.clone());
            Ok(body.clone())
        }

        async fn delete(&self, _group: &str, _name: &str) -> Result<()> {
            *self.last_body.lock().unwrap() = None;
            Ok(())
        }
    }
}

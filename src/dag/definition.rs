//! Stock creatable that PUTs a resource body through a [`ResourceService`].

use super::{Creatable, DependencyResults};
use crate::arm::service::ResourceService;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

type Apply = Arc<dyn Fn(&mut Value, &Value) + Send + Sync>;

/// A resource to create as a dependency of another, e.g. a storage account
/// or a public IP address.
pub struct ResourceDefinition {
    service: Arc<dyn ResourceService>,
    resource_group: String,
    name: String,
    key_prefix: String,
    body: Value,
    dependencies: Vec<(Arc<dyn Creatable>, Option<Apply>)>,
}

impl ResourceDefinition {
    pub fn new(
        service: Arc<dyn ResourceService>,
        resource_group: &str,
        name: &str,
        body: Value,
    ) -> Self {
        Self {
            service,
            resource_group: resource_group.to_string(),
            name: name.to_string(),
            key_prefix: name.to_string(),
            body,
            dependencies: Vec::new(),
        }
    }

    /// Override the prefix of the task key
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    /// Create `other` first.
    pub fn with_dependency(mut self, other: Arc<dyn Creatable>) -> Self {
        self.dependencies.push((other, None));
        self
    }

    /// Create `other` first, then let `apply` copy from its result into this body.
    pub fn with_dependency_applied<F>(mut self, other: Arc<dyn Creatable>, apply: F) -> Self
    where
        F: Fn(&mut Value, &Value) + Send + Sync + 'static,
    {
        self.dependencies.push((other, Some(Arc::new(apply))));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("resource_group", &self.resource_group)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

#[async_trait]
impl Creatable for ResourceDefinition {
    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn dependencies(&self) -> Vec<Arc<dyn Creatable>> {
        self.dependencies
            .iter()
            .map(|(unit, _)| Arc::clone(unit))
            .collect()
    }

    async fn create(&self, dependencies: &DependencyResults) -> anyhow::Result<Value> {
        let mut body = self.body.clone();
        for (unit, apply) in &self.dependencies {
            let Some(apply) = apply else {
                continue;
            };
            let result = dependencies.for_unit(unit).ok_or_else(|| {
                anyhow::anyhow!("result of a prerequisite of {} is missing", self.name)
            })?;
            apply(&mut body, result);
        }

        self.service
            .create_or_update(&self.resource_group, &self.name, &body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::service::mock::EchoService;
    use crate::dag::DependencyGraph;
    use serde_json::json;

    #[tokio::test]
    async fn test_definition_applies_prerequisite_result() {
        let service: Arc<dyn ResourceService> = Arc::new(EchoService::default());
        let group: Arc<dyn Creatable> = Arc::new(ResourceDefinition::new(
            Arc::clone(&service),
            "rg1",
            "rg1",
            json!({ "id": "/subscriptions/s/resourceGroups/rg1", "location": "westus" }),
        ));
        let pip: Arc<dyn Creatable> = Arc::new(
            ResourceDefinition::new(Arc::clone(&service), "rg1", "pip1", json!({ "name": "pip1" }))
                .with_key_prefix("pip")
                .with_dependency_applied(group, |body, group| {
                    body["location"] = group["location"].clone();
                }),
        );

        let mut graph = DependencyGraph::new();
        let key = graph.register_dependency(pip);
        assert!(key.starts_with("pip-"));

        graph.resolve_all().await.unwrap();
        assert_eq!(graph.result(&key).unwrap()["location"], "westus");
    }
}

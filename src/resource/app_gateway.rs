//! Application gateway wrapper
//!
//! Listeners, rules and HTTP configurations reference each other by id. The
//! helpers here stage the referenced children on demand (ports, the default
//! public frontend, backends) so a rule can be defined in one call.
//!
//! A new gateway also needs an IP configuration in a subnet, and its public
//! frontend needs a public IP. When the caller provides neither,
//! [`ApplicationGateway::before_commit`] registers a default virtual network
//! and public IP that are created ahead of the gateway.

use super::capabilities::{HasBackends, Staged};
use super::children::{ChildResource, Frontend};
use super::staged::{BindingTarget, StagedResource};
use crate::arm::resource_id::{child_id, name_from_resource_id};
use crate::arm::service::ResourceService;
use crate::dag::{Creatable, ResourceDefinition, TaskKey};
use crate::error::{FluentError, Result};
use crate::ledger::EntityState;
use crate::reconcile;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

pub const KIND: &str = "application-gateways";

const DEFAULT_BACKEND_PORT: u16 = 80;
const DEFAULT_SUBNET: &str = "default";

pub struct ApplicationGateway {
    resource: StagedResource,
    region: Option<String>,
    /// Frontend created to carry the public IP before it has one
    default_public_frontend: Option<String>,
    public_ip_service: Option<Arc<dyn ResourceService>>,
    network_service: Option<Arc<dyn ResourceService>>,
    /// Dependency that gives the public frontend its IP this cycle
    public_ip_key: Option<TaskKey>,
    /// Default network created for the IP configuration this cycle
    network_key: Option<TaskKey>,
}

impl fmt::Debug for ApplicationGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationGateway")
            .field("resource", &self.resource)
            .field("region", &self.region)
            .field("default_public_frontend", &self.default_public_frontend)
            .field("public_ip_key", &self.public_ip_key)
            .field("network_key", &self.network_key)
            .finish()
    }
}

impl ApplicationGateway {
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
            default_public_frontend: None,
            public_ip_service: None,
            network_service: None,
            public_ip_key: None,
            network_key: None,
        }
    }

    /// Service used to create the default public IP
    pub fn with_public_ip_service(&mut self, service: Arc<dyn ResourceService>) -> &mut Self {
        self.public_ip_service = Some(service);
        self
    }

    /// Service used to create the default virtual network
    pub fn with_network_service(&mut self, service: Arc<dyn ResourceService>) -> &mut Self {
        self.network_service = Some(service);
        self
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

    /// SKU size, e.g. `Standard_Small`
    pub fn with_size(&mut self, size: &str) -> &mut Self {
        let size = size.to_string();
        self.resource.stage_root_update(move |inner| {
            if let Some(sku) = reconcile::ensure_object(inner, "/properties/sku") {
                sku.insert("name".into(), json!(size));
            }
        });
        self
    }

    pub fn with_tier(&mut self, tier: &str) -> &mut Self {
        let tier = tier.to_string();
        self.resource.stage_root_update(move |inner| {
            if let Some(sku) = reconcile::ensure_object(inner, "/properties/sku") {
                sku.insert("tier".into(), json!(tier));
            }
        });
        self
    }

    /// Fixed instance count; turns autoscaling off.
    pub fn with_instance_count(&mut self, capacity: u32) -> &mut Self {
        self.resource.stage_root_update(move |inner| {
            if let Some(sku) = reconcile::ensure_object(inner, "/properties/sku") {
                sku.entry("name").or_insert(json!("Standard_Small"));
                sku.entry("tier").or_insert(json!("Standard"));
                sku.insert("capacity".into(), json!(capacity));
            }
            if let Some(props) = reconcile::ensure_object(inner, "/properties") {
                props.remove("autoscaleConfiguration");
            }
        });
        self
    }

    pub fn with_http2(&mut self, enabled: bool) -> &mut Self {
        self.resource.stage_root_update(move |inner| {
            if let Some(props) = reconcile::ensure_object(inner, "/properties") {
                props.insert("enableHttp2".into(), json!(enabled));
            }
        });
        self
    }

    /// Put the gateway into a subnet, creating its IP configuration if needed.
    pub fn with_existing_subnet(&mut self, subnet_id: &str) -> Result<&mut Self> {
        let subnet = json!({ "id": subnet_id });
        let existing = self.pending_names("ipConfigurations")?.into_iter().next();
        match existing {
            Some(name) => {
                self.resource.stage_update("ipConfigurations", &name, move |config| {
                    if let Some(props) = reconcile::ensure_object(config, "/properties") {
                        props.insert("subnet".into(), subnet.clone());
                    }
                })?;
            }
            None => {
                let name = self.resource.namer().unique_name("ipcfg", 11);
                self.resource.stage_add(
                    "ipConfigurations",
                    &name,
                    json!({ "properties": { "subnet": subnet } }),
                )?;
            }
        }
        Ok(self)
    }

    /// Ensure a frontend port exists. Without a name an existing port with the
    /// same number is reused, otherwise one is created with a generated name.
    /// Conflicting name and number fail validation.
    pub fn with_frontend_port(&mut self, port: u16, name: Option<&str>) -> Result<&mut Self> {
        let ports = self.resource.pending_view("frontendPorts")?;
        let by_name = name.and_then(|wanted| {
            ports.iter().position(|p| {
                p.get("name")
                    .and_then(Value::as_str)
                    .map(|n| n.eq_ignore_ascii_case(wanted))
                    .unwrap_or(false)
            })
        });
        let by_port = ports.iter().position(|p| port_number(p) == Some(port));

        match (by_name, by_port, name) {
            (Some(a), Some(b), _) if a == b => Ok(self),
            (None, Some(_), None) => Ok(self),
            (None, None, name) => {
                let name = match name {
                    Some(name) => name.to_string(),
                    None => self.resource.namer().unique_name("port", 9),
                };
                self.resource.stage_add(
                    "frontendPorts",
                    &name,
                    json!({ "properties": { "port": port } }),
                )?;
                Ok(self)
            }
            _ => Err(FluentError::Validation(format!(
                "frontend port {} conflicts with an existing port named {}",
                port,
                name.unwrap_or("(none)")
            ))),
        }
    }

    /// Name of the frontend port with this number, including staged ports
    pub fn frontend_port_name(&self, port: u16) -> Result<Option<String>> {
        Ok(self
            .resource
            .pending_view("frontendPorts")?
            .iter()
            .find(|p| port_number(p) == Some(port))
            .and_then(|p| p.get("name").and_then(Value::as_str))
            .map(str::to_string))
    }

    pub fn without_frontend_port(&mut self, name: &str) -> Result<&mut Self> {
        self.resource.stage_remove("frontendPorts", name)?;
        Ok(self)
    }

    /// Name of the frontend holding the public IP, if any
    pub fn default_public_frontend_name(&self) -> Result<Option<String>> {
        let frontends = self.resource.pending_view("frontends")?;
        let public = frontends
            .iter()
            .find(|fe| fe.pointer("/properties/publicIPAddress/id").is_some())
            .and_then(|fe| fe.get("name").and_then(Value::as_str))
            .map(str::to_string);
        if public.is_some() {
            return Ok(public);
        }
        Ok(self.default_public_frontend.clone().filter(|name| {
            !matches!(
                self.resource.entity_state("frontends", name),
                None | Some(EntityState::ToRemove)
            )
        }))
    }

    pub fn ensure_default_public_frontend(&mut self) -> Result<String> {
        if let Some(name) = self.default_public_frontend_name()? {
            return Ok(name);
        }
        let name = self.resource.namer().unique_name("frontend", 14);
        self.resource
            .stage_add("frontends", &name, json!({ "properties": {} }))?;
        self.default_public_frontend = Some(name.clone());
        Ok(name)
    }

    pub fn with_existing_public_ip(&mut self, public_ip_id: &str) -> Result<&mut Self> {
        let frontend = self.ensure_default_public_frontend()?;
        let reference = json!({ "id": public_ip_id });
        self.resource.stage_update("frontends", &frontend, move |fe| {
            set_public_ip(fe, reference.clone());
        })?;
        Ok(self)
    }

    /// Create a public IP before the gateway and attach it to the default frontend.
    pub fn with_new_public_ip(&mut self, public_ip: Arc<dyn Creatable>) -> Result<&mut Self> {
        let frontend = self.ensure_default_public_frontend()?;
        let key = self.resource.register_dependency(public_ip);
        self.resource.bind_dependency(
            &key,
            BindingTarget::Entity {
                collection: "frontends".to_string(),
                name: frontend,
            },
            |fe, pip| set_public_ip(fe, json!({ "id": pip["id"] })),
        )?;
        self.public_ip_key = Some(key);
        Ok(self)
    }

    /// Name of the first frontend that is not the public one
    pub fn default_private_frontend_name(&self) -> Option<String> {
        let public = self.default_public_frontend.as_deref();
        self.frontends()
            .into_iter()
            .find(|fe| !fe.is_public() && Some(fe.name()) != public)
            .map(|fe| fe.name().to_string())
    }

    /// Frontend with a dynamic private address in the gateway's subnet
    pub fn ensure_default_private_frontend(&mut self) -> Result<String> {
        if let Some(name) = self.default_private_frontend_name() {
            return Ok(name);
        }
        let name = self.resource.namer().unique_name("frontend", 14);
        self.resource.stage_add(
            "frontends",
            &name,
            json!({ "properties": { "privateIPAllocationMethod": "Dynamic" } }),
        )?;
        Ok(name)
    }

    pub fn with_probe(&mut self, name: &str, host: &str, path: &str) -> Result<&mut Self> {
        self.resource.stage_add(
            "probes",
            name,
            json!({
                "properties": {
                    "protocol": "Http",
                    "host": host,
                    "path": path,
                    "interval": 30,
                    "timeout": 30,
                    "unhealthyThreshold": 3
                }
            }),
        )?;
        Ok(self)
    }

    pub fn without_probe(&mut self, name: &str) -> Result<&mut Self> {
        self.resource.stage_remove("probes", name)?;
        Ok(self)
    }

    /// Backend HTTP settings; port defaults to 80.
    pub fn with_backend_http_config(
        &mut self,
        name: &str,
        port: Option<u16>,
        probe: Option<&str>,
    ) -> Result<&mut Self> {
        let mut properties = json!({
            "port": port.unwrap_or(DEFAULT_BACKEND_PORT),
            "protocol": "Http",
            "cookieBasedAffinity": "Disabled"
        });
        if let Some(probe) = probe {
            self.require("probes", probe)?;
            properties["probe"] = self.resource.child_reference("probes", probe)?;
        }
        self.resource
            .stage_add("backendHttpConfigs", name, json!({ "properties": properties }))?;
        Ok(self)
    }

    pub fn without_backend_http_config(&mut self, name: &str) -> Result<&mut Self> {
        self.resource.stage_remove("backendHttpConfigs", name)?;
        Ok(self)
    }

    /// HTTP listener on `port`, on the given frontend or the default public one
    pub fn with_http_listener(&mut self, name: &str, port: u16, frontend: Option<&str>) -> Result<&mut Self> {
        self.with_frontend_port(port, None)?;
        let port_name = self.frontend_port_name(port)?.ok_or_else(|| {
            FluentError::Validation(format!("frontend port {} could not be staged", port))
        })?;
        let frontend = match frontend {
            Some(frontend) => {
                self.require("frontends", frontend)?;
                frontend.to_string()
            }
            None => self.ensure_default_public_frontend()?,
        };

        let payload = json!({
            "properties": {
                "protocol": "Http",
                "frontendIPConfiguration": self.resource.child_reference("frontends", &frontend)?,
                "frontendPort": self.resource.child_reference("frontendPorts", &port_name)?
            }
        });
        self.resource.stage_add("listeners", name, payload)?;
        Ok(self)
    }

    pub fn without_listener(&mut self, name: &str) -> Result<&mut Self> {
        self.resource.stage_remove("listeners", name)?;
        Ok(self)
    }

    /// Basic routing rule. Without a backend name a uniquely named empty one is created.
    pub fn with_request_routing_rule(
        &mut self,
        name: &str,
        listener: &str,
        backend: Option<&str>,
        http_config: &str,
    ) -> Result<&mut Self> {
        self.require("listeners", listener)?;
        self.require("backendHttpConfigs", http_config)?;
        let backend = self.ensure_backend_ref(backend)?;

        let payload = json!({
            "properties": {
                "ruleType": "Basic",
                "httpListener": self.resource.child_reference("listeners", listener)?,
                "backendHttpSettings": self.resource.child_reference("backendHttpConfigs", http_config)?,
                "backendAddressPool": backend
            }
        });
        self.resource.stage_add("rules", name, payload)?;
        Ok(self)
    }

    pub fn without_request_routing_rule(&mut self, name: &str) -> Result<&mut Self> {
        self.resource.stage_remove("rules", name)?;
        Ok(self)
    }

    /// Remove a URL path map together with the rules that route through it.
    pub fn without_url_path_map(&mut self, name: &str) -> Result<&mut Self> {
        let rules: Vec<String> = self
            .resource
            .pending_view("rules")?
            .iter()
            .filter(|rule| {
                rule.pointer("/properties/urlPathMap/id")
                    .and_then(Value::as_str)
                    .map(|id| name_from_resource_id(id) == name)
                    .unwrap_or(false)
            })
            .filter_map(|rule| rule.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        for rule in rules {
            self.resource.stage_remove("rules", &rule)?;
        }
        self.resource.stage_remove("urlPathMaps", name)?;
        Ok(self)
    }

    /// Reference to the named backend, staging it if needed
    pub fn ensure_backend_ref(&mut self, name: Option<&str>) -> Result<Value> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.resource.namer().unique_name("backend", 20),
        };
        self.with_backend(&name)?;
        self.resource.child_reference("backends", &name)
    }

    pub fn frontends(&self) -> Vec<&Frontend> {
        self.resource
            .children("frontends")
            .into_iter()
            .filter_map(|c| c.as_any().downcast_ref::<Frontend>())
            .collect()
    }

    /// Stage the IP configuration a new gateway needs and register the
    /// default public IP and virtual network when nothing else provides them.
    pub fn before_commit(&mut self) -> Result<()> {
        if !self.resource.is_in_create_mode() {
            return Ok(());
        }
        let ip_config = self.ensure_default_ip_config()?;
        self.ensure_public_ip()?;
        self.ensure_subnet(&ip_config)
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
        self.public_ip_key = None;
        self.network_key = None;
    }

    fn ensure_default_ip_config(&mut self) -> Result<String> {
        if let Some(name) = self.pending_names("ipConfigurations")?.into_iter().next() {
            return Ok(name);
        }
        let name = self.resource.namer().unique_name("ipcfg", 11);
        self.resource
            .stage_add("ipConfigurations", &name, json!({ "properties": {} }))?;
        Ok(name)
    }

    fn ensure_public_ip(&mut self) -> Result<()> {
        if self.public_ip_key.is_some() {
            return Ok(());
        }
        let Some(frontend) = self.default_public_frontend_name()? else {
            return Ok(());
        };
        let has_ip = self
            .resource
            .child::<Frontend>("frontends", &frontend)
            .is_some_and(Frontend::is_public);
        if has_ip {
            return Ok(());
        }

        let service = self.public_ip_service.clone().ok_or_else(|| {
            FluentError::Validation(format!(
                "frontend '{}' has no public IP and no public IP service is set",
                frontend
            ))
        })?;
        let region = self.require_region()?;
        let name = self.resource.namer().unique_name("pip", 9);
        tracing::info!("application gateway {} gets default public IP {}", self.resource.name(), name);

        let pip = ResourceDefinition::new(
            service,
            self.resource.resource_group(),
            &name,
            json!({
                "location": region,
                "properties": { "publicIPAllocationMethod": "Dynamic" }
            }),
        )
        .with_key_prefix("pip");
        self.with_new_public_ip(Arc::new(pip))?;
        Ok(())
    }

    fn ensure_subnet(&mut self, ip_config: &str) -> Result<()> {
        let subnet = self
            .resource
            .children("ipConfigurations")
            .into_iter()
            .find(|config| config.name() == ip_config)
            .and_then(|config| config.inner().pointer("/properties/subnet/id").cloned());
        let private_frontend = self.default_private_frontend_name();

        if let Some(subnet_id) = subnet {
            // private frontends share the gateway's subnet
            if let Some(frontend) = private_frontend {
                let subnet = json!({ "id": subnet_id });
                self.resource.stage_update("frontends", &frontend, move |fe| {
                    use_private_subnet(fe, subnet.clone());
                })?;
            }
            return Ok(());
        }
        if self.network_key.is_some() {
            return Ok(());
        }

        let service = self.network_service.clone().ok_or_else(|| {
            FluentError::Validation(format!(
                "IP configuration '{}' has no subnet and no network service is set",
                ip_config
            ))
        })?;
        let region = self.require_region()?;
        let name = self.resource.namer().unique_name("vnet", 10);
        tracing::info!("application gateway {} gets default network {}", self.resource.name(), name);

        let network: Arc<dyn Creatable> = Arc::new(
            ResourceDefinition::new(
                service,
                self.resource.resource_group(),
                &name,
                json!({
                    "location": region,
                    "properties": {
                        "addressSpace": { "addressPrefixes": ["10.0.0.0/24"] },
                        "subnets": [
                            { "name": DEFAULT_SUBNET, "properties": { "addressPrefix": "10.0.0.0/25" } },
                            { "name": "apps", "properties": { "addressPrefix": "10.0.0.128/25" } }
                        ]
                    }
                }),
            )
            .with_key_prefix("vnet"),
        );
        let key = self.resource.register_dependency(network);
        self.resource.bind_dependency(
            &key,
            BindingTarget::Entity {
                collection: "ipConfigurations".to_string(),
                name: ip_config.to_string(),
            },
            |config, network| set_subnet(config, default_subnet_ref(network)),
        )?;
        if let Some(frontend) = private_frontend {
            self.resource.bind_dependency(
                &key,
                BindingTarget::Entity {
                    collection: "frontends".to_string(),
                    name: frontend,
                },
                |fe, network| use_private_subnet(fe, default_subnet_ref(network)),
            )?;
        }
        self.network_key = Some(key);
        Ok(())
    }

    fn require_region(&self) -> Result<String> {
        self.region.clone().ok_or_else(|| {
            FluentError::Validation("region must be set before defining gateway dependencies".to_string())
        })
    }

    fn pending_names(&self, collection: &str) -> Result<Vec<String>> {
        let def = self.resource.collection_def(collection)?;
        Ok(self
            .resource
            .pending_view(collection)?
            .iter()
            .filter_map(|e| reconcile::entity_key(e, def.key))
            .collect())
    }

    fn require(&self, collection: &str, name: &str) -> Result<()> {
        match self.resource.entity_state(collection, name) {
            None | Some(EntityState::ToRemove) => Err(FluentError::Validation(format!(
                "{} '{}' does not exist",
                collection, name
            ))),
            Some(_) => Ok(()),
        }
    }
}

fn port_number(port: &Value) -> Option<u16> {
    port.pointer("/properties/port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
}

fn set_public_ip(frontend: &mut Value, reference: Value) {
    if let Some(props) = reconcile::ensure_object(frontend, "/properties") {
        props.insert("publicIPAddress".into(), reference);
    }
}

fn set_subnet(entity: &mut Value, subnet: Value) {
    if let Some(props) = reconcile::ensure_object(entity, "/properties") {
        props.insert("subnet".into(), subnet);
    }
}

fn use_private_subnet(frontend: &mut Value, subnet: Value) {
    if let Some(props) = reconcile::ensure_object(frontend, "/properties") {
        props.entry("subnet").or_insert(subnet);
        props
            .entry("privateIPAllocationMethod")
            .or_insert(json!("Dynamic"));
    }
}

fn default_subnet_ref(network: &Value) -> Value {
    match network.get("id").and_then(Value::as_str) {
        Some(id) => json!({ "id": child_id(id, "subnets", DEFAULT_SUBNET) }),
        None => {
            tracing::warn!("network result has no id");
            Value::Null
        }
    }
}

impl Staged for ApplicationGateway {
    fn staged(&self) -> &StagedResource {
        &self.resource
    }

    fn staged_mut(&mut self) -> &mut StagedResource {
        &mut self.resource
    }
}

impl HasBackends for ApplicationGateway {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::service::mock::EchoService;
    use crate::dag::ResourceDefinition;
    use crate::naming::SequentialNamer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SUBNET: &str =
        "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/virtualNetworks/vnet1/subnets/default";

    /// Network resource service that assigns ids like ARM does
    struct Provisioner {
        resource_type: &'static str,
        created: AtomicUsize,
    }

    impl Provisioner {
        fn new(resource_type: &'static str) -> Arc<Self> {
            Arc::new(Self {
                resource_type,
                created: AtomicUsize::new(0),
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceService for Provisioner {
        async fn get_by_resource_group(&self, _group: &str, name: &str) -> anyhow::Result<Value> {
            Err(anyhow::anyhow!("{} not found", name))
        }

        async fn create_or_update(&self, group: &str, name: &str, body: &Value) -> anyhow::Result<Value> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let mut created = body.clone();
            created["name"] = json!(name);
            created["id"] = json!(format!(
                "/subscriptions/sub1/resourceGroups/{}/providers/Microsoft.Network/{}/{}",
                group, self.resource_type, name
            ));
            Ok(created)
        }

        async fn delete(&self, _group: &str, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn gateway(service: Arc<EchoService>) -> ApplicationGateway {
        let resource = StagedResource::define(KIND, service, "rg1", "ag1")
            .unwrap()
            .with_subscription("sub1")
            .with_namer(Arc::new(SequentialNamer::new()));
        ApplicationGateway::from_staged(resource)
    }

    #[test]
    fn test_frontend_port_reuse_and_conflicts() {
        let mut ag = gateway(Arc::new(EchoService::default()));
        ag.with_frontend_port(80, Some("http")).unwrap();
        ag.with_frontend_port(80, None).unwrap();
        ag.with_frontend_port(80, Some("HTTP")).unwrap();
        assert_eq!(ag.staged().pending_view("frontendPorts").unwrap().len(), 1);

        assert!(matches!(
            ag.with_frontend_port(81, Some("http")),
            Err(FluentError::Validation(_))
        ));
        assert!(matches!(
            ag.with_frontend_port(80, Some("other")),
            Err(FluentError::Validation(_))
        ));

        ag.with_frontend_port(443, None).unwrap();
        assert_eq!(ag.frontend_port_name(443).unwrap().as_deref(), Some("port00000"));
    }

    #[tokio::test]
    async fn test_new_public_ip_lands_in_default_frontend() {
        let pips = Arc::new(EchoService::default());
        let mut ag = gateway(Arc::new(EchoService::default()));
        let pip = Arc::new(ResourceDefinition::new(
            pips.clone(),
            "rg1",
            "pip1",
            json!({ "id": "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/publicIPAddresses/pip1" }),
        ));
        ag.with_new_public_ip(pip).unwrap();
        ag.with_existing_subnet(SUBNET).unwrap();
        ag.commit().await.unwrap();

        let frontends = ag.frontends();
        assert_eq!(frontends.len(), 1);
        assert_eq!(frontends[0].name(), "frontend00000");
        assert!(frontends[0].public_ip_address_id().unwrap().ends_with("/pip1"));
        assert_eq!(pips.writes(), 1);
    }

    #[tokio::test]
    async fn test_rule_wiring_and_dangling_backend() {
        let mut ag = gateway(Arc::new(EchoService::default()));
        ag.with_existing_public_ip("/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/publicIPAddresses/pip1")
            .unwrap()
            .with_http_listener("listener1", 80, None)
            .unwrap()
            .with_backend_http_config("config1", None, None)
            .unwrap()
            .with_request_routing_rule("rule1", "listener1", None, "config1")
            .unwrap()
            .with_existing_subnet(SUBNET)
            .unwrap();
        ag.commit().await.unwrap();

        let rules = ag.staged().pending_view("rules").unwrap();
        let backend_id = rules[0]["properties"]["backendAddressPool"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let backend = name_from_resource_id(&backend_id).to_string();
        assert!(backend.starts_with("backend"));
        assert_eq!(ag.backends().len(), 1);
        assert_eq!(
            ag.staged().inner()["properties"]["backendHttpSettingsCollection"][0]["properties"]["port"],
            80
        );

        ag.without_backend(&backend).unwrap();
        let report = {
            ag.commit().await.unwrap();
            ag.staged().last_commit().unwrap().report
        };
        assert_eq!(report.cleared_references, 1);
        let rule = &ag.staged().inner()["properties"]["requestRoutingRules"][0];
        assert!(rule["properties"]["backendAddressPool"].is_null());
        assert!(rule["properties"]["httpListener"].is_object());
    }

    #[test]
    fn test_rule_requires_listener() {
        let mut ag = gateway(Arc::new(EchoService::default()));
        ag.with_backend_http_config("config1", Some(8080), None).unwrap();
        assert!(matches!(
            ag.with_request_routing_rule("rule1", "missing", Some("pool1"), "config1"),
            Err(FluentError::Validation(_))
        ));
    }

    #[test]
    fn test_without_url_path_map_drops_its_rules() {
        let map_id = "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/applicationGateways/ag1/urlPathMaps/map1";
        let inner = json!({
            "id": "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/applicationGateways/ag1",
            "name": "ag1",
            "properties": {
                "urlPathMaps": [ { "name": "map1" } ],
                "requestRoutingRules": [
                    { "name": "byPath", "properties": { "urlPathMap": { "id": map_id } } },
                    { "name": "basic", "properties": {} }
                ]
            }
        });
        let resource =
            StagedResource::from_inner(KIND, Arc::new(EchoService::default()), "rg1", inner).unwrap();
        let mut ag = ApplicationGateway::from_staged(resource);
        ag.without_url_path_map("map1").unwrap();

        let rules = ag.staged().pending_view("rules").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["name"], "basic");
        assert!(ag.staged().pending_view("urlPathMaps").unwrap().is_empty());
    }

    #[test]
    fn test_instance_count_defaults_sku() {
        let mut ag = gateway(Arc::new(EchoService::default()));
        ag.with_instance_count(3).with_http2(true);
        let (preview, _) = ag.staged().preview();
        assert_eq!(preview["properties"]["sku"]["name"], "Standard_Small");
        assert_eq!(preview["properties"]["sku"]["capacity"], 3);
        assert_eq!(preview["properties"]["enableHttp2"], true);
    }

    #[test]
    fn test_existing_subnet_creates_ip_configuration_once() {
        let mut ag = gateway(Arc::new(EchoService::default()));
        ag.with_existing_subnet("subnet-a").unwrap();
        ag.with_existing_subnet("subnet-b").unwrap();
        let configs = ag.staged().pending_view("ipConfigurations").unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0]["properties"]["subnet"]["id"], "subnet-b");
    }

    #[tokio::test]
    async fn test_new_gateway_gets_default_network_and_public_ip() {
        let parent = Arc::new(EchoService::default());
        let pips = Provisioner::new("publicIPAddresses");
        let networks = Provisioner::new("virtualNetworks");
        let mut ag = gateway(Arc::clone(&parent));
        ag.with_region("westus")
            .with_public_ip_service(pips.clone())
            .with_network_service(networks.clone());
        ag.with_http_listener("listener1", 80, None).unwrap();
        ag.commit().await.unwrap();

        assert_eq!(pips.created(), 1);
        assert_eq!(networks.created(), 1);
        let body = parent.last_body.lock().unwrap().clone().unwrap();
        let configs = body["properties"]["gatewayIPConfigurations"].as_array().unwrap();
        assert_eq!(configs.len(), 1);
        let subnet = configs[0]["properties"]["subnet"]["id"].as_str().unwrap();
        assert!(subnet.contains("/virtualNetworks/vnet"));
        assert!(subnet.ends_with("/subnets/default"));
        let frontend = &body["properties"]["frontendIPConfigurations"][0];
        assert!(frontend["properties"]["publicIPAddress"]["id"]
            .as_str()
            .unwrap()
            .contains("/publicIPAddresses/pip"));
    }

    #[tokio::test]
    async fn test_private_frontend_shares_gateway_subnet() {
        let mut ag = gateway(Arc::new(EchoService::default()));
        let frontend = ag.ensure_default_private_frontend().unwrap();
        ag.with_existing_subnet(SUBNET).unwrap();
        ag.commit().await.unwrap();

        let private = ag.staged().child::<Frontend>("frontends", &frontend).unwrap();
        assert_eq!(private.property("subnet").unwrap()["id"], SUBNET);
        assert_eq!(private.property("privateIPAllocationMethod").unwrap(), "Dynamic");
        assert!(!private.is_public());
    }

    #[tokio::test]
    async fn test_missing_default_services_fail_before_write() {
        let parent = Arc::new(EchoService::default());
        let mut ag = gateway(Arc::clone(&parent));
        ag.with_region("westus");
        ag.ensure_default_public_frontend().unwrap();
        ag.with_existing_subnet(SUBNET).unwrap();
        assert!(matches!(ag.commit().await, Err(FluentError::Validation(_))));

        let mut bare = gateway(Arc::clone(&parent));
        assert!(matches!(bare.commit().await, Err(FluentError::Validation(_))));
        assert_eq!(parent.writes(), 0);

        ag.with_existing_public_ip("/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Network/publicIPAddresses/pip1")
            .unwrap();
        ag.commit().await.unwrap();
        assert_eq!(parent.writes(), 1);
    }

    #[tokio::test]
    async fn test_default_dependencies_survive_a_failed_write() {
        let parent = Arc::new(EchoService::failing(1));
        let pips = Provisioner::new("publicIPAddresses");
        let networks = Provisioner::new("virtualNetworks");
        let mut ag = gateway(Arc::clone(&parent));
        ag.with_region("westus")
            .with_public_ip_service(pips.clone())
            .with_network_service(networks.clone());
        ag.ensure_default_public_frontend().unwrap();

        assert!(ag.commit().await.is_err());
        ag.commit().await.unwrap();

        assert_eq!(pips.created(), 1);
        assert_eq!(networks.created(), 1);
        assert_eq!(parent.writes(), 2);
        assert!(ag.frontends()[0].is_public());
    }
}

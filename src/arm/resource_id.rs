//! ARM resource id helpers
//!
//! Ids look like
//! `/subscriptions/{sub}/resourceGroups/{group}/providers/{ns}/{type}/{name}[/{childType}/{childName}]...`

/// Parsed form of an ARM resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    pub subscription_id: String,
    pub resource_group: String,
    pub provider: String,
    pub resource_type: String,
    pub name: String,
    /// Nested `(type, name)` segments after the top-level resource
    pub children: Vec<(String, String)>,
}

impl ResourceId {
    /// Parse an id; returns `None` for anything that is not a provider resource id.
    pub fn parse(id: &str) -> Option<Self> {
        let parts: Vec<&str> = id.trim_matches('/').split('/').collect();
        if parts.len() < 8 || parts.len() % 2 != 0 {
            return None;
        }
        if !parts[0].eq_ignore_ascii_case("subscriptions")
            || !parts[2].eq_ignore_ascii_case("resourceGroups")
            || !parts[4].eq_ignore_ascii_case("providers")
        {
            return None;
        }

        let children = parts[8..]
            .chunks(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();

        Some(Self {
            subscription_id: parts[1].to_string(),
            resource_group: parts[3].to_string(),
            provider: parts[5].to_string(),
            resource_type: parts[6].to_string(),
            name: parts[7].to_string(),
            children,
        })
    }

    /// Id of the top-level resource (children dropped)
    pub fn parent_id(&self) -> String {
        resource_id(
            &self.subscription_id,
            &self.resource_group,
            &self.provider,
            &self.resource_type,
            &self.name,
        )
    }
}

/// Build a top-level resource id.
pub fn resource_id(
    subscription_id: &str,
    resource_group: &str,
    provider: &str,
    resource_type: &str,
    name: &str,
) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
        subscription_id, resource_group, provider, resource_type, name
    )
}

/// Synthesize the id of a child entity, e.g. `{lb}/backendAddressPools/{pool}`.
pub fn child_id(parent_id: &str, child_type: &str, name: &str) -> String {
    format!("{}/{}/{}", parent_id.trim_end_matches('/'), child_type, name)
}

/// Last path segment of an id, which ARM uses as the entity name.
pub fn name_from_resource_id(id: &str) -> &str {
    id.trim_end_matches('/').rsplit('/').next().unwrap_or(id)
}

/// Join a base URL and a path segment with exactly one slash between them.
pub fn merge_path(base: &str, segment: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        segment.trim_start_matches('/')
    )
}

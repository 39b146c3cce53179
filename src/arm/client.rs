//! ARM Client
//!
//! Combines the HTTP client with the subscription context and builds
//! management-plane URLs.

use super::http::ArmHttpClient;
use anyhow::{Context, Result};
use serde_json::Value;
use url::Url;

/// Public cloud management endpoint
pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

/// Main ARM client
#[derive(Clone)]
pub struct ArmClient {
    pub http: ArmHttpClient,
    pub endpoint: Url,
    pub subscription_id: String,
    token: String,
}

impl ArmClient {
    /// Create a client for one subscription. The bearer token is used as given.
    pub fn new(endpoint: &str, subscription_id: &str, token: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid ARM endpoint: {}", endpoint))?;
        let http = ArmHttpClient::new()?;

        Ok(Self {
            http,
            endpoint,
            subscription_id: subscription_id.to_string(),
            token: token.to_string(),
        })
    }

    /// Replace the bearer token, e.g. after the caller refreshed it
    pub fn set_token(&mut self, token: &str) {
        self.token = token.to_string();
    }

    pub async fn get(&self, url: &str) -> Result<Value> {
        self.http.get(url, &self.token).await
    }

    pub async fn put(&self, url: &str, body: &Value) -> Result<Value> {
        self.http.put(url, &self.token, body).await
    }

    pub async fn delete(&self, url: &str) -> Result<Value> {
        self.http.delete(url, &self.token).await
    }

    // =========================================================================
    // URL helpers
    // =========================================================================

    /// Build a management URL for a path under the current subscription
    pub fn subscription_url(&self, path: &str) -> String {
        format!(
            "{}/subscriptions/{}/{}",
            self.endpoint.as_str().trim_end_matches('/'),
            urlencoding::encode(&self.subscription_id),
            path.trim_start_matches('/')
        )
    }

    /// Build a resource group scoped URL
    pub fn resource_group_url(&self, resource_group: &str, path: &str) -> String {
        self.subscription_url(&format!(
            "resourceGroups/{}/{}",
            urlencoding::encode(resource_group),
            path.trim_start_matches('/')
        ))
    }

    /// Build the URL of a provider resource, including `api-version`
    pub fn resource_url(
        &self,
        resource_group: &str,
        provider: &str,
        resource_type: &str,
        name: &str,
        api_version: &str,
    ) -> String {
        let path = format!(
            "providers/{}/{}/{}",
            provider,
            resource_type,
            urlencoding::encode(name)
        );
        format!(
            "{}?api-version={}",
            self.resource_group_url(resource_group, &path),
            urlencoding::encode(api_version)
        )
    }
}

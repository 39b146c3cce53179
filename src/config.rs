//! Configuration Management
//!
//! Handles persistent configuration storage for armfluent.

use crate::arm::client::DEFAULT_ENDPOINT;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable consulted for the subscription when neither the CLI
/// nor the config file names one
pub const SUBSCRIPTION_ENV: &str = "AZURE_SUBSCRIPTION_ID";

/// Default environment variable holding the bearer token
pub const TOKEN_ENV: &str = "ARM_ACCESS_TOKEN";

/// User configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Management endpoint, e.g. a sovereign cloud
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Last used subscription
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Resource group used when a plan does not name one
    #[serde(default)]
    pub default_resource_group: Option<String>,
    /// Name of the environment variable that holds the bearer token
    #[serde(default)]
    pub token_env: Option<String>,
}

impl Config {
    /// Directory holding the config file and the log
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("armfluent"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_json(&content),
            Err(e) => {
                tracing::warn!("Failed to read {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Parse a config file body, falling back to defaults on malformed input
    pub fn from_json(content: &str) -> Self {
        serde_json::from_str(content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed config: {}", e);
            Self::default()
        })
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };

        // Create parent directory
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Get effective endpoint (CLI > config > public cloud)
    pub fn effective_endpoint(&self, cli: Option<&str>) -> String {
        cli.map(str::to_string)
            .or_else(|| self.endpoint.clone())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }

    /// Get effective subscription (CLI > config > environment)
    pub fn effective_subscription(&self, cli: Option<&str>) -> Option<String> {
        self.resolve_subscription(cli, std::env::var(SUBSCRIPTION_ENV).ok())
    }

    fn resolve_subscription(&self, cli: Option<&str>, env: Option<String>) -> Option<String> {
        cli.map(str::to_string)
            .or_else(|| self.subscription_id.clone())
            .or(env)
            .filter(|s| !s.is_empty())
    }

    /// Get effective resource group (CLI/plan > config)
    pub fn effective_resource_group(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::to_string)
            .or_else(|| self.default_resource_group.clone())
    }

    /// Name of the environment variable holding the bearer token
    pub fn token_env(&self) -> &str {
        self.token_env.as_deref().unwrap_or(TOKEN_ENV)
    }

    /// Read the bearer token from the configured environment variable
    pub fn effective_token(&self) -> Option<String> {
        std::env::var(self.token_env()).ok().filter(|t| !t.is_empty())
    }

    /// Set subscription and save
    pub fn set_subscription(&mut self, subscription_id: &str) -> Result<()> {
        self.subscription_id = Some(subscription_id.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.effective_endpoint(None), DEFAULT_ENDPOINT);
        assert_eq!(config.token_env(), TOKEN_ENV);
        assert_eq!(config.effective_resource_group(None), None);
    }

    #[test]
    fn test_cli_wins_over_config() {
        let config = Config::from_json(
            r#"{"endpoint": "https://management.chinacloudapi.cn", "subscription_id": "from-config"}"#,
        );
        assert_eq!(
            config.effective_endpoint(Some("http://localhost:8080")),
            "http://localhost:8080"
        );
        assert_eq!(config.effective_endpoint(None), "https://management.chinacloudapi.cn");
        assert_eq!(
            config.resolve_subscription(Some("from-cli"), Some("from-env".into())),
            Some("from-cli".to_string())
        );
        assert_eq!(
            config.resolve_subscription(None, Some("from-env".into())),
            Some("from-config".to_string())
        );
    }

    #[test]
    fn test_environment_is_last_resort() {
        let config = Config::default();
        assert_eq!(
            config.resolve_subscription(None, Some("from-env".into())),
            Some("from-env".to_string())
        );
        assert_eq!(config.resolve_subscription(None, Some(String::new())), None);
    }

    #[test]
    fn test_malformed_config_falls_back() {
        let config = Config::from_json("{ not json");
        assert!(config.subscription_id.is_none());
    }
}

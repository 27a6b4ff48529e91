//! Configuration file loading and management
//!
//! This module handles loading and parsing the configuration from
//! `$XDG_CONFIG_HOME/todoforge/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use todoforge_auth::{AuthConfig, InteractiveFlow};
use todoforge_graph::TodoApi;

/// Public client id of the application registration used by default.
pub const DEFAULT_CLIENT_ID: &str = "1950a258-227b-4e31-a9cf-717495945fc2";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Sign-in configuration
    #[serde(default)]
    pub auth: AuthSettings,
    /// Graph API configuration
    #[serde(default)]
    pub graph: GraphSettings,
    /// Logging configuration
    #[serde(default)]
    pub log: LogSettings,
}

/// Sign-in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthSettings {
    /// Application (client) id of the public client registration
    pub client_id: String,
    /// Authority URL including the tenant
    /// Default: "https://login.microsoftonline.com/common"
    pub authority: String,
    /// Delegated Graph scopes to request
    /// Default: ["Tasks.ReadWrite"]
    pub scopes: Vec<String>,
    /// Path to the token cache file
    /// If None, uses XDG_DATA_HOME/todoforge/token_cache.json
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
    /// Open the sign-in page in the default browser
    /// Default: true
    pub open_browser: bool,
    /// Interactive sign-in flow ("device_code" or "redirect")
    /// Default: "device_code"
    pub flow: InteractiveFlow,
    /// Loopback port for the redirect flow; 0 picks a free port
    /// Default: 0
    pub redirect_port: u16,
}

/// Graph API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphSettings {
    /// Root of the Graph API
    /// Default: "https://graph.microsoft.com/v1.0"
    pub base_url: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "warn"
    pub level: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            authority: AuthConfig::DEFAULT_AUTHORITY.to_string(),
            scopes: vec!["Tasks.ReadWrite".to_string()],
            cache_path: None,
            open_browser: true,
            flow: InteractiveFlow::DeviceCode,
            redirect_port: 0,
        }
    }
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            base_url: TodoApi::GRAPH_BASE_URL.to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    /// The parsed configuration or an error if loading/parsing fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/todoforge/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "raibid-labs", "todoforge")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Create a default configuration file with documented comments
    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    fn default_config_content() -> String {
        format!(
            r#"# todoforge configuration

[auth]
# Application (client) id of a public client registration
client_id = "{client_id}"

# Authority to sign in against, including the tenant
# Use ".../organizations" or ".../<tenant-id>" to restrict sign-in
authority = "{authority}"

# Delegated Graph scopes; openid, profile and offline_access are always added
scopes = ["Tasks.ReadWrite"]

# Where the token cache is stored
# If not specified, defaults to $XDG_DATA_HOME/todoforge/token_cache.json
# cache_path = "/path/to/token_cache.json"

# Open the sign-in page in the default browser
open_browser = true

# Interactive sign-in flow
# "device_code": enter a code on https://microsoft.com/devicelogin
# "redirect": sign in in the browser, which redirects back to a local port
flow = "device_code"

# Local port for the redirect flow; 0 picks a free port
# A fixed port must match a redirect URI of the app registration
redirect_port = 0

[graph]
# Root of the Microsoft Graph API
base_url = "{base_url}"

[log]
# Log level: trace, debug, info, warn, error
# RUST_LOG overrides this when set
level = "warn"
"#,
            client_id = DEFAULT_CLIENT_ID,
            authority = AuthConfig::DEFAULT_AUTHORITY,
            base_url = TodoApi::GRAPH_BASE_URL,
        )
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.auth.client_id.trim().is_empty() {
            anyhow::bail!("auth.client_id must not be empty");
        }

        if !self.auth.authority.starts_with("https://") && !self.auth.authority.starts_with("http://") {
            anyhow::bail!("Invalid auth.authority: {}", self.auth.authority);
        }

        if self.auth.scopes.is_empty() {
            anyhow::bail!("auth.scopes must contain at least one scope");
        }

        if !self.graph.base_url.starts_with("https://") && !self.graph.base_url.starts_with("http://") {
            anyhow::bail!("Invalid graph.base_url: {}", self.graph.base_url);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log.level.as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.log.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Get the token cache path
    ///
    /// Returns the configured cache path or the default XDG data directory path
    pub fn cache_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.auth.cache_path {
            return Ok(path.clone());
        }

        let dirs = directories::ProjectDirs::from("", "raibid-labs", "todoforge")
            .context("Failed to determine project directories")?;

        Ok(dirs.data_dir().join("token_cache.json"))
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig::new(self.auth.client_id.clone(), self.auth.authority.clone())
            .with_redirect_port(self.auth.redirect_port)
    }
}

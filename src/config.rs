//! Runtime configuration.
//!
//! Resolved once when the host creates the collector and then passed into the services; nothing
//! below this point reads the environment.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data_value_set::DataElementMapping;
use crate::error::{CoreError, Result};

const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 60;

/// Top-level configuration handed over by the host as JSON.
///
/// ```rust
/// use health_sync_core::config::CoreConfig;
///
/// let config = CoreConfig::from_json(r#"{
///     "storage_path": "collector_data",
///     "submission_url": "https://script.example.org/exec",
///     "dhis2": {
///         "server_url": "https://dhis2.example.org",
///         "username": "admin",
///         "password": "district",
///         "data_set_id": "GlBr79yV3OB"
///     },
///     "data_elements": { "rdt_positive": "GJNa6pX9iyo" }
/// }"#)?;
///
/// assert_eq!(config.delivery_timeout_secs, 30);
/// assert!(config.start_online);
/// # Ok::<(), health_sync_core::error::CoreError>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// LMDB directory for the pending queue, without the `.lmdb` suffix.
    pub storage_path: String,
    /// Collection endpoint each record is POSTed to.
    pub submission_url: String,
    pub dhis2: Dhis2Config,
    /// Form field name to DHIS2 data element id.
    #[serde(default)]
    pub data_elements: DataElementMapping,
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    #[serde(default = "default_registry_timeout_secs")]
    pub registry_timeout_secs: u64,
    /// Connectivity assumed until the host signals otherwise.
    #[serde(default = "default_start_online")]
    pub start_online: bool,
}

/// DHIS2 connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct Dhis2Config {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub data_set_id: String,
    /// When set, requests are relayed through this CORS proxy instead of going direct.
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl fmt::Debug for Dhis2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dhis2Config")
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("data_set_id", &self.data_set_id)
            .field("proxy_url", &self.proxy_url)
            .finish()
    }
}

impl CoreConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        require_non_empty("storage_path", &self.storage_path)?;
        require_url("submission_url", &self.submission_url)?;
        require_url("dhis2.server_url", &self.dhis2.server_url)?;
        require_non_empty("dhis2.data_set_id", &self.dhis2.data_set_id)?;

        if let Some(proxy) = &self.dhis2.proxy_url {
            require_url("dhis2.proxy_url", proxy)?;
        }

        if self.delivery_timeout_secs == 0 {
            return Err(CoreError::Config("delivery_timeout_secs must be greater than zero".into()));
        }
        if self.registry_timeout_secs == 0 {
            return Err(CoreError::Config("registry_timeout_secs must be greater than zero".into()));
        }

        Ok(())
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoreError::Config(format!("{field} cannot be empty")));
    }
    Ok(())
}

fn require_url(field: &str, value: &str) -> Result<()> {
    require_non_empty(field, value)?;
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(CoreError::Config(format!("{field} must be an http(s) URL")));
    }
    Ok(())
}

fn default_delivery_timeout_secs() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_SECS
}

fn default_registry_timeout_secs() -> u64 {
    DEFAULT_REGISTRY_TIMEOUT_SECS
}

fn default_start_online() -> bool {
    true
}

//! Runtime configuration for the sharding client.
//!
//! Loaded from a TOML file, overridden from the environment, or built in
//! code with the `with_*` methods. Every field has a default so an empty
//! file is a valid configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::client::backend::BackendConfig;
use crate::error::{Error, Result};

/// Default coordination service address.
pub const DEFAULT_COORDINATION_ADDRESS: &str = "127.0.0.1:2181";
/// Default namespace root; shards live under `<base_path>/cluster`.
pub const DEFAULT_BASE_PATH: &str = "/redis/servers";
/// Child of the base path holding one node per shard.
pub const CLUSTER_NODE: &str = "cluster";

/// Environment variable overriding `coordination_address`.
pub const ENV_COORDINATION_ADDRESS: &str = "SHARD_KEEPER_ZK";
/// Environment variable overriding `base_path`.
pub const ENV_BASE_PATH: &str = "SHARD_KEEPER_BASE_PATH";
/// Environment variable overriding `backend.password`.
pub const ENV_BACKEND_PASSWORD: &str = "SHARD_KEEPER_PASSWORD";

/// What to do with an existing entry when its node payload becomes the
/// vacant sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VacantPolicy {
    /// Drop the entry; keys routed to the shard fail with `ShardUnavailable`.
    #[default]
    Remove,
    /// Keep serving the last known endpoint until a new one is published.
    KeepStale,
}

/// Backend connection settings as they appear in the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub password: Option<String>,
    pub tls: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        let defaults = BackendConfig::default();
        Self {
            connection_timeout_ms: defaults.connection_timeout.as_millis() as u64,
            command_timeout_ms: defaults.command_timeout.as_millis() as u64,
            password: None,
            tls: false,
        }
    }
}

impl From<&BackendSettings> for BackendConfig {
    fn from(settings: &BackendSettings) -> Self {
        Self {
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            command_timeout: Duration::from_millis(settings.command_timeout_ms),
            password: settings.password.clone(),
            tls: settings.tls,
        }
    }
}

/// Exponential backoff for coordination service reconnects.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculates the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Runtime configuration for the sharding client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Coordination service ensemble, e.g. `"zk1:2181,zk2:2181"`.
    pub coordination_address: String,

    /// Namespace root; shard nodes live under `<base_path>/cluster`.
    pub base_path: String,

    /// Handling of the vacant sentinel payload.
    pub vacant_policy: VacantPolicy,

    /// Settings for every shard connection.
    pub backend: BackendSettings,

    /// Reconnect schedule for the coordination session.
    pub reconnect: BackoffConfig,

    /// Port for the health and metrics server (binary only).
    pub health_port: u16,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            coordination_address: DEFAULT_COORDINATION_ADDRESS.to_string(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            vacant_policy: VacantPolicy::default(),
            backend: BackendSettings::default(),
            reconnect: BackoffConfig::default(),
            health_port: 8080,
        }
    }
}

impl KeeperConfig {
    /// Create a configuration for the given ensemble and namespace root.
    pub fn new(coordination_address: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            coordination_address: coordination_address.into(),
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file at the given path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: KeeperConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup(ENV_COORDINATION_ADDRESS) {
            self.coordination_address = address;
        }
        if let Some(base_path) = lookup(ENV_BASE_PATH) {
            self.base_path = base_path;
        }
        if let Some(password) = lookup(ENV_BACKEND_PASSWORD) {
            self.backend.password = Some(password);
        }
        self
    }

    /// Set the vacant sentinel policy.
    pub fn with_vacant_policy(mut self, policy: VacantPolicy) -> Self {
        self.vacant_policy = policy;
        self
    }

    /// Set the reconnect schedule.
    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the backend password.
    pub fn with_backend_password(mut self, password: String) -> Self {
        self.backend.password = Some(password);
        self
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.coordination_address.trim().is_empty() {
            return Err(Error::InvalidConfig("coordination_address is empty".to_string()));
        }
        if !self.base_path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "base_path must be absolute, got {:?}",
                self.base_path
            )));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                self.reconnect.multiplier
            )));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(Error::InvalidConfig(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the node whose children are the shard nodes.
    pub fn cluster_path(&self) -> String {
        crate::coordination::child_path(&self.base_path, CLUSTER_NODE)
    }

    /// Backend connection settings.
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::from(&self.backend)
    }
}

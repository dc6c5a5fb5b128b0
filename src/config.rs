//! Configuration System
//!
//! Service configuration for the control daemon, loaded from a TOML file
//! with serde defaulting and validated before the service starts.

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the control protocol service listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Path of the persisted deployment configuration document
    #[serde(default = "default_deployment_path")]
    pub deployment_path: PathBuf,

    /// TLS material for mutually-authenticated agent connections
    pub tls: Option<TlsConfig>,

    /// Seconds of source inactivity before its state contributions expire
    #[serde(default = "default_expiry_window_secs")]
    pub expiry_window_secs: u64,

    /// Seconds between keepalive probes on each connection
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Number of generations kept for incremental resync
    #[serde(default = "default_generation_capacity")]
    pub generation_capacity: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Paths to PEM material issued by the cluster certificate authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Cluster CA certificate used to verify the peer
    pub ca_certificate: PathBuf,
    /// This endpoint's certificate chain
    pub certificate: PathBuf,
    /// This endpoint's private key
    pub key: PathBuf,
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:4524".parse().expect("static address parses")
}

fn default_deployment_path() -> PathBuf {
    PathBuf::from("/var/lib/converge/current_configuration.json")
}

fn default_expiry_window_secs() -> u64 {
    crate::aggregator::DEFAULT_EXPIRY_WINDOW_SECS as u64
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_generation_capacity() -> usize {
    100
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            deployment_path: default_deployment_path(),
            tls: None,
            expiry_window_secs: default_expiry_window_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            generation_capacity: default_generation_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: ServiceConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiry_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "expiry_window_secs must be positive".to_string(),
            ));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_interval_secs must be positive".to_string(),
            ));
        }
        if self.generation_capacity == 0 {
            return Err(ConfigError::Invalid(
                "generation_capacity must be positive".to_string(),
            ));
        }
        if self.deployment_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "deployment_path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

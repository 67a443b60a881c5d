use crate::config::{
    Cli, LoggingConfig, NetworkConfig, ProxyConfig, QueryConfig, RetrievalConfig,
    MAX_KEEP_CACHE_MINUTES,
};
use clap::Parser;
use dimse::{DimseConfig, DimseError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("proxy.id must not be empty")]
    InvalidProxyID,

    #[error("invalid dimse settings: {0}")]
    InvalidDimse(#[from] DimseError),

    #[error("invalid retrieval settings: {0}")]
    InvalidRetrieval(String),

    #[error("invalid network settings: {0}")]
    InvalidNetwork(String),
}

/// Full gateway configuration, as read from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub dimse: DimseConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

impl Config {
    /// Load the configuration named on the command line.
    pub fn from_args() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        Self::from_file(&cli.config_path)
    }

    /// Read, parse and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()?;
        self.dimse.validate()?;

        if self.retrieval.max_associations == 0 {
            return Err(ConfigError::InvalidRetrieval(
                "max_associations must be at least 1".to_string(),
            ));
        }
        if self.retrieval.storage_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidRetrieval(
                "storage_path must not be empty".to_string(),
            ));
        }
        if self.retrieval.keep_cache_minutes > MAX_KEEP_CACHE_MINUTES {
            return Err(ConfigError::InvalidRetrieval(format!(
                "keep_cache_minutes must not exceed {}",
                MAX_KEEP_CACHE_MINUTES
            )));
        }
        if self.retrieval.sweep_interval_secs == Some(0) {
            return Err(ConfigError::InvalidRetrieval(
                "sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.network.http.bind_port == 0 {
            return Err(ConfigError::InvalidNetwork(
                "http.bind_port must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` the HTTP listener binds to
    pub fn bind_address(&self) -> String {
        format!(
            "{}:{}",
            self.network.http.bind_address, self.network.http.bind_port
        )
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidProxyID);
        }
        Ok(())
    }
}

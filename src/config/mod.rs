mod logging_config;
mod proxy_config;
mod retrieval_config;
pub mod config;

pub use config::{Config, ConfigError};
pub use logging_config::LoggingConfig;
pub use proxy_config::{HttpConfig, NetworkConfig, ProxyConfig};
pub use retrieval_config::{QueryConfig, RetrievalConfig, MAX_KEEP_CACHE_MINUTES};

use clap::Parser;
use std::path::PathBuf;

/// Command line arguments of the gateway binary.
#[derive(Debug, Parser)]
#[command(name = "pacs-proxy", about = "Caching DICOMweb gateway in front of a DIMSE archive")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config.toml")]
    pub config_path: PathBuf,
}

impl Cli {
    /// Creates a new `Cli` instance with the provided configuration path.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }
}

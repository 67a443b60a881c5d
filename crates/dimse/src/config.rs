//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DimseError, Result};
use crate::DEFAULT_DIMSE_PORT;

/// Transfer syntax written by default: Explicit VR Little Endian
pub const DEFAULT_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2.1";

/// How instances are pulled from the remote archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveMode {
    /// C-GET: instances arrive on the association we opened
    #[default]
    Get,
    /// C-MOVE: the archive pushes instances to our store listener
    Move,
}

/// Configuration for the DIMSE side of the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// This gateway's application entity
    pub source: RemoteNode,

    /// The archive queried and retrieved from
    pub target: RemoteNode,

    #[serde(default)]
    pub retrieve_mode: RetrieveMode,

    /// Spawn a store listener on `source.port` (C-MOVE destination)
    #[serde(default)]
    pub start_listener: bool,

    /// Transfer syntax proposed on the network and written to disk
    #[serde(default = "default_transfer_syntax")]
    pub transfer_syntax: String,

    /// Pass verbose flags to the DICOM tools
    #[serde(default)]
    pub verbose: bool,

    /// Upper bound for a single external operation, in seconds
    pub timeout_secs: Option<u64>,
}

/// Configuration for a DICOM application entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Application Entity Title
    pub ae_title: String,

    /// Host address
    pub host: String,

    /// Port
    pub port: u16,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            source: RemoteNode::new("PACS_PROXY", "127.0.0.1", 8888),
            target: RemoteNode::new("PACS", "127.0.0.1", DEFAULT_DIMSE_PORT),
            retrieve_mode: RetrieveMode::Get,
            start_listener: false,
            transfer_syntax: default_transfer_syntax(),
            verbose: false,
            timeout_secs: None,
        }
    }
}

impl DimseConfig {
    /// Per-operation timeout, if configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        self.target.validate()?;

        if self.transfer_syntax.trim().is_empty() {
            return Err(DimseError::config("Transfer syntax cannot be empty"));
        }

        if self.start_listener && self.retrieve_mode != RetrieveMode::Move {
            tracing::warn!("start_listener is only used with retrieve_mode = \"move\"");
        }

        if self.timeout_secs == Some(0) {
            return Err(DimseError::config("timeout_secs must be greater than 0"));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
        }
    }

    /// Validate the node configuration
    pub fn validate(&self) -> Result<()> {
        if self.ae_title.is_empty() || self.ae_title.len() > 16 {
            return Err(DimseError::config(format!(
                "AE title '{}' must be 1-16 characters",
                self.ae_title
            )));
        }

        if self.host.is_empty() {
            return Err(DimseError::config("Host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Port must be greater than 0"));
        }

        Ok(())
    }
}

fn default_transfer_syntax() -> String {
    DEFAULT_TRANSFER_SYNTAX.to_string()
}

//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("Malformed operation result: {raw}")]
    MalformedResult { raw: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create a new invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Raw payload carried by a malformed result, if any
    pub fn raw_payload(&self) -> Option<&str> {
        match self {
            DimseError::MalformedResult { raw } => Some(raw),
            _ => None,
        }
    }

    /// Check if this error is worth retrying by the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DimseError::Network(_) | DimseError::OperationFailed(_))
    }
}

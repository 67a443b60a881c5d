//! DIMSE (DICOM Message Service Element) network interface
//!
//! The gateway talks to the remote archive exclusively through the
//! [`DimseNetwork`] trait: a structured [`DimseRequest`] goes in and an
//! [`OperationResult`] with a numeric code comes back.
//!
//! # Features
//! - `dcmtk_cli` (default): [`DimseScu`] drives the DCMTK tools
//!   (`echoscu`, `findscu`, `getscu`, `movescu`, `termscu`, `storescp`,
//!   `dcmconv` and the `dcmc*` encoders)

pub mod config;
pub mod error;
pub mod network;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode, RetrieveMode, DEFAULT_TRANSFER_SYNTAX};
pub use error::{DimseError, Result};
pub use network::DimseNetwork;
pub use scu::DimseScu;
pub use types::{DimseOperation, DimseRequest, DimseTag, OperationResult, QueryLevel, ResultCode};

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

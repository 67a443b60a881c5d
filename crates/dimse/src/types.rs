//! Common types for DIMSE operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::RemoteNode;
use crate::error::{DimseError, Result};

/// Tag keys used when building identifiers, as 8 hex digits
pub mod tags {
    pub const QUERY_RETRIEVE_LEVEL: &str = "00080052";
    pub const STUDY_INSTANCE_UID: &str = "0020000D";
    pub const SERIES_INSTANCE_UID: &str = "0020000E";
    pub const SOP_INSTANCE_UID: &str = "00080018";
    pub const PATIENT_NAME: &str = "00100010";
}

/// DICOM query/retrieve levels, ordered from coarse to fine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryLevel {
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

impl QueryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLevel::Study => "STUDY",
            QueryLevel::Series => "SERIES",
            QueryLevel::Image => "IMAGE",
        }
    }
}

impl fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryLevel {
    type Err = DimseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            other => Err(DimseError::invalid_request(format!(
                "unknown query level '{}'",
                other
            ))),
        }
    }
}

/// Operations understood by the network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimseOperation {
    /// C-ECHO verification
    Echo,
    /// C-FIND query
    Find,
    /// C-MOVE retrieval towards our store listener
    Move,
    /// C-GET retrieval on the same association
    Get,
    /// Ask a listener to shut down
    Shutdown,
    /// Run a store listener until it is shut down
    StartListener,
    /// Rewrite a local file in another transfer syntax
    Recompress,
}

impl fmt::Display for DimseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DimseOperation::Echo => "C-ECHO",
            DimseOperation::Find => "C-FIND",
            DimseOperation::Move => "C-MOVE",
            DimseOperation::Get => "C-GET",
            DimseOperation::Shutdown => "SHUTDOWN",
            DimseOperation::StartListener => "STORE-SCP",
            DimseOperation::Recompress => "RECOMPRESS",
        };
        f.write_str(name)
    }
}

/// A single identifier attribute, keyed by its tag as 8 hex digits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimseTag {
    pub key: String,
    pub value: String,
}

impl DimseTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Tag formatted as `(gggg,eeee)` for DCMTK `-k` arguments
    pub fn dcmtk_key(&self) -> String {
        if self.key.len() == 8 && self.key.chars().all(|c| c.is_ascii_hexdigit()) {
            format!("({},{})", &self.key[0..4], &self.key[4..8])
        } else {
            self.key.clone()
        }
    }
}

/// Structured request handed to the network interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseRequest {
    pub operation: DimseOperation,
    /// Ordered identifier attributes
    pub tags: Vec<DimseTag>,
    pub source: RemoteNode,
    pub target: RemoteNode,
    pub transfer_syntax: Option<String>,
    /// Destination directory for retrieved or rewritten files
    pub storage_path: Option<PathBuf>,
    /// Input file for `Recompress`
    pub source_path: Option<PathBuf>,
    pub verbose: bool,
}

impl DimseRequest {
    pub fn new(operation: DimseOperation, source: RemoteNode, target: RemoteNode) -> Self {
        Self {
            operation,
            tags: Vec::new(),
            source,
            target,
            transfer_syntax: None,
            storage_path: None,
            source_path: None,
            verbose: false,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(DimseTag::new(key, value));
        self
    }

    pub fn with_transfer_syntax(mut self, transfer_syntax: impl Into<String>) -> Self {
        self.transfer_syntax = Some(transfer_syntax.into());
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// First value recorded for `key`
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key.eq_ignore_ascii_case(key))
            .map(|t| t.value.as_str())
    }
}

/// Numeric outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ResultCode {
    /// 0
    Success,
    /// 1: more to come, ask again later
    Pending,
    /// 2: some sub-operations failed
    PartialSuccess,
    /// Anything else
    Failure(i64),
}

impl ResultCode {
    pub fn as_i64(&self) -> i64 {
        match self {
            ResultCode::Success => 0,
            ResultCode::Pending => 1,
            ResultCode::PartialSuccess => 2,
            ResultCode::Failure(code) => *code,
        }
    }

    /// Whether retrieved data can be used
    pub fn is_usable(&self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::PartialSuccess)
    }
}

impl From<i64> for ResultCode {
    fn from(code: i64) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::Pending,
            2 => ResultCode::PartialSuccess,
            other => ResultCode::Failure(other),
        }
    }
}

impl From<ResultCode> for i64 {
    fn from(code: ResultCode) -> Self {
        code.as_i64()
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// Result reported by the network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub code: ResultCode,
    #[serde(default)]
    pub message: Option<String>,
    /// JSON-encoded array of matches for `Find`
    #[serde(default)]
    pub container: Option<String>,
}

impl OperationResult {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            message: None,
            container: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success)
    }

    pub fn failure(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::from(code),
            message: Some(message.into()),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Parse a JSON result payload. Anything unparseable is a failure carrying the raw text.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(DimseError::MalformedResult {
                raw: raw.to_string(),
            });
        }
        serde_json::from_str(raw).map_err(|_| DimseError::MalformedResult {
            raw: raw.to_string(),
        })
    }

    /// Decode the `Find` container into individual datasets
    pub fn matches(&self) -> Result<Vec<serde_json::Value>> {
        match self.container.as_deref() {
            None => Ok(Vec::new()),
            Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(serde_json::Value::Array(items)) => Ok(items),
                Ok(serde_json::Value::Null) => Ok(Vec::new()),
                _ => Err(DimseError::MalformedResult {
                    raw: raw.to_string(),
                }),
            },
        }
    }
}

//! Deduplicated, bounded retrieval of studies from the remote archive.
//!
//! Concurrent requests resolving to the same lock key share one outbound
//! fetch; the [`ConcurrencyLimiter`] caps how many fetches run at once.

use std::sync::Arc;

use dimse::{DimseError, QueryLevel, ResultCode};
use thiserror::Error;

pub mod coordinator;
pub mod limiter;

pub use coordinator::{FetchCoordinator, FetchSettings};
pub use limiter::{ConcurrencyLimiter, LimiterClosed};

/// Identity of a node in the study/series/image hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub study_uid: String,
    pub series_uid: String,
    pub instance_uid: String,
}

impl ResourceKey {
    pub fn new(
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        instance_uid: impl Into<String>,
    ) -> Self {
        Self {
            study_uid: study_uid.into(),
            series_uid: series_uid.into(),
            instance_uid: instance_uid.into(),
        }
    }

    /// Identifier that deduplicates fetches at `level`
    pub fn lock_key(&self, level: QueryLevel) -> &str {
        match level {
            QueryLevel::Study => &self.study_uid,
            QueryLevel::Series => &self.series_uid,
            QueryLevel::Image => &self.instance_uid,
        }
    }
}

/// Successful fetch, shared by every request that joined it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub code: ResultCode,
    /// Whether this fetch created the study's cache entry
    pub recorded: bool,
}

/// Why a fetch did not produce usable data.
///
/// Cloneable so that every joined waiter receives the same error.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("archive rejected retrieval with code {code}: {message}")]
    Rejected { code: i64, message: String },

    #[error("network operation failed: {0}")]
    Network(Arc<DimseError>),

    #[error("fetch abandoned: gateway is shutting down")]
    Shutdown,

    #[error("fetch task ended without reporting a result")]
    Abandoned,

    #[error(transparent)]
    LimiterClosed(#[from] LimiterClosed),
}

impl From<DimseError> for FetchError {
    fn from(err: DimseError) -> Self {
        FetchError::Network(Arc::new(err))
    }
}

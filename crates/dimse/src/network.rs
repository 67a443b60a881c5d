//! The boundary between the gateway and the remote archive

use async_trait::async_trait;

use crate::types::{DimseRequest, OperationResult};
use crate::Result;

/// Anything able to carry out a [`DimseRequest`].
///
/// Implementations report protocol-level outcomes through
/// [`OperationResult::code`] and reserve `Err` for transport faults or
/// results that could not be interpreted. Callers treat both uniformly.
#[async_trait]
pub trait DimseNetwork: Send + Sync {
    async fn execute(&self, request: DimseRequest) -> Result<OperationResult>;
}

pub mod executor;


// Re-exports for convenience
pub use executor::{InstanceRequest, PipelineSettings, RetrievalPipeline, RetrieveError};

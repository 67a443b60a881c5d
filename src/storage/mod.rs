use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub mod cache;
pub mod filesystem;
pub mod leases;

pub use cache::{CacheEntry, CacheError, RetrievalCache, SweepReport};
pub use filesystem::FilesystemStorage;
pub use leases::StudyLease;

/// Error type for storage operations
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Path(String),
    Config(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Path(e) => write!(f, "Path error: {}", e),
            StorageError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Directory below the storage root holding the cache database
pub const PERSIST_DIR: &str = "persist";

/// Check that an identifier can be used as a single path component below the storage root
pub fn validate_component(id: &str) -> StorageResult<()> {
    if id.is_empty() || id == "." || id == ".." || id.starts_with('.') {
        return Err(StorageError::Path(format!("'{}' is not a valid identifier", id)));
    }
    if id == PERSIST_DIR {
        return Err(StorageError::Path(format!("'{}' is a reserved directory", id)));
    }
    if id.contains(['/', '\\', '\0']) {
        return Err(StorageError::Path(format!(
            "'{}' must not contain path separators",
            id
        )));
    }
    Ok(())
}

/// Read access to the `<root>/<study>/<instance>` tree populated by the network interface
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Get the base path for this storage backend
    fn base_path(&self) -> &Path;

    /// Directory holding every instance of a study
    fn study_path(&self, study_uid: &str) -> PathBuf {
        self.base_path().join(study_uid)
    }

    /// Expected location of a single instance
    fn instance_path(&self, study_uid: &str, instance_uid: &str) -> PathBuf {
        self.study_path(study_uid).join(instance_uid)
    }

    /// Whether a file is present at `path`; errors count as absent
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Read the bytes of a file
    async fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        tokio::fs::read(path).await.map_err(StorageError::from)
    }
}

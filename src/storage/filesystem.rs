use crate::storage::{StorageBackend, StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Filesystem-based storage backend
///
/// Instances live at `<root>/<study uid>/<instance uid>`.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem storage backend with the given root path
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // Keep the path verbatim: canonicalizing would resolve symlinks
        // such as /var -> /private/var and break prefix comparisons.
        Ok(Self { root_path })
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn base_path(&self) -> &Path {
        &self.root_path
    }
}

use chrono::{DateTime, Duration, TimeZone, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::storage::leases::{LeaseTable, StudyLease};
use crate::storage::validate_component;

/// study uid -> expiry as unix milliseconds
const STUDY_EXPIRY: TableDefinition<&str, i64> = TableDefinition::new("study_expiry");

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] redb::Error),

    #[error("expiry of study {study_uid} after {ttl_minutes} minutes is out of range")]
    ExpiryOutOfRange { study_uid: String, ttl_minutes: i64 },

    #[error("failed to prepare cache directory {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

macro_rules! cache_error_from_redb {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for CacheError {
                fn from(err: $err) -> Self {
                    CacheError::Database(err.into())
                }
            }
        )*
    };
}

cache_error_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// A cached study and the moment it becomes eligible for eviction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub study_uid: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Studies whose directory and entry were removed
    pub evicted: Vec<String>,
    /// Studies whose deletion failed; retried by a later sweep
    pub failed: Vec<String>,
    /// Expired studies left alone because they are protected or leased
    pub skipped: Vec<String>,
}

/// Durable study -> expiry mapping backing the on-disk instance tree.
///
/// This is the only component that deletes study directories.
pub struct RetrievalCache {
    db: Database,
    leases: Arc<LeaseTable>,
}

impl std::fmt::Debug for RetrievalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalCache").finish_non_exhaustive()
    }
}

impl RetrievalCache {
    /// Open or create the cache database
    pub fn open(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let db = Database::create(db_path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(STUDY_EXPIRY)?;
        }
        write_txn.commit()?;

        tracing::info!("🗄️  Retrieval cache opened at {}", db_path.display());
        Ok(Self {
            db,
            leases: Arc::new(LeaseTable::default()),
        })
    }

    /// Remember `study_uid` for `ttl_minutes` unless it is already known.
    ///
    /// Returns whether an entry was created. A negative TTL never caches, and
    /// neither do keys that cannot name a study directory.
    pub fn record_if_absent(&self, study_uid: &str, ttl_minutes: i64) -> Result<bool, CacheError> {
        self.record_if_absent_at(study_uid, ttl_minutes, Utc::now())
    }

    pub fn record_if_absent_at(
        &self,
        study_uid: &str,
        ttl_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        if ttl_minutes < 0 {
            return Ok(false);
        }
        if let Err(e) = validate_component(study_uid) {
            tracing::warn!("Refusing to cache study: {}", e);
            return Ok(false);
        }

        let expires_at = Duration::try_minutes(ttl_minutes)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| CacheError::ExpiryOutOfRange {
                study_uid: study_uid.to_string(),
                ttl_minutes,
            })?;
        let write_txn = self.db.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(STUDY_EXPIRY)?;
            let exists = table.get(study_uid)?.is_some();
            if !exists {
                table.insert(study_uid, expires_at.timestamp_millis())?;
            }
            !exists
        };
        write_txn.commit()?;

        if created {
            tracing::debug!("📇 Cached study {} until {}", study_uid, expires_at);
        }
        Ok(created)
    }

    /// Expiry recorded for a study
    pub fn expires_at(&self, study_uid: &str) -> Result<Option<DateTime<Utc>>, CacheError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STUDY_EXPIRY)?;
        let expiry = table.get(study_uid)?.map(|v| v.value());
        Ok(expiry.and_then(from_millis))
    }

    /// Every known entry, ordered by study uid
    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STUDY_EXPIRY)?;

        let mut entries = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            if let Some(expires_at) = from_millis(value.value()) {
                entries.push(CacheEntry {
                    study_uid: key.value().to_string(),
                    expires_at,
                });
            }
        }
        Ok(entries)
    }

    /// Hold `study_uid` on disk until the returned lease is dropped.
    pub async fn lease(&self, study_uid: &str) -> StudyLease {
        self.leases.acquire(study_uid).await
    }

    /// Delete every expired study below `storage_root` except `protected`.
    pub async fn sweep(&self, storage_root: &Path, protected: Option<&str>) -> SweepReport {
        self.sweep_at(storage_root, protected, Utc::now()).await
    }

    pub async fn sweep_at(
        &self,
        storage_root: &Path,
        protected: Option<&str>,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        let expired = match self.expired(now) {
            Ok(expired) => expired,
            Err(e) => {
                tracing::error!("Cache sweep could not list entries: {}", e);
                return report;
            }
        };

        for study_uid in expired {
            let claim = match protected {
                Some(protected) if protected == study_uid => None,
                _ => self.leases.begin_eviction(&study_uid),
            };
            let Some(_claim) = claim else {
                report.skipped.push(study_uid);
                continue;
            };

            if self.evict(storage_root, &study_uid).await {
                report.evicted.push(study_uid);
            } else {
                report.failed.push(study_uid);
            }
        }

        if !report.evicted.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                "🧹 Cache sweep evicted {} studies ({} failed, {} skipped)",
                report.evicted.len(),
                report.failed.len(),
                report.skipped.len()
            );
        }
        report
    }

    async fn evict(&self, storage_root: &Path, study_uid: &str) -> bool {
        if let Err(e) = validate_component(study_uid) {
            tracing::warn!("Dropping cache entry with unusable key: {}", e);
            return self.remove_entry(study_uid);
        }

        let directory = storage_root.join(study_uid);
        tracing::info!("cleaning directory: {}", directory.display());
        match tokio::fs::remove_dir_all(&directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} already gone", directory.display());
            }
            Err(e) => {
                tracing::warn!("Failed to delete {}: {}", directory.display(), e);
                return false;
            }
        }
        self.remove_entry(study_uid)
    }

    fn remove_entry(&self, study_uid: &str) -> bool {
        let result = (|| -> Result<(), CacheError> {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(STUDY_EXPIRY)?;
                table.remove(study_uid)?;
            }
            write_txn.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to drop cache entry {}: {}", study_uid, e);
                false
            }
        }
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, CacheError> {
        let cutoff = now.timestamp_millis();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STUDY_EXPIRY)?;

        let mut expired = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            if value.value() <= cutoff {
                expired.push(key.value().to_string());
            }
        }
        Ok(expired)
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

use dimse::QueryLevel;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted cache lifetime, one hundred years
pub const MAX_KEEP_CACHE_MINUTES: i64 = 100 * 365 * 24 * 60;

/// Local storage, cache lifetime and fetch admission settings
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Minutes a study stays cached after its first fetch; negative disables caching
    #[serde(default = "default_keep_cache_minutes")]
    pub keep_cache_minutes: i64,
    /// Upper bound on simultaneous outbound fetches
    #[serde(default = "default_max_associations")]
    pub max_associations: usize,
    /// Level at which instance requests are fetched and deduplicated
    #[serde(default = "default_fetch_level")]
    pub fetch_level: QueryLevel,
    /// Run an additional background sweep at this interval
    pub sweep_interval_secs: Option<u64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            keep_cache_minutes: default_keep_cache_minutes(),
            max_associations: default_max_associations(),
            fetch_level: default_fetch_level(),
            sweep_interval_secs: None,
        }
    }
}

impl RetrievalConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }

    /// Location of the durable cache database
    pub fn cache_db_path(&self) -> PathBuf {
        self.storage_path.join(crate::storage::PERSIST_DIR).join("cache.redb")
    }
}

/// QIDO query shaping
#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueryConfig {
    /// Minimum PatientName length before a query is forwarded
    #[serde(default)]
    pub min_chars: usize,
    /// Append `*` to PatientName values
    #[serde(default)]
    pub append_wildcard: bool,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_keep_cache_minutes() -> i64 {
    60
}

fn default_max_associations() -> usize {
    4
}

fn default_fetch_level() -> QueryLevel {
    QueryLevel::Study
}

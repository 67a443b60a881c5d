use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use dimse::types::tags;
use dimse::{
    DimseConfig, DimseNetwork, DimseOperation, DimseRequest, QueryLevel, RemoteNode, RetrieveMode,
};
use futures_util::future::{FutureExt, Shared};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{ConcurrencyLimiter, FetchError, FetchOutcome, ResourceKey};
use crate::config::RetrievalConfig;
use crate::storage::RetrievalCache;

type FetchResult = Result<FetchOutcome, FetchError>;
type FetchChannel = Shared<oneshot::Receiver<FetchResult>>;

/// Everything needed to build a retrieve request
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub source: RemoteNode,
    pub target: RemoteNode,
    pub retrieve_mode: RetrieveMode,
    pub transfer_syntax: String,
    pub storage_root: PathBuf,
    pub keep_cache_minutes: i64,
    pub verbose: bool,
}

impl FetchSettings {
    pub fn from_config(dimse: &DimseConfig, retrieval: &RetrievalConfig) -> Self {
        Self {
            source: dimse.source.clone(),
            target: dimse.target.clone(),
            retrieve_mode: dimse.retrieve_mode,
            transfer_syntax: dimse.transfer_syntax.clone(),
            storage_root: retrieval.storage_path.clone(),
            keep_cache_minutes: retrieval.keep_cache_minutes,
            verbose: dimse.verbose,
        }
    }

    fn retrieve_request(&self, key: &ResourceKey, level: QueryLevel) -> DimseRequest {
        let operation = match self.retrieve_mode {
            RetrieveMode::Get => DimseOperation::Get,
            RetrieveMode::Move => DimseOperation::Move,
        };

        let mut request = DimseRequest::new(operation, self.source.clone(), self.target.clone())
            .with_tag(tags::QUERY_RETRIEVE_LEVEL, level.as_str())
            .with_tag(tags::STUDY_INSTANCE_UID, key.study_uid.as_str());
        if level >= QueryLevel::Series {
            request = request.with_tag(tags::SERIES_INSTANCE_UID, key.series_uid.as_str());
        }
        if level == QueryLevel::Image {
            request = request.with_tag(tags::SOP_INSTANCE_UID, key.instance_uid.as_str());
        }

        request
            .with_transfer_syntax(self.transfer_syntax.as_str())
            .with_storage_path(self.storage_root.clone())
            .verbose(self.verbose)
    }
}

/// Runs the wrapped closure when dropped
struct CallOnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

struct Inner {
    network: Arc<dyn DimseNetwork>,
    cache: Arc<RetrievalCache>,
    limiter: ConcurrencyLimiter,
    settings: FetchSettings,
    in_flight: Mutex<HashMap<String, FetchChannel>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, FetchChannel>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns the set of in-flight fetches.
///
/// Cloning is cheap and every clone shares the same set.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("in_flight", &self.in_flight_count())
            .field("limiter", &self.inner.limiter)
            .finish()
    }
}

impl FetchCoordinator {
    pub fn new(
        network: Arc<dyn DimseNetwork>,
        cache: Arc<RetrievalCache>,
        limiter: ConcurrencyLimiter,
        settings: FetchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                network,
                cache,
                limiter,
                settings,
                in_flight: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Retrieve `key` at `level`, or wait on the fetch already running for the same lock key.
    ///
    /// The fetch runs on its own task, so a caller that stops waiting does not
    /// cancel it for anyone else.
    #[tracing::instrument(skip(self), fields(lock_key = %key.lock_key(level)))]
    pub async fn fetch_or_join(&self, key: &ResourceKey, level: QueryLevel) -> FetchResult {
        if self.inner.shutdown.is_cancelled() {
            return Err(FetchError::Shutdown);
        }

        let lock_key = key.lock_key(level).to_string();
        let channel = {
            let mut in_flight = self.inner.in_flight();
            if let Some(channel) = in_flight.get(&lock_key) {
                tracing::debug!("Joining in-flight fetch for {}", lock_key);
                channel.clone()
            } else {
                let channel = self.spawn_fetch(lock_key.clone(), key.clone(), level);
                in_flight.insert(lock_key, channel.clone());
                channel
            }
        };

        channel.await.unwrap_or(Err(FetchError::Abandoned))
    }

    /// Must be called with the in-flight lock held so the entry is inserted
    /// before the task can remove it.
    fn spawn_fetch(&self, lock_key: String, key: ResourceKey, level: QueryLevel) -> FetchChannel {
        let (sender, receiver) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        let remove_token = CallOnDrop(Some(move || {
            inner.in_flight().remove(&lock_key);
        }));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = inner.shutdown.cancelled() => Err(FetchError::Shutdown),
                result = inner.limiter.admit(|| run_fetch(&inner, &key, level)) => result,
            };
            // Evict from the map first: callers either get a channel that will
            // receive data, or they start a new fetch.
            drop(remove_token);
            sender.send(result).ok();
        });

        receiver.shared()
    }

    /// Number of distinct lock keys currently being fetched
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Abandon in-flight fetches and refuse new ones. Abandoned fetches are never recorded.
    pub fn shutdown(&self) {
        tracing::info!(
            "Shutting down fetch coordinator ({} in flight)",
            self.in_flight_count()
        );
        self.inner.shutdown.cancel();
        self.inner.limiter.close();
    }
}

async fn run_fetch(inner: &Inner, key: &ResourceKey, level: QueryLevel) -> FetchResult {
    let settings = &inner.settings;
    let study_uid = key.study_uid.as_str();

    let _lease = inner.cache.lease(study_uid).await;
    inner
        .cache
        .sweep(&settings.storage_root, Some(study_uid))
        .await;

    let request = settings.retrieve_request(key, level);
    tracing::info!(
        "📥 Fetching {} {} from {}",
        level,
        key.lock_key(level),
        settings.target.ae_title
    );

    let result = match inner.network.execute(request).await {
        Ok(result) => result,
        Err(e) => {
            match e.raw_payload() {
                Some(raw) => tracing::error!(
                    "Retrieval of {} returned an unparseable result: {}",
                    key.lock_key(level),
                    raw
                ),
                None => tracing::warn!("Retrieval of {} failed: {}", key.lock_key(level), e),
            }
            return Err(e.into());
        }
    };

    if !result.code.is_usable() {
        let message = result.message.unwrap_or_default();
        tracing::warn!(
            "Retrieval of {} rejected with code {}: {}",
            key.lock_key(level),
            result.code,
            message
        );
        return Err(FetchError::Rejected {
            code: result.code.as_i64(),
            message,
        });
    }

    let recorded = match inner
        .cache
        .record_if_absent(study_uid, settings.keep_cache_minutes)
    {
        Ok(recorded) => recorded,
        Err(e) => {
            tracing::warn!("Fetched {} but could not record it: {}", study_uid, e);
            false
        }
    };

    tracing::info!(
        "✅ Fetched {} {} (code {})",
        level,
        key.lock_key(level),
        result.code
    );
    Ok(FetchOutcome {
        code: result.code,
        recorded,
    })
}

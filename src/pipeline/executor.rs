use std::path::{Path, PathBuf};
use std::sync::Arc;

use dimse::{DimseNetwork, DimseOperation, DimseRequest, QueryLevel, RemoteNode, ResultCode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::config::Config;
use crate::fetch::{FetchCoordinator, FetchError, ResourceKey};
use crate::storage::{validate_component, RetrievalCache, StorageBackend, StorageError};

/// Identity of a single instance as sent by WADO-URI clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InstanceRequest {
    #[serde(rename = "studyUID")]
    pub study_uid: Option<String>,
    #[serde(rename = "seriesUID")]
    pub series_uid: Option<String>,
    #[serde(rename = "objectUID")]
    pub object_uid: Option<String>,
}

impl InstanceRequest {
    pub fn new(
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        object_uid: impl Into<String>,
    ) -> Self {
        Self {
            study_uid: Some(study_uid.into()),
            series_uid: Some(series_uid.into()),
            object_uid: Some(object_uid.into()),
        }
    }

    /// Check every identifier is present and usable as a path component
    pub fn resource_key(&self) -> Result<ResourceKey, RetrieveError> {
        let study_uid = required("studyUID", &self.study_uid)?;
        let series_uid = required("seriesUID", &self.series_uid)?;
        let object_uid = required("objectUID", &self.object_uid)?;

        for (name, value) in [("studyUID", study_uid), ("objectUID", object_uid)] {
            validate_component(value).map_err(|e| RetrieveError::InvalidParameter {
                name,
                reason: e.to_string(),
            })?;
        }

        Ok(ResourceKey::new(study_uid, series_uid, object_uid))
    }
}

fn required<'a>(name: &'static str, value: &'a Option<String>) -> Result<&'a str, RetrieveError> {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(RetrieveError::MissingParameter(name)),
    }
}

/// Ways serving an instance can fail
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("fetch failed: {0}")]
    FetchFailed(#[source] FetchError),

    #[error("{} is not present after a successful fetch", .path.display())]
    NotFoundAfterFetch { path: PathBuf },

    #[error("transcode failed: {0}")]
    TranscodeFailure(String),

    #[error("failed to read {}: {source}", .path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: StorageError,
    },
}

/// Settings the pipeline needs beyond its collaborators
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub fetch_level: QueryLevel,
    pub source: RemoteNode,
    pub target: RemoteNode,
    pub transfer_syntax: String,
    pub verbose: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch_level: config.retrieval.fetch_level,
            source: config.dimse.source.clone(),
            target: config.dimse.target.clone(),
            transfer_syntax: config.dimse.transfer_syntax.clone(),
            verbose: config.dimse.verbose,
        }
    }
}

/// Serves single instances from local storage, fetching whole studies (or
/// series, or images) from the archive on a miss.
#[derive(Clone)]
pub struct RetrievalPipeline {
    storage: Arc<dyn StorageBackend>,
    cache: Arc<RetrievalCache>,
    coordinator: FetchCoordinator,
    network: Arc<dyn DimseNetwork>,
    settings: PipelineSettings,
}

impl RetrievalPipeline {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        cache: Arc<RetrievalCache>,
        coordinator: FetchCoordinator,
        network: Arc<dyn DimseNetwork>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            storage,
            cache,
            coordinator,
            network,
            settings,
        }
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub fn cache(&self) -> &Arc<RetrievalCache> {
        &self.cache
    }

    /// Return the bytes of one instance, transcoded to the configured transfer syntax.
    ///
    /// The study stays leased until the bytes are read, so no sweep can delete
    /// it underneath us.
    #[tracing::instrument(
        skip(self, request),
        fields(study = ?request.study_uid, object = ?request.object_uid)
    )]
    pub async fn serve(&self, request: &InstanceRequest) -> Result<Vec<u8>, RetrieveError> {
        let key = request.resource_key()?;
        let _lease = self.cache.lease(&key.study_uid).await;

        let path = self
            .storage
            .instance_path(&key.study_uid, &key.instance_uid);

        if self.storage.exists(&path).await {
            tracing::debug!("Serving {} from local storage", path.display());
        } else {
            self.coordinator
                .fetch_or_join(&key, self.settings.fetch_level)
                .await
                .map_err(RetrieveError::FetchFailed)?;

            if !self.storage.exists(&path).await {
                tracing::error!(
                    "Fetch of {} reported success but {} does not exist",
                    key.lock_key(self.settings.fetch_level),
                    path.display()
                );
                return Err(RetrieveError::NotFoundAfterFetch { path });
            }
        }

        self.recompress(&key.study_uid, &path).await?;

        self.storage
            .read(&path)
            .await
            .map_err(|source| RetrieveError::ReadFailure { path, source })
    }

    async fn recompress(&self, study_uid: &str, path: &Path) -> Result<(), RetrieveError> {
        let request = DimseRequest::new(
            DimseOperation::Recompress,
            self.settings.source.clone(),
            self.settings.target.clone(),
        )
        .with_source_path(path)
        .with_storage_path(self.storage.study_path(study_uid))
        .with_transfer_syntax(self.settings.transfer_syntax.as_str())
        .verbose(self.settings.verbose);

        match self.network.execute(request).await {
            Ok(result) if result.code == ResultCode::Success => Ok(()),
            Ok(result) => Err(RetrieveError::TranscodeFailure(format!(
                "code {}: {}",
                result.code,
                result.message.unwrap_or_default()
            ))),
            Err(e) => Err(RetrieveError::TranscodeFailure(e.to_string())),
        }
    }
}

pub mod adapters;
pub mod config;
pub mod fetch;
pub mod pipeline;
pub mod query;
pub mod storage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dimse::{DimseNetwork, DimseOperation, DimseRequest, DimseScu, RetrieveMode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::adapters::http::{AppState, HttpAdapter};
use crate::config::Config;
use crate::fetch::{ConcurrencyLimiter, FetchCoordinator, FetchSettings};
use crate::pipeline::{PipelineSettings, RetrievalPipeline};
use crate::query::QueryService;
use crate::storage::{FilesystemStorage, RetrievalCache};

/// How long the store listener gets to exit after its shutdown request
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config)?;

    tracing::info!("🔧 Starting PACS proxy '{}'", config.proxy.id);

    let storage_root = config.retrieval.storage_path.clone();
    let storage = Arc::new(FilesystemStorage::new(&storage_root)?);
    let cache = Arc::new(
        RetrievalCache::open(&config.retrieval.cache_db_path())
            .context("failed to open retrieval cache")?,
    );
    let network: Arc<dyn DimseNetwork> = Arc::new(DimseScu::new(config.dimse.clone()));

    let coordinator = FetchCoordinator::new(
        Arc::clone(&network),
        Arc::clone(&cache),
        ConcurrencyLimiter::new(config.retrieval.max_associations),
        FetchSettings::from_config(&config.dimse, &config.retrieval),
    );
    let pipeline = RetrievalPipeline::new(
        storage,
        Arc::clone(&cache),
        coordinator.clone(),
        Arc::clone(&network),
        PipelineSettings::from_config(&config),
    );
    let query = QueryService::new(
        Arc::clone(&network),
        config.dimse.source.clone(),
        config.dimse.target.clone(),
        config.dimse.verbose,
        config.query.clone(),
    );

    let shutdown = CancellationToken::new();
    let listener = start_listener(&config, &network);
    let sweeper = config.retrieval.sweep_interval().map(|interval| {
        spawn_sweeper(
            Arc::clone(&cache),
            storage_root.clone(),
            interval,
            shutdown.clone(),
        )
    });

    let bind_addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.bind_address()))?;
    let adapter = HttpAdapter::new(bind_addr);
    tracing::info!("Starting {}", adapter.summary());
    let state = AppState {
        pipeline,
        query,
        network: Arc::clone(&network),
        source: config.dimse.source.clone(),
        target: config.dimse.target.clone(),
    };
    let server = adapter.start(state, shutdown.clone()).await?;

    shutdown_signal().await;
    tracing::info!("🛑 Shutdown requested");

    shutdown.cancel();
    coordinator.shutdown();
    if let Err(e) = server.await {
        tracing::error!("HTTP server task failed: {}", e);
    }
    if let Some(sweeper) = sweeper {
        sweeper.await.ok();
    }
    if let Some(listener) = listener {
        stop_listener(&config, &network, listener).await;
    }

    tracing::info!("PACS proxy '{}' stopped", config.proxy.id);
    Ok(())
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.proxy.log_level))
        .context("invalid log level")?;

    let file_layer = if config.logging.log_to_file {
        let path = &config.logging.log_file_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Some(
            fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_file(true).with_line_number(true))
        .with(file_layer)
        .try_init()
        .context("failed to initialize logging")?;
    Ok(())
}

/// Spawn the C-MOVE store listener when configured
fn start_listener(config: &Config, network: &Arc<dyn DimseNetwork>) -> Option<JoinHandle<()>> {
    if !config.dimse.start_listener {
        return None;
    }
    if config.dimse.retrieve_mode != RetrieveMode::Move {
        tracing::warn!("dimse.start_listener is only used with retrieve_mode = \"move\"; ignoring");
        return None;
    }

    let request = DimseRequest::new(
        DimseOperation::StartListener,
        config.dimse.source.clone(),
        config.dimse.target.clone(),
    )
    .with_storage_path(config.retrieval.storage_path.clone())
    .with_transfer_syntax(config.dimse.transfer_syntax.as_str())
    .verbose(config.dimse.verbose);

    let network = Arc::clone(network);
    Some(tokio::spawn(async move {
        match network.execute(request).await {
            Ok(result) if result.code.is_usable() => tracing::info!("Store listener exited"),
            Ok(result) => tracing::error!(
                "Store listener exited with code {}: {}",
                result.code,
                result.message.unwrap_or_default()
            ),
            Err(e) => tracing::error!("Store listener failed: {}", e),
        }
    }))
}

async fn stop_listener(config: &Config, network: &Arc<dyn DimseNetwork>, listener: JoinHandle<()>) {
    let local = config.dimse.source.clone();
    let request = DimseRequest::new(DimseOperation::Shutdown, local.clone(), local)
        .verbose(config.dimse.verbose);
    if let Err(e) = network.execute(request).await {
        tracing::warn!("Failed to send shutdown to store listener: {}", e);
    }

    if tokio::time::timeout(LISTENER_STOP_TIMEOUT, listener)
        .await
        .is_err()
    {
        tracing::warn!("Store listener did not stop within {:?}", LISTENER_STOP_TIMEOUT);
    }
}

fn spawn_sweeper(
    cache: Arc<RetrievalCache>,
    storage_root: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = cache.sweep(&storage_root, None).await;
                    tracing::debug!("Periodic sweep: {:?}", report);
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

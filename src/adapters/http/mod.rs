use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod router;
pub mod status_mapper;

pub use router::{build_router, AppState};

/// HTTP front of the gateway
pub struct HttpAdapter {
    pub bind_addr: SocketAddr,
}

impl HttpAdapter {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn start(
        &self,
        state: AppState,
        shutdown: CancellationToken,
    ) -> anyhow::Result<JoinHandle<()>> {
        let bind_addr = self.bind_addr;
        let app = build_router(state);
        let listener = TcpListener::bind(bind_addr).await?;

        Ok(tokio::spawn(async move {
            tracing::info!("🚀 HTTP server listening on {}", bind_addr);

            let graceful_shutdown = async move {
                shutdown.cancelled().await;
            };

            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful_shutdown)
                .await
            {
                tracing::error!("HTTP server on {} encountered error: {}", bind_addr, e);
            }

            tracing::info!("HTTP server on {} shut down", bind_addr);
        }))
    }

    pub fn summary(&self) -> String {
        format!("HttpAdapter(bind={})", self.bind_addr)
    }
}

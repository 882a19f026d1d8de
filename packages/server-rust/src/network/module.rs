//! Network module with deferred startup lifecycle.
//!
//! `new()` assembles shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until shutdown. The split lets the binary
//! learn the bound address before traffic flows.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{
    health_handler, liveness_handler, readiness_handler, rpc_handler, AppState, RpcPipeline,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::settings::Reloader;

/// Manages the HTTP server lifecycle.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        shutdown: Arc<ShutdownController>,
        reloader: Arc<Reloader>,
        pipeline: RpcPipeline,
    ) -> Self {
        Self {
            config,
            listener: None,
            state: AppState {
                shutdown,
                reloader,
                pipeline,
                start_time: Instant::now(),
            },
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `POST /rpc/{*method}` -- JSON call into the call pipeline
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/rpc/{*method}", post(rpc_handler))
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the TCP listener to the configured address.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "TCP listener bound");

        self.listener = Some(listener);
        Ok(addr)
    }

    /// Serves connections until `shutdown` resolves, then stops accepting
    /// and waits for open connections to finish.
    ///
    /// Draining in-flight calls and forced termination are driven by the
    /// shutdown controller, not here.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, or on a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();

        self.state.shutdown.set_ready();
        info!("Serving HTTP calls");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped accepting connections");
        Ok(())
    }
}

//! `keel-server` binary.
//!
//! ```text
//! flags -> logging -> reloader (Consul) -> first settings
//!       -> metrics exporter -> call pipeline -> HTTP listener
//!       -> signal: drain within grace | second signal: abort
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use keel_server::network::{
    handle_termination, shutdown_requested, DrainOutcome, NetworkConfig, NetworkModule, OsSignals,
    ShutdownController,
};
use keel_server::observability::{init_logging, parse_level};
use keel_server::service::{build_call_pipeline, CallError, EnrichedCall, MethodRouter, ServerConfig};
use keel_server::settings::{ConsulStore, Reloader};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

async fn version(call: EnrichedCall<Value>) -> Result<Value, CallError> {
    let ctx = call.context();
    Ok(json!({
        "version": ctx.version(),
        "request_id": ctx.request_id().as_str(),
    }))
}

async fn echo(call: EnrichedCall<Value>) -> Result<Value, CallError> {
    Ok(call.into_body())
}

fn router() -> MethodRouter<Value, Value> {
    MethodRouter::new()
        .route("/keel.v1.Meta/Version", version)
        .route("/keel.v1.Meta/Echo", echo)
}

fn install_metrics(address: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = address
        .parse()
        .with_context(|| format!("invalid metrics listen address {address:?}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_logging(parse_level(&config.loglevel), config.log_format)?;
    info!(
        version = VERSION,
        consul = %config.consul_address,
        key = %config.consul_config_key,
        "Starting keel-server"
    );

    let store = Arc::new(ConsulStore::new(&config.consul_address)?);
    let (stop_reloader, stop_rx) = watch::channel(false);
    let (reloader, reloader_task) =
        Reloader::start(store, config.reloader_config(), stop_rx).await?;
    let settings = reloader.settings().await;

    if !settings.prometheus.metrics_listen_address.is_empty() {
        install_metrics(&settings.prometheus.metrics_listen_address)?;
    }

    let shutdown = Arc::new(ShutdownController::new());
    let pipeline = build_call_pipeline(
        router(),
        Arc::clone(&reloader),
        Arc::clone(&shutdown),
        VERSION,
    );
    let mut module = NetworkModule::new(
        NetworkConfig::from_settings(&settings),
        Arc::clone(&shutdown),
        Arc::clone(&reloader),
        pipeline,
    );
    let addr = module.start().await?;
    info!(%addr, "Listening for calls");

    tokio::spawn(handle_termination(Arc::clone(&shutdown), OsSignals::new()?));
    let mut server = tokio::spawn(module.serve(shutdown_requested(Arc::clone(&shutdown))));

    tokio::select! {
        () = shutdown_requested(Arc::clone(&shutdown)) => {}
        result = &mut server => {
            stop_reloader.send_replace(true);
            result.context("server task failed")??;
            warn!("Server stopped without a termination signal.");
            return Ok(());
        }
    }

    let grace = config.grace_period();
    let outcome = shutdown.drain(grace).await;
    stop_reloader.send_replace(true);

    match outcome {
        DrainOutcome::Drained => {
            info!("All in-flight calls drained.");
            match tokio::time::timeout(grace, server).await {
                Ok(joined) => joined.context("server task failed")??,
                Err(_) => warn!("HTTP connections still open after drain, exiting anyway."),
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), reloader_task).await;
            info!("Shutdown complete.");
            Ok(())
        }
        DrainOutcome::GraceExpired => {
            error!(
                in_flight = shutdown.in_flight_count(),
                grace_ms = config.grace_period_ms,
                "Grace period expired with calls in flight, terminating."
            );
            std::process::exit(1);
        }
        DrainOutcome::Forced => {
            error!(
                in_flight = shutdown.in_flight_count(),
                "Forced shutdown, abandoning in-flight calls."
            );
            std::process::exit(1);
        }
    }
}

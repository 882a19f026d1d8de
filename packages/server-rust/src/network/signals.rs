//! Termination signal handling.
//!
//! The first SIGINT/SIGTERM starts a graceful drain; a second one forces
//! immediate termination.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::shutdown::ShutdownController;

/// Source of termination signals, named by the signal received.
#[async_trait]
pub trait SignalSource: Send {
    /// Waits for the next signal. `None` once no more can arrive.
    async fn recv(&mut self) -> Option<&'static str>;
}

/// Process signals: SIGTERM and SIGINT on unix, Ctrl-C elsewhere.
pub struct OsSignals {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
}

impl OsSignals {
    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be registered.
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// Never fails on this platform.
    #[cfg(not(unix))]
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }
}

#[async_trait]
impl SignalSource for OsSignals {
    #[cfg(unix)]
    async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            received = self.term.recv() => received.map(|()| "SIGTERM"),
            received = self.interrupt.recv() => received.map(|()| "SIGINT"),
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|()| "ctrl-c")
    }
}

#[async_trait]
impl SignalSource for tokio::sync::mpsc::Receiver<&'static str> {
    async fn recv(&mut self) -> Option<&'static str> {
        tokio::sync::mpsc::Receiver::recv(self).await
    }
}

/// Drives `shutdown` from `signals`: first signal drains, second forces.
pub async fn handle_termination<S: SignalSource>(shutdown: Arc<ShutdownController>, mut signals: S) {
    let Some(first) = signals.recv().await else {
        return;
    };
    info!(
        signal = first,
        in_flight = shutdown.in_flight_count(),
        "Received termination signal, draining in-flight calls."
    );
    shutdown.trigger_shutdown();

    if let Some(second) = signals.recv().await {
        warn!(signal = second, "Received second signal, forcing shutdown.");
        shutdown.force_shutdown();
    }
}

/// Resolves once shutdown has been triggered.
pub async fn shutdown_requested(shutdown: Arc<ShutdownController>) {
    let mut rx = shutdown.shutdown_receiver();
    let _ = rx.wait_for(|triggered| *triggered).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_core::{Code, Settings};
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tower::ServiceExt;

    use super::*;
    use crate::network::DrainOutcome;
    use crate::service::call::{CallError, EnrichedCall, InboundCall};
    use crate::service::middleware::{build_call_pipeline, CallPipeline};
    use crate::service::router::MethodRouter;
    use crate::settings::Reloader;

    async fn sleepy(call: EnrichedCall<u64>) -> Result<u64, CallError> {
        tokio::time::sleep(Duration::from_secs(call.body)).await;
        Ok(call.body)
    }

    fn setup() -> (
        CallPipeline<u64, u64>,
        Arc<ShutdownController>,
        mpsc::Sender<&'static str>,
    ) {
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let pipeline = build_call_pipeline(
            MethodRouter::new().route("/work.v1.Work/Sleep", sleepy),
            Reloader::preloaded(Settings::default()),
            Arc::clone(&shutdown),
            "test",
        );
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(handle_termination(Arc::clone(&shutdown), rx));
        (pipeline, shutdown, tx)
    }

    fn sleep_call(secs: u64) -> InboundCall<u64> {
        InboundCall::unary("/work.v1.Work/Sleep", secs)
    }

    #[tokio::test(start_paused = true)]
    async fn first_signal_drains_in_flight_and_rejects_new_calls() {
        let (pipeline, shutdown, signals) = setup();

        let in_flight = tokio::spawn(pipeline.clone().oneshot(sleep_call(1)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(shutdown.in_flight_count(), 1);

        signals.send("SIGTERM").await.unwrap();
        shutdown_requested(Arc::clone(&shutdown)).await;

        let rejected = pipeline.oneshot(sleep_call(0)).await.unwrap_err();
        assert_eq!(rejected.to_status().code(), Code::Unavailable);

        let started = Instant::now();
        let outcome = shutdown.drain(Duration::from_secs(3)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(in_flight.await.unwrap().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_signal_forces_immediately() {
        let (pipeline, shutdown, signals) = setup();
        let _in_flight = tokio::spawn(pipeline.oneshot(sleep_call(60)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        signals.send("SIGTERM").await.unwrap();
        shutdown_requested(Arc::clone(&shutdown)).await;
        let drain = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { shutdown.drain(Duration::from_secs(3)).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        signals.send("SIGINT").await.unwrap();

        assert_eq!(drain.await.unwrap(), DrainOutcome::Forced);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(shutdown.is_forced());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_abandons_slow_calls() {
        let (pipeline, shutdown, signals) = setup();
        let _in_flight = tokio::spawn(pipeline.oneshot(sleep_call(10)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        signals.send("SIGTERM").await.unwrap();
        shutdown_requested(Arc::clone(&shutdown)).await;

        let outcome = shutdown.drain(Duration::from_secs(3)).await;
        assert_eq!(outcome, DrainOutcome::GraceExpired);
        assert_eq!(shutdown.in_flight_count(), 1);
    }
}

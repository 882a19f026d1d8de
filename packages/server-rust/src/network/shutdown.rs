//! Two-phase shutdown controller with in-flight call tracking.
//!
//! Phase one (`trigger_shutdown`) stops admission and lets in-flight calls
//! drain. Phase two (`force_shutdown`, or an expired grace period) abandons
//! whatever is still running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Server health state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Waiting for the first settings snapshot.
    Starting,
    /// Serving calls.
    Ready,
    /// Rejecting new calls while in-flight ones finish.
    Draining,
    /// All in-flight calls completed.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }
}

/// How a drain finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight call completed within the grace period.
    Drained,
    /// The grace period elapsed with calls still running.
    GraceExpired,
    /// A forced shutdown was requested while draining.
    Forced,
}

/// Coordinates admission, draining and forced termination.
///
/// 1. Health probes read `health_state()`.
/// 2. The admission layer calls `try_admit()` for every call.
/// 3. `trigger_shutdown()` moves to Draining and signals all listeners.
/// 4. `drain()` waits for in-flight calls, a forced shutdown, or the grace
///    period, whichever comes first.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    forced_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    health_state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    /// Creates a new shutdown controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_signal, _) = watch::channel(false);
        let (forced_signal, _) = watch::channel(false);
        Self {
            shutdown_signal,
            forced_signal,
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    /// Transitions to `Ready`.
    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Receiver that turns `true` once shutdown starts.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Receiver that turns `true` once a forced shutdown is requested.
    #[must_use]
    pub fn forced_receiver(&self) -> watch::Receiver<bool> {
        self.forced_signal.subscribe()
    }

    /// Starts graceful shutdown: new calls are rejected from now on.
    pub fn trigger_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
        self.shutdown_signal.send_replace(true);
    }

    /// Requests immediate termination, abandoning in-flight calls.
    pub fn force_shutdown(&self) {
        self.trigger_shutdown();
        self.forced_signal.send_replace(true);
    }

    #[must_use]
    pub fn is_forced(&self) -> bool {
        *self.forced_signal.borrow()
    }

    /// Returns the current health state.
    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Whether new calls are admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        matches!(
            self.health_state(),
            HealthState::Starting | HealthState::Ready
        )
    }

    /// Returns a shared handle to the health state for use by handlers.
    #[must_use]
    pub fn health_state_handle(&self) -> Arc<ArcSwap<HealthState>> {
        Arc::clone(&self.health_state)
    }

    /// Creates an RAII guard that tracks an in-flight call.
    ///
    /// The counter is incremented on creation and decremented when the guard
    /// is dropped, even if the handler panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Admits a call unless shutdown has started.
    ///
    /// The state is re-checked after the counter is raised, so a drain that
    /// observed zero in-flight calls never races with a late admission.
    #[must_use]
    pub fn try_admit(&self) -> Option<InFlightGuard> {
        if !self.is_accepting() {
            return None;
        }
        let guard = self.in_flight_guard();
        if self.is_accepting() {
            Some(guard)
        } else {
            None
        }
    }

    /// Returns the current number of in-flight calls.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for all in-flight calls to complete, up to the given timeout.
    ///
    /// Returns `true` and transitions to `Stopped` if everything drained.
    /// Returns `false` if the timeout expired; the state stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drains in-flight calls within `grace`, cut short by a forced shutdown.
    pub async fn drain(&self, grace: Duration) -> DrainOutcome {
        let mut forced = self.forced_receiver();
        tokio::select! {
            biased;
            () = wait_until_set(&mut forced) => DrainOutcome::Forced,
            drained = self.wait_for_drain(grace) => {
                if drained {
                    DrainOutcome::Drained
                } else {
                    DrainOutcome::GraceExpired
                }
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_until_set(rx: &mut watch::Receiver<bool>) {
    // The sender outlives every drain, so an error cannot occur here.
    let _ = rx.wait_for(|set| *set).await;
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_state_transitions_starting_ready_draining() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);

        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);
        assert!(controller.is_accepting());

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(!controller.is_accepting());
    }

    #[test]
    fn in_flight_guard_increments_and_decrements() {
        let controller = ShutdownController::new();
        let guard1 = controller.in_flight_guard();
        let guard2 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(guard1);
        assert_eq!(controller.in_flight_count(), 1);
        drop(guard2);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn admission_closes_on_shutdown() {
        let controller = ShutdownController::new();
        controller.set_ready();

        let guard = controller.try_admit();
        assert!(guard.is_some());
        assert_eq!(controller.in_flight_count(), 1);

        controller.trigger_shutdown();
        assert!(controller.try_admit().is_none());
        assert_eq!(controller.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_receiver_notified() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_immediate_success() {
        let controller = ShutdownController::new();
        controller.set_ready();
        controller.trigger_shutdown();

        let outcome = controller.drain(Duration::from_secs(1)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_active_calls() {
        let controller = ShutdownController::new();
        controller.set_ready();

        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        let outcome = controller.drain(Duration::from_secs(2)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_grace_expires() {
        let controller = ShutdownController::new();
        controller.set_ready();

        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let outcome = controller.drain(Duration::from_millis(50)).await;
        assert_eq!(outcome, DrainOutcome::GraceExpired);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn force_cuts_drain_short() {
        let controller = Arc::new(ShutdownController::new());
        controller.set_ready();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let drain = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.drain(Duration::from_secs(3600)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.force_shutdown();

        assert_eq!(drain.await.unwrap(), DrainOutcome::Forced);
        assert!(controller.is_forced());
    }
}

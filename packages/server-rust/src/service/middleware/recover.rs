//! Recovery and completion logging middleware.
//!
//! Times every call and funnels it into exactly one completion record:
//!
//! | outcome         | level | returned to caller                  |
//! |-----------------|-------|-------------------------------------|
//! | `success`       | info  | the response                        |
//! | `known-error`   | warn  | the handler's `Status`, unchanged   |
//! | `unknown-error` | error | the handler's error, unchanged      |
//! | `panic`         | error | `internal: Internal server error.`  |
//! | `cancelled`     | warn  | nothing, the caller stopped waiting |
//!
//! Panics are caught both while the inner service builds its future and
//! while that future is polled. The panic payload is logged, never returned.
//! A call future dropped before it resolves (transport timeout, client
//! disconnect) writes its record from a drop guard.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use keel_core::Status;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{error, info, warn, Span};

use crate::service::call::{BoxCallFuture, CallError, EnrichedCall};

/// Message returned to callers whose handler panicked.
pub const PANIC_MESSAGE: &str = "Internal server error.";

/// Terminal state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    KnownError,
    UnknownError,
    Panic,
    Cancelled,
}

impl CallOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::KnownError => "known-error",
            CallOutcome::UnknownError => "unknown-error",
            CallOutcome::Panic => "panic",
            CallOutcome::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// RecoverLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RecoverLayer;

impl<S> Layer<S> for RecoverLayer {
    type Service = RecoverService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoverService { inner }
    }
}

// ---------------------------------------------------------------------------
// RecoverService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecoverService<S> {
    inner: S,
}

impl<S, B> Service<EnrichedCall<B>> for RecoverService<S>
where
    S: Service<EnrichedCall<B>, Error = CallError>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = CallError;
    type Future = BoxCallFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: EnrichedCall<B>) -> Self::Future {
        let mut pending = PendingCall {
            span: call.ctx.span().clone(),
            method: call.ctx.method().to_string(),
            started: Instant::now(),
            armed: true,
        };
        let inner = &mut self.inner;
        let fut = std::panic::catch_unwind(AssertUnwindSafe(move || inner.call(call)));

        Box::pin(async move {
            let result = match fut {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(payload) => Err(payload),
            };
            let elapsed = pending.started.elapsed();
            let duration_ms = millis(elapsed);
            let span = &pending.span;

            let (outcome, result) = match result {
                Ok(Ok(response)) => {
                    info!(parent: span, outcome = "success", duration_ms, "done");
                    (CallOutcome::Success, Ok(response))
                }
                Ok(Err(err)) if err.is_known() => {
                    let status = err.to_status();
                    warn!(
                        parent: span,
                        outcome = "known-error",
                        duration_ms,
                        code = %status.code(),
                        error = %err,
                        "done"
                    );
                    (CallOutcome::KnownError, Err(err))
                }
                Ok(Err(err)) => {
                    error!(
                        parent: span,
                        outcome = "unknown-error",
                        duration_ms,
                        error = %err,
                        "done"
                    );
                    (CallOutcome::UnknownError, Err(err))
                }
                Err(payload) => {
                    error!(
                        parent: span,
                        outcome = "panic",
                        duration_ms,
                        panic = %panic_message(payload.as_ref()),
                        "done"
                    );
                    (
                        CallOutcome::Panic,
                        Err(Status::internal(PANIC_MESSAGE).into()),
                    )
                }
            };

            pending.complete(outcome, elapsed);
            result
        })
    }
}

/// Completion bookkeeping for one call. Dropped while still armed, it
/// writes the `cancelled` record.
struct PendingCall {
    span: Span,
    method: String,
    started: Instant,
    armed: bool,
}

impl PendingCall {
    fn complete(&mut self, outcome: CallOutcome, elapsed: Duration) {
        self.armed = false;
        record_metrics(&self.method, outcome, elapsed);
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let elapsed = self.started.elapsed();
        warn!(
            parent: &self.span,
            outcome = "cancelled",
            duration_ms = millis(elapsed),
            "done"
        );
        self.complete(CallOutcome::Cancelled, elapsed);
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn record_metrics(method: &str, outcome: CallOutcome, elapsed: Duration) {
    metrics::counter!(
        "keel_calls_total",
        "method" => method.to_owned(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    metrics::histogram!("keel_call_duration_seconds", "method" => method.to_owned())
        .record(elapsed.as_secs_f64());
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

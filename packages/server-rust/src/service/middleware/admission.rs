//! Admission middleware: rejects calls once shutdown has started.
//!
//! Admitted calls hold an in-flight guard until their future completes or
//! is dropped, which is what the drain phase waits on.

use std::sync::Arc;
use std::task::{Context, Poll};

use keel_core::Status;
use tower::{Layer, Service};
use tracing::debug;

use crate::network::ShutdownController;
use crate::service::call::{BoxCallFuture, CallError, InboundCall};

// ---------------------------------------------------------------------------
// AdmissionLayer
// ---------------------------------------------------------------------------

/// Tower layer gating calls on the shutdown controller.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    shutdown: Arc<ShutdownController>,
}

impl AdmissionLayer {
    #[must_use]
    pub fn new(shutdown: Arc<ShutdownController>) -> Self {
        Self { shutdown }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

// ---------------------------------------------------------------------------
// AdmissionService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    shutdown: Arc<ShutdownController>,
}

impl<S, B> Service<InboundCall<B>> for AdmissionService<S>
where
    S: Service<InboundCall<B>, Error = CallError>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = CallError;
    type Future = BoxCallFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: InboundCall<B>) -> Self::Future {
        let Some(guard) = self.shutdown.try_admit() else {
            debug!(method = %call.method, "Rejecting call, server is shutting down.");
            metrics::counter!("keel_calls_rejected_total").increment(1);
            return Box::pin(async {
                Err(Status::unavailable("server is shutting down").into())
            });
        };

        let fut = self.inner.call(call);
        Box::pin(async move {
            let result = fut.await;
            drop(guard);
            result
        })
    }
}

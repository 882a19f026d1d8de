//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::access_log::{AccessLogLayer, AccessLogService};
use super::admission::{AdmissionLayer, AdmissionService};
use super::context::{ContextLayer, ContextService};
use super::recover::{RecoverLayer, RecoverService};
use crate::network::ShutdownController;
use crate::service::router::MethodRouter;
use crate::settings::Reloader;

/// Fully composed call pipeline over a [`MethodRouter`].
pub type CallPipeline<B, R> =
    AdmissionService<ContextService<RecoverService<AccessLogService<MethodRouter<B, R>>>>>;

/// Build the call pipeline by wrapping the `MethodRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `AdmissionLayer` -- reject once draining, track in-flight calls
/// 2. `ContextLayer` -- bind settings, request id, span and profiling labels
/// 3. `RecoverLayer` -- time, contain panics, one completion record per call
/// 4. `AccessLogLayer` -- request details right before dispatch
///
/// The returned service implements `tower::Service<InboundCall<B>>`.
#[must_use]
pub fn build_call_pipeline<B, R>(
    router: MethodRouter<B, R>,
    reloader: Arc<Reloader>,
    shutdown: Arc<ShutdownController>,
    version: impl Into<Arc<str>>,
) -> CallPipeline<B, R> {
    ServiceBuilder::new()
        .layer(AdmissionLayer::new(shutdown))
        .layer(ContextLayer::new(reloader, version))
        .layer(RecoverLayer)
        .layer(AccessLogLayer)
        .service(router)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

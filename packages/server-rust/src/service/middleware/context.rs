//! Context enrichment middleware.
//!
//! Runs once per call, or once per stream open for streaming calls. Binds
//! the current settings snapshot, resolves the request id, opens the call
//! span, attaches profiling labels and echoes identifiers into the trailers.
//! Metadata problems are logged and never fail the call.

use std::sync::Arc;
use std::task::{Context, Poll};

use keel_core::metadata::{BACKEND_VERSION, REQUEST_ID};
use keel_core::{CallContext, Metadata, MetadataError, RequestId};
use tower::{Layer, Service};
use tracing::{warn, Instrument};

use crate::service::call::{BoxCallFuture, CallError, EnrichedCall, InboundCall};
use crate::service::profiling;
use crate::settings::Reloader;

// ---------------------------------------------------------------------------
// ContextLayer
// ---------------------------------------------------------------------------

/// Tower layer turning [`InboundCall`]s into [`EnrichedCall`]s.
#[derive(Clone)]
pub struct ContextLayer {
    reloader: Arc<Reloader>,
    version: Arc<str>,
}

impl ContextLayer {
    #[must_use]
    pub fn new(reloader: Arc<Reloader>, version: impl Into<Arc<str>>) -> Self {
        Self {
            reloader,
            version: version.into(),
        }
    }
}

impl<S> Layer<S> for ContextLayer {
    type Service = ContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ContextService {
            inner,
            reloader: Arc::clone(&self.reloader),
            version: Arc::clone(&self.version),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ContextService<S> {
    inner: S,
    reloader: Arc<Reloader>,
    version: Arc<str>,
}

impl<S, B> Service<InboundCall<B>> for ContextService<S>
where
    S: Service<EnrichedCall<B>, Error = CallError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = CallError;
    type Future = BoxCallFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: InboundCall<B>) -> Self::Future {
        // Take the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let reloader = Arc::clone(&self.reloader);
        let version = Arc::clone(&self.version);

        Box::pin(async move {
            let InboundCall {
                method,
                kind,
                metadata,
                trailers,
                body,
            } = call;

            let settings = reloader.settings().await;
            let request_id = resolve_request_id(&method, &metadata);
            let ctx = CallContext::new(settings, request_id, method, version);
            let span = ctx.span().clone();
            let labels = ctx.labels().clone();

            let echoed = echo_metadata(&ctx).map_err(|err| err.to_string());
            if let Err(err) = echoed.and_then(|md| trailers.set(md).map_err(|e| e.to_string())) {
                warn!(parent: &span, error = %err, "Failed to send request-id trailer.");
            }

            let enriched = EnrichedCall { ctx, kind, body };
            profiling::with_labels(labels, async move { inner.call(enriched).await })
                .instrument(span)
                .await
        })
    }
}

/// Request id from metadata, or a fresh one if absent or unusable.
fn resolve_request_id(method: &str, metadata: &Metadata) -> RequestId {
    match RequestId::from_metadata(metadata) {
        Ok(Some(id)) => id,
        Ok(None) => RequestId::generate(),
        Err(err) => {
            let id = RequestId::generate();
            warn!(
                method,
                error = %err,
                request_id = %id,
                "Invalid request-id in metadata, generated a new one."
            );
            id
        }
    }
}

fn echo_metadata(ctx: &CallContext) -> Result<Metadata, MetadataError> {
    let mut md = Metadata::new();
    md.insert(REQUEST_ID, ctx.request_id().as_str())?;
    md.insert(BACKEND_VERSION, ctx.version())?;
    Ok(md)
}

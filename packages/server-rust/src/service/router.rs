//! Method routing: dispatches enriched calls to handlers by method name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use keel_core::Status;
use tower::Service;

use super::call::{BoxCallFuture, CallError, EnrichedCall};

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// A call handler for a single method.
///
/// Implemented for every `Fn(EnrichedCall<B>) -> impl Future<Output =
/// Result<R, CallError>>`, so plain async functions and closures register
/// directly.
pub trait Handler<B, R>: Send + Sync + 'static {
    fn call(&self, call: EnrichedCall<B>) -> BoxCallFuture<R>;
}

impl<B, R, F, Fut> Handler<B, R> for F
where
    F: Fn(EnrichedCall<B>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, CallError>> + Send + 'static,
{
    fn call(&self, call: EnrichedCall<B>) -> BoxCallFuture<R> {
        Box::pin(self(call))
    }
}

// ---------------------------------------------------------------------------
// MethodRouter
// ---------------------------------------------------------------------------

/// Routes calls to the handler registered for their fully-qualified method.
///
/// Calls to an unregistered method fail with `unimplemented`. The handler
/// table is shared, so clones are cheap.
pub struct MethodRouter<B, R> {
    handlers: Arc<HashMap<String, Arc<dyn Handler<B, R>>>>,
}

impl<B, R> MethodRouter<B, R> {
    /// Create a new empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(HashMap::new()),
        }
    }

    /// Register `handler` for `method`, replacing any previous handler.
    #[must_use]
    pub fn route(mut self, method: impl Into<String>, handler: impl Handler<B, R>) -> Self {
        let handler: Arc<dyn Handler<B, R>> = Arc::new(handler);
        Arc::make_mut(&mut self.handlers).insert(method.into(), handler);
        self
    }

    /// Registered method names, unordered.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl<B, R> Default for MethodRouter<B, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B, R> Clone for MethodRouter<B, R> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<B, R> std::fmt::Debug for MethodRouter<B, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRouter")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<B, R> Service<EnrichedCall<B>> for MethodRouter<B, R>
where
    B: Send + 'static,
    R: Send + 'static,
{
    type Response = R;
    type Error = CallError;
    type Future = BoxCallFuture<R>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: EnrichedCall<B>) -> Self::Future {
        match self.handlers.get(call.ctx.method()) {
            Some(handler) => handler.call(call),
            None => {
                let method = call.ctx.method().to_string();
                Box::pin(async move {
                    Err(Status::unimplemented(format!("unknown method {method}")).into())
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Call types flowing through the pipeline.
//!
//! A transport turns each inbound unit of work into an [`InboundCall`]. The
//! context layer converts it into an [`EnrichedCall`] carrying a typed
//! [`CallContext`], which is what handlers receive.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use keel_core::{CallContext, Metadata, Status};
use parking_lot::Mutex;

/// Boxed future returned by every pipeline service.
pub type BoxCallFuture<R> = Pin<Box<dyn Future<Output = Result<R, CallError>> + Send>>;

/// Shape of the call: one request/response, or one stream lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    Stream,
}

impl CallKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Unary => "unary",
            CallKind::Stream => "stream",
        }
    }
}

/// A call as handed over by the transport, before enrichment.
#[derive(Debug)]
pub struct InboundCall<B> {
    /// Fully-qualified method name, e.g. `/users.v1.Users/Get`.
    pub method: String,
    pub kind: CallKind,
    /// Inbound call metadata.
    pub metadata: Metadata,
    /// Trailing metadata sent back to the caller once the call ends.
    pub trailers: TrailerSink,
    /// Request message, or the server stream for streaming calls.
    pub body: B,
}

impl<B> InboundCall<B> {
    #[must_use]
    pub fn unary(method: impl Into<String>, body: B) -> Self {
        Self::new(method, CallKind::Unary, body)
    }

    #[must_use]
    pub fn stream(method: impl Into<String>, stream: B) -> Self {
        Self::new(method, CallKind::Stream, stream)
    }

    fn new(method: impl Into<String>, kind: CallKind, body: B) -> Self {
        Self {
            method: method.into(),
            kind,
            metadata: Metadata::new(),
            trailers: TrailerSink::new(),
            body,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A call after enrichment: what handlers receive.
///
/// For streaming calls the body is the inbound stream and the enriched call
/// itself implements [`Stream`], so handlers read messages and the enriched
/// context from the same object.
#[derive(Debug)]
pub struct EnrichedCall<B> {
    pub ctx: CallContext,
    pub kind: CallKind,
    pub body: B,
}

impl<B> EnrichedCall<B> {
    #[must_use]
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    #[must_use]
    pub fn into_body(self) -> B {
        self.body
    }
}

impl<S> Stream for EnrichedCall<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.body).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.body.size_hint()
    }
}

/// Errors returned by handlers and middleware.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// A structured, already-classified failure.
    #[error(transparent)]
    Status(#[from] Status),
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    /// Whether the error was classified by the handler.
    #[must_use]
    pub fn is_known(&self) -> bool {
        matches!(self, CallError::Status(_))
    }

    /// Status delivered to the caller. Unclassified errors surface as
    /// `unknown` with their message, unchanged in content.
    #[must_use]
    pub fn to_status(&self) -> Status {
        match self {
            CallError::Status(status) => status.clone(),
            CallError::Other(err) => Status::unknown(err.to_string()),
        }
    }
}

/// Errors from writing trailing metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrailerError {
    #[error("trailers were already sent")]
    AlreadySent,
}

#[derive(Debug, Default)]
struct TrailerState {
    metadata: Metadata,
    sealed: bool,
}

/// Shared slot for trailing metadata, written by middleware and handlers,
/// read once by the transport when the call ends.
#[derive(Debug, Clone, Default)]
pub struct TrailerSink {
    state: Arc<Mutex<TrailerState>>,
}

impl TrailerSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `metadata` into the trailers.
    ///
    /// # Errors
    ///
    /// Returns [`TrailerError::AlreadySent`] once the transport has sealed
    /// the trailers.
    pub fn set(&self, metadata: Metadata) -> Result<(), TrailerError> {
        let mut state = self.state.lock();
        if state.sealed {
            return Err(TrailerError::AlreadySent);
        }
        state.metadata.merge(metadata);
        Ok(())
    }

    /// Takes the trailers for sending. Later writes fail.
    #[must_use]
    pub fn seal(&self) -> Metadata {
        let mut state = self.state.lock();
        state.sealed = true;
        std::mem::take(&mut state.metadata)
    }

    #[must_use]
    pub fn snapshot(&self) -> Metadata {
        self.state.lock().metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use keel_core::{RequestId, Settings};

    use super::*;

    #[test]
    fn trailers_merge_until_sealed() {
        let sink = TrailerSink::new();
        sink.set(Metadata::from_pairs([("a", "1")])).unwrap();
        sink.clone().set(Metadata::from_pairs([("b", "2")])).unwrap();

        let sent = sink.seal();
        assert_eq!(sent.get("a"), Some("1"));
        assert_eq!(sent.get("b"), Some("2"));
        assert_eq!(
            sink.set(Metadata::from_pairs([("c", "3")])),
            Err(TrailerError::AlreadySent)
        );
    }

    #[test]
    fn call_error_classification() {
        let known = CallError::from(Status::not_found("missing"));
        assert!(known.is_known());
        assert_eq!(known.to_status(), Status::not_found("missing"));

        let unknown = CallError::from(anyhow::anyhow!("disk on fire"));
        assert!(!unknown.is_known());
        assert_eq!(unknown.to_status(), Status::unknown("disk on fire"));
    }

    #[tokio::test]
    async fn enriched_stream_delegates_to_inner_stream() {
        let ctx = CallContext::new(
            Arc::new(Settings::default()),
            RequestId::generate(),
            "/chat.v1.Chat/Follow",
            "dev",
        );
        let call = EnrichedCall {
            ctx,
            kind: CallKind::Stream,
            body: futures_util::stream::iter(vec![1, 2, 3]),
        };
        assert_eq!(call.context().method(), "/chat.v1.Chat/Follow");
        let items: Vec<i32> = call.collect().await;
        assert_eq!(items, vec![1, 2, 3]);
    }
}

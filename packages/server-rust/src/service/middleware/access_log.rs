//! Access-log middleware: one debug record per call, right before dispatch,
//! carrying the profiling labels active for the call.

use std::task::{Context, Poll};

use tower::{Layer, Service};
use tracing::debug;

use crate::service::call::{CallError, EnrichedCall};
use crate::service::profiling;

#[derive(Debug, Clone, Copy)]
pub struct AccessLogLayer;

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
}

impl<S, B> Service<EnrichedCall<B>> for AccessLogService<S>
where
    S: Service<EnrichedCall<B>, Error = CallError>,
{
    type Response = S::Response;
    type Error = CallError;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: EnrichedCall<B>) -> Self::Future {
        let labels = profiling::current()
            .map(|labels| {
                labels
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        debug!(
            parent: call.ctx.span(),
            kind = call.kind.as_str(),
            labels = %labels,
            "Request details"
        );
        self.inner.call(call)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_core::{CallContext, ProfilingLabels, RequestId, Settings};
    use tower::ServiceExt;
    use tracing::Level;

    use super::*;
    use crate::service::call::CallKind;
    use crate::service::router::MethodRouter;
    use crate::test_support::LogCapture;

    #[tokio::test]
    async fn logs_request_details_under_call_span() {
        let (logs, _guard) = LogCapture::install();
        let router = MethodRouter::new().route("/a.B/C", |_call: EnrichedCall<()>| async {
            Ok::<_, CallError>(())
        });
        let call = EnrichedCall {
            ctx: CallContext::new(
                Arc::new(Settings::default()),
                RequestId::parse("acc-1").unwrap(),
                "/a.B/C",
                "test",
            ),
            kind: CallKind::Stream,
            body: (),
        };

        AccessLogLayer.layer(router).oneshot(call).await.unwrap();

        let record = logs
            .find(|e| e.message == "Request details")
            .expect("access record");
        assert_eq!(record.level, Level::DEBUG);
        assert_eq!(record.field("kind"), Some("stream"));
        assert_eq!(record.span_field("request_id"), Some("acc-1"));
    }

    #[tokio::test]
    async fn records_active_profiling_labels() {
        let (logs, _guard) = LogCapture::install();
        let router = MethodRouter::new().route("/a.B/C", |_call: EnrichedCall<()>| async {
            Ok::<_, CallError>(())
        });
        let call = EnrichedCall {
            ctx: CallContext::new(
                Arc::new(Settings::default()),
                RequestId::parse("acc-2").unwrap(),
                "/a.B/C",
                "test",
            ),
            kind: CallKind::Unary,
            body: (),
        };
        let labels = ProfilingLabels::new().with("method", "/a.B/C");

        profiling::with_labels(labels, async {
            AccessLogLayer.layer(router).oneshot(call).await
        })
        .await
        .unwrap();

        let record = logs
            .find(|e| e.message == "Request details")
            .expect("access record");
        assert_eq!(record.field("labels"), Some("method=/a.B/C"));
    }
}

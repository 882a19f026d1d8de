//! HTTP layers in front of the call endpoint.
//!
//! The HTTP request id and the call `request-id` are one value: a valid
//! caller `request-id` becomes the `x-request-id`, a missing one is filled
//! with a UUID that the call then adopts, and the RPC handler mirrors the
//! id the call actually ran with back into `x-request-id`.

use axum::http::header::HeaderName;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use keel_core::metadata::REQUEST_ID;
use keel_core::RequestId;
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId as HttpRequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::Span;

use super::config::NetworkConfig;

/// Header carrying the HTTP-level request id.
pub const X_REQUEST_ID: &str = "x-request-id";

type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            CorsLayer,
            tower::layer::util::Stack<
                TraceLayer<SharedClassifier<ServerErrorsAsFailures>, HttpSpan>,
                tower::layer::util::Stack<
                    SetRequestIdLayer<CallRequestId>,
                    tower::layer::util::Identity,
                >,
            >,
        >,
    >,
>;

/// Builds the HTTP-level Tower middleware stack.
///
/// **Middleware ordering (outermost to innermost):**
/// 1. `SetRequestId` -- fills a missing `x-request-id` from [`CallRequestId`]
/// 2. `Tracing` -- one `http` span per request, tagged with the request id
/// 3. `CORS` -- allowed origins from the configuration
/// 4. `Timeout` -- maximum request processing duration
/// 5. `PropagateRequestId` -- copies `x-request-id` to responses that lack one
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static(X_REQUEST_ID);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), CallRequestId))
        .layer(TraceLayer::new_for_http().make_span_with(HttpSpan))
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// Picks the `x-request-id` for a request that arrived without one.
///
/// A usable `request-id` header wins so the HTTP span and the call share
/// the caller's id. Anything else gets a fresh UUID v4.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallRequestId;

impl MakeRequestId for CallRequestId {
    fn make_request_id<B>(&mut self, request: &Request<B>) -> Option<HttpRequestId> {
        let caller = request
            .headers()
            .get(REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| RequestId::parse(raw).ok());
        let id = caller.unwrap_or_else(RequestId::generate);
        HeaderValue::from_str(id.as_str()).ok().map(HttpRequestId::new)
    }
}

/// `http` span carrying method, path and request id.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpSpan;

impl<B> MakeSpan<B> for HttpSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        tracing::info_span!(
            "http",
            method = %request.method(),
            path = %request.uri().path(),
            request_id,
        )
    }
}

/// A wildcard `"*"` allows any origin; otherwise the parsed list is used.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers(Any)
}

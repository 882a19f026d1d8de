//! JSON call endpoint: `POST /rpc/{*method}`.
//!
//! The path after `/rpc` is the fully-qualified method name. Request headers
//! become call metadata, the JSON body becomes the call body, trailers come
//! back as response headers, and a failed call maps its [`Status`] onto an
//! HTTP status with a JSON error body. The response `x-request-id` always
//! matches the `request-id` the call ran with.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use keel_core::metadata::REQUEST_ID;
use keel_core::{Code, Metadata, MetadataError, Status};
use serde_json::{json, Value};
use tower::ServiceExt;
use tracing::{debug, warn};

use super::AppState;
use crate::network::middleware::X_REQUEST_ID;
use crate::service::call::InboundCall;
use crate::service::middleware::CallPipeline;

/// Pipeline type served over HTTP: JSON in, JSON out.
pub type RpcPipeline = CallPipeline<Value, Value>;

pub async fn rpc_handler(
    State(state): State<AppState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(err) => {
                let status = Status::invalid_argument(format!("invalid JSON body: {err}"));
                return status_response(&status);
            }
        }
    };

    let call = InboundCall::unary(format!("/{method}"), payload)
        .with_metadata(metadata_from_headers(&headers));
    let trailers = call.trailers.clone();

    let result = state.pipeline.clone().oneshot(call).await;

    let mut response = match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => status_response(&err.to_status()),
    };
    append_trailers(response.headers_mut(), &trailers.seal());
    mirror_request_id(response.headers_mut());
    response
}

/// Headers as call metadata. `x-request-id` stands in for a missing
/// `request-id`, so HTTP and call logs share one id. Headers that cannot be
/// carried as metadata are dropped and logged.
fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        let key = name.as_str();
        let inserted = value
            .to_str()
            .map_err(|_| MetadataError::InvalidValue {
                key: key.to_owned(),
            })
            .and_then(|value| metadata.insert(key, value));
        match inserted {
            Ok(()) => {}
            Err(err) if key == REQUEST_ID || key == X_REQUEST_ID => {
                warn!(header = key, error = %err, "Dropped invalid request-id header.");
            }
            Err(err) => debug!(header = key, error = %err, "Dropped header from call metadata."),
        }
    }
    if metadata.get(REQUEST_ID).is_none() {
        if let Some(id) = metadata.get(X_REQUEST_ID).map(str::to_owned) {
            // Already validated as a metadata value above.
            let _ = metadata.insert(REQUEST_ID, id);
        }
    }
    metadata
}

/// Overwrites `x-request-id` with the call's echoed `request-id`.
fn mirror_request_id(headers: &mut HeaderMap) {
    if let Some(id) = headers.get(REQUEST_ID).cloned() {
        headers.insert(HeaderName::from_static(X_REQUEST_ID), id);
    }
}

fn append_trailers(headers: &mut HeaderMap, trailers: &Metadata) {
    for (key, value) in trailers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

fn status_response(status: &Status) -> Response {
    let body = json!({
        "code": status.code().as_str(),
        "message": status.message(),
    });
    (http_status(status.code()), Json(body)).into_response()
}

/// HTTP status for a call status code, as REST gateways map them.
#[must_use]
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

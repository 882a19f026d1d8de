use std::fmt;
use std::sync::Arc;

use tracing::Span;

use crate::metadata::{Metadata, REQUEST_ID};
use crate::settings::Settings;

/// Longest caller-supplied request identifier that is accepted as-is.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Errors from reading a caller-supplied request identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestIdError {
    #[error("request id is empty")]
    Empty,
    #[error("request id is {len} bytes long, limit is {MAX_REQUEST_ID_LEN}")]
    TooLong { len: usize },
}

/// Identifier correlating every log record of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Arc<str>);

impl RequestId {
    /// Generates a fresh UUID v4 identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    /// Validates a caller-supplied identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RequestIdError`] when the value is blank or too long.
    pub fn parse(raw: &str) -> Result<Self, RequestIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RequestIdError::Empty);
        }
        if trimmed.len() > MAX_REQUEST_ID_LEN {
            return Err(RequestIdError::TooLong { len: trimmed.len() });
        }
        Ok(Self(trimmed.into()))
    }

    /// Reads the identifier from inbound metadata. `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`RequestIdError`] when the key is present but unusable.
    pub fn from_metadata(metadata: &Metadata) -> Result<Option<Self>, RequestIdError> {
        metadata.get(REQUEST_ID).map(Self::parse).transpose()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// String labels attributing runtime activity to the call that caused it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilingLabels {
    labels: Vec<(&'static str, String)>,
}

impl ProfilingLabels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a label.
    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.labels.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.labels.push((key, value)),
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.labels.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// Per-call context derived once at call entry and threaded to the handler.
///
/// Holds the settings snapshot captured when the call started: a snapshot
/// published later is never visible to a call already in flight. Cloning is
/// cheap (reference counts plus a span handle).
#[derive(Debug, Clone)]
pub struct CallContext {
    settings: Arc<Settings>,
    request_id: RequestId,
    method: Arc<str>,
    version: Arc<str>,
    span: Span,
    labels: ProfilingLabels,
}

impl CallContext {
    /// Builds the context and its scoped logging span.
    ///
    /// The span carries the fully-qualified method, the request id and the
    /// build version, so every record emitted inside it is attributable.
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        request_id: RequestId,
        method: impl Into<Arc<str>>,
        version: impl Into<Arc<str>>,
    ) -> Self {
        let method: Arc<str> = method.into();
        let version: Arc<str> = version.into();
        let span = tracing::info_span!(
            "call",
            method = %method,
            request_id = %request_id,
            backend_version = %version,
        );
        let labels = ProfilingLabels::new().with("method", method.as_ref());
        Self {
            settings,
            request_id,
            method,
            version,
            span,
            labels,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Scoped logger for this call.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    #[must_use]
    pub fn labels(&self) -> &ProfilingLabels {
        &self.labels
    }
}

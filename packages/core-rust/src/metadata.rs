//! Call metadata: string key/value pairs carried alongside a call.
//!
//! Inbound metadata arrives with the request; trailing metadata is sent back
//! after the handler finishes. Keys are case-insensitive and stored
//! lowercase.

use std::collections::BTreeMap;

/// Inbound key carrying the caller-supplied request identifier.
pub const REQUEST_ID: &str = "request-id";
/// Trailer key carrying the build version of the serving process.
pub const BACKEND_VERSION: &str = "backend-version";

/// Errors from validating metadata keys and values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("invalid metadata key {key:?}")]
    InvalidKey { key: String },
    #[error("invalid value for metadata key {key:?}")]
    InvalidValue { key: String },
}

/// Ordered, case-insensitive string metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds metadata from pairs, skipping any pair that fails validation.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut md = Self::new();
        for (key, value) in pairs {
            let _ = md.insert(key.as_ref(), value);
        }
        md
    }

    /// Inserts a pair, replacing any previous value for the same key.
    ///
    /// Keys must be non-empty and made of ASCII alphanumerics, `-`, `_` or
    /// `.`. Values must be printable ASCII.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the key or value is not valid.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Result<(), MetadataError> {
        let key = normalize_key(key)?;
        let value = value.into();
        if !value.bytes().all(|b| (0x20..0x7f).contains(&b)) {
            return Err(MetadataError::InvalidValue { key });
        }
        self.entries.insert(key, value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Copies every pair of `other` into `self`, overwriting shared keys.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_key(key: &str) -> Result<String, MetadataError> {
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(key.to_ascii_lowercase())
    } else {
        Err(MetadataError::InvalidKey {
            key: key.to_string(),
        })
    }
}

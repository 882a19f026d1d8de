use std::time::Duration;

use async_trait::async_trait;

use crate::index::ModifyIndex;

/// A value read from the coordination store together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: ModifyIndex,
}

/// Failures talking to the coordination store. All of them are transient
/// from the reloader's point of view.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("config store request failed: {0}")]
    Transport(String),
    #[error("config store answered with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed config store response: {0}")]
    Decode(String),
}

/// Key/value coordination store with blocking long-poll reads.
/// Implementations: Consul KV over HTTP, in-memory (development, tests).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Reads `key`, blocking server-side until its modify-index differs from
    /// `wait_index` or `wait` elapses. A zero `wait_index` returns at once.
    /// `Ok(None)` means the key does not exist.
    async fn get(
        &self,
        key: &str,
        wait_index: ModifyIndex,
        wait: Duration,
    ) -> Result<Option<KvPair>, StoreError>;

    /// Writes `value` under `key`, bumping its modify-index.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
}

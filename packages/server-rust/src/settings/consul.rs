//! Consul KV client over the HTTP API.
//!
//! Blocking reads use `GET /v1/kv/{key}?index={n}&wait={d}`. Consul answers
//! with a JSON array of entries whose `Value` is base64 encoded, and 404 for
//! a missing key.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use keel_core::{ConfigStore, KvPair, ModifyIndex, StoreError};
use serde::Deserialize;
use tracing::trace;

/// Added on top of the server-side wait before the client gives up.
const REQUEST_SLACK: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
    modify_index: u64,
}

/// [`ConfigStore`] backed by a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulStore {
    client: reqwest::Client,
    base_url: String,
}

impl ConsulStore {
    /// Creates a client for the agent at `address` (`host:port` or a URL).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transport`] if the HTTP client cannot be built.
    pub fn new(address: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            base_url: base_url(address),
        })
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'))
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[allow(clippy::needless_pass_by_value)]
fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

/// Decodes a KV read response body into its first entry.
fn decode_entries(body: &[u8]) -> Result<Option<KvPair>, StoreError> {
    let entries: Vec<KvEntry> =
        serde_json::from_slice(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };

    let value = match entry.value {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::Decode(format!("value of {}: {e}", entry.key)))?,
        None => Vec::new(),
    };

    Ok(Some(KvPair {
        key: entry.key,
        value,
        modify_index: ModifyIndex::new(entry.modify_index),
    }))
}

#[async_trait]
impl ConfigStore for ConsulStore {
    async fn get(
        &self,
        key: &str,
        wait_index: ModifyIndex,
        wait: Duration,
    ) -> Result<Option<KvPair>, StoreError> {
        // Consul adds up to wait/16 of jitter to blocking queries.
        let mut request = self
            .client
            .get(self.key_url(key))
            .timeout(wait + wait / 16 + REQUEST_SLACK);
        if wait_index != ModifyIndex::ZERO {
            request = request.query(&[
                ("index", wait_index.get().to_string()),
                ("wait", format!("{}ms", wait.as_millis())),
            ]);
        }

        trace!(key, wait_index = wait_index.get(), "consul kv get");
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = response.bytes().await.map_err(transport)?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        decode_entries(&body)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.key_url(key))
            .timeout(REQUEST_SLACK)
            .body(value)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() || body.trim() == "false" {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

//! Application settings snapshot.
//!
//! A [`Settings`] value is the unit the reloader publishes: it is decoded
//! from the JSON payload stored under the configuration key, shared behind an
//! `Arc`, and never mutated afterwards. A newer snapshot replaces it wholesale.
//!
//! # Wire format
//!
//! Field names match the JSON document kept in the coordination store.
//! Durations are encoded as integer nanoseconds. Every field is optional on
//! the wire and falls back to its `Default`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable configuration snapshot shared with every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Database connection parameters.
    pub postgres: PostgresConfig,
    /// Call listener addresses.
    pub api: ApiConfig,
    /// Debug switches.
    pub debug: DebugConfig,
    /// Error-tracking settings.
    pub sentry: SentryConfig,
    /// Metrics exporter settings.
    #[serde(rename = "prometheus_config")]
    pub prometheus: PrometheusConfig,
}

impl Settings {
    /// Decodes a snapshot from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error when the payload is not a
    /// valid settings document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encodes the snapshot to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Address the Prometheus scrape endpoint listens on. Empty disables it.
    pub metrics_listen_address: String,
    /// Name under which the service registers itself for scraping.
    #[serde(rename = "reg_service_name")]
    pub registered_service_name: String,
}

/// Listener addresses for the call transports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub grpc_listen_address: String,
    pub grpc_web_listen_address: String,
    pub rest_listen_address: String,
}

/// Debug switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub debug_email_pattern: String,
    pub enable_reflection: bool,
    pub enable_development_logger: bool,
    pub enable_debug_level_logger: bool,
}

/// Database connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub url: String,
    /// Maximum lifetime of a pooled connection. Zero means unlimited.
    #[serde(with = "duration_nanos")]
    pub conn_max_lifetime: Duration,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
}

/// Error-tracking settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentryConfig {
    pub dsn: String,
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

//! Process configuration, from flags with environment fallbacks.

use std::time::Duration;

use clap::Parser;

use crate::observability::LogFormat;
use crate::settings::ReloaderConfig;

/// Process-level configuration for the server binary.
///
/// Everything else comes from the settings document in the config store.
#[derive(Debug, Clone, Parser)]
#[command(name = "keel-server", version, about = "Keel server")]
pub struct ServerConfig {
    /// Consul agent address, `host:port` or URL.
    #[arg(long, env = "KEEL_CONSUL_ADDRESS", default_value = "127.0.0.1:8500")]
    pub consul_address: String,

    /// Consul KV key holding the settings document.
    #[arg(long, env = "KEEL_CONSUL_CONFIG_KEY", default_value = "consul-config-key")]
    pub consul_config_key: String,

    /// Log level: debug, info, warn or error. Unknown values mean debug.
    #[arg(long, env = "KEEL_LOGLEVEL", default_value = "info")]
    pub loglevel: String,

    /// Log output format.
    #[arg(long, env = "KEEL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Time in-flight calls get to finish after the first termination signal.
    #[arg(long, env = "KEEL_GRACE_PERIOD_MS", default_value_t = 3000)]
    pub grace_period_ms: u64,

    /// Long-poll wait for settings changes.
    #[arg(long, env = "KEEL_WAIT_TIME_SECS", default_value_t = 60)]
    pub wait_time_secs: u64,

    /// Backoff between failed settings polls.
    #[arg(long, env = "KEEL_FALLBACK_MS", default_value_t = 1000)]
    pub fallback_ms: u64,
}

impl ServerConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub fn reloader_config(&self) -> ReloaderConfig {
        ReloaderConfig {
            key: self.consul_config_key.clone(),
            wait_time: Duration::from_secs(self.wait_time_secs),
            fallback: Duration::from_millis(self.fallback_ms),
        }
    }
}

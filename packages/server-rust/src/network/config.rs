//! Network configuration for the HTTP transport.

use std::time::Duration;

use keel_core::Settings;

/// Listener and HTTP-layer configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// `host:port` to bind. Port 0 means OS-assigned.
    pub listen_address: String,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:0".to_string(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// Configuration listening on the REST address from `settings`, falling
    /// back to the default address when it is unset.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let mut config = Self::default();
        if !settings.api.rest_listen_address.is_empty() {
            config.listen_address.clone_from(&settings.api.rest_listen_address);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_address, "0.0.0.0:0");
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn listen_address_taken_from_settings() {
        let mut settings = Settings::default();
        assert_eq!(
            NetworkConfig::from_settings(&settings).listen_address,
            "0.0.0.0:0"
        );

        settings.api.rest_listen_address = "127.0.0.1:8081".to_string();
        assert_eq!(
            NetworkConfig::from_settings(&settings).listen_address,
            "127.0.0.1:8081"
        );
    }
}

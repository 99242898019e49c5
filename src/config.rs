//! Per-call configuration for the transport core.
//!
//! The core reads no environment variables and persists no state of its
//! own; every operation that needs configuration takes it as an argument.
//! `TransportConfig` bundles the values that are otherwise identical
//! across calls for a given host (server URL, credential, tunables) so
//! callers aren't forced to thread them through individually.

use std::time::Duration;

use crate::constants::{
    DATA_CHANNEL_OPEN_TIMEOUT, GRACE_PERIOD, ICE_RESTART_BACKOFF_MULTIPLIER,
    ICE_RESTART_BASE_DELAY, ICE_RESTART_MAX_ATTEMPTS, SUBSCRIBE_TIMEOUT,
};

/// Configuration for a `TransportManager`.
///
/// Cheap to clone; held by the manager and handed to each subsystem it
/// composes (signaling, peer connections, codec).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the hub's signaling/HTTP endpoint (e.g. `https://hub.example.com`).
    pub server_url: String,
    /// Bearer credential sent with the ICE-config HTTP request and the
    /// signaling subscription.
    pub api_key: String,
    /// How long `subscribe` waits for a `subscribed` confirmation.
    pub subscribe_timeout: Duration,
    /// How long to wait for the DataChannel to open.
    pub data_channel_open_timeout: Duration,
    /// Deferred-teardown window for `disconnect`.
    pub grace_period: Duration,
    /// Base delay for ICE restart exponential backoff.
    pub ice_restart_base_delay: Duration,
    /// Backoff multiplier per ICE restart attempt.
    pub ice_restart_backoff_multiplier: u32,
    /// Maximum ICE restart attempts before the peer is torn down.
    pub ice_restart_max_attempts: u32,
    /// Gzip-compress PTY payloads at or above this size.
    pub pty_compression_threshold: usize,
}

impl TransportConfig {
    /// Build a config pointed at `server_url`, authenticated with `api_key`,
    /// with every tunable at its spec-mandated default.
    #[must_use]
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
            data_channel_open_timeout: DATA_CHANNEL_OPEN_TIMEOUT,
            grace_period: GRACE_PERIOD,
            ice_restart_base_delay: ICE_RESTART_BASE_DELAY,
            ice_restart_backoff_multiplier: ICE_RESTART_BACKOFF_MULTIPLIER,
            ice_restart_max_attempts: ICE_RESTART_MAX_ATTEMPTS,
            pty_compression_threshold: crate::constants::PTY_COMPRESSION_THRESHOLD,
        }
    }

    /// URL for the ICE server configuration endpoint for `hub_id`.
    #[must_use]
    pub fn ice_config_url(&self, hub_id: &str) -> String {
        format!("{}/hubs/{hub_id}/webrtc", self.server_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fills_in_spec_default_tunables() {
        let config = TransportConfig::new("https://hub.example.com", "secret");
        assert_eq!(config.subscribe_timeout, Duration::from_millis(10_000));
        assert_eq!(config.grace_period, Duration::from_millis(3_000));
        assert_eq!(config.ice_restart_max_attempts, 3);
    }

    #[test]
    fn ice_config_url_is_per_hub() {
        let config = TransportConfig::new("https://hub.example.com", "secret");
        assert_eq!(
            config.ice_config_url("hub-1"),
            "https://hub.example.com/hubs/hub-1/webrtc"
        );
    }
}

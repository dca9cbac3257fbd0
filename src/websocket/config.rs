//! WebSocket transport configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Enable WebSocket support
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum message size in bytes, mirrors `auth.max_http_buffer_size`.
    #[serde(default = "default_max_message_size")]
    pub max_message_size_bytes: usize,

    /// Ping interval in seconds (for keepalive)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Pong timeout in seconds (disconnect if no pong received)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl WebSocketConfig {
    /// Get the ping interval as a Duration
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Get the pong timeout as a Duration
    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_message_size_bytes: default_max_message_size(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

// Default value functions

const fn default_enabled() -> bool {
    true
}

const fn default_max_message_size() -> usize {
    100 * 1024 * 1024
}

const fn default_ping_interval() -> u64 {
    30
}

const fn default_pong_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_websocket_config() {
        let config = WebSocketConfig::default();
        assert!(config.enabled);
        assert_eq!(config.ping_interval_secs, 30);
    }

    #[test]
    fn test_duration_helpers() {
        let config = WebSocketConfig::default();
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.pong_timeout(), Duration::from_secs(10));
    }
}

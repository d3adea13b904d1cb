//! Configuration for the processing loop

use std::env;
use std::time::Duration;

use common::error::{Error, Result};

/// Default wake channel name
pub const DEFAULT_WAKE_CHANNEL: &str = "engine_wake";

/// Configuration for the processing loop
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pub/sub channel the loop subscribes to for new-order wake events
    pub wake_channel: String,
    /// How long to wait for a wake message before polling anyway
    pub poll_interval: Duration,
    /// When true, each matching iteration commits exactly one trade and
    /// re-stamps the trade clock before the next; when false, a whole
    /// pass's trades share one trade clock (each still commits in its own
    /// transaction)
    pub trade_per_iteration: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wake_channel: DEFAULT_WAKE_CHANNEL.to_string(),
            poll_interval: Duration::from_secs(5),
            trade_per_iteration: true,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let wake_channel = env::var("ENGINE_WAKE_CHANNEL")
            .unwrap_or_else(|_| DEFAULT_WAKE_CHANNEL.to_string());

        let poll_ms = match env::var("ENGINE_POLL_INTERVAL_MS") {
            Ok(value) => value.parse::<u64>().map_err(|_| {
                Error::Configuration(format!("ENGINE_POLL_INTERVAL_MS is not a number: {}", value))
            })?,
            Err(_) => 5000,
        };
        if poll_ms == 0 {
            return Err(Error::Configuration(
                "ENGINE_POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let trade_per_iteration = env::var("ENGINE_TRADE_PER_ITERATION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            wake_channel,
            poll_interval: Duration::from_millis(poll_ms),
            trade_per_iteration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = EngineConfig::default();
        assert!(config.poll_interval > Duration::ZERO);
        assert_eq!(config.wake_channel, DEFAULT_WAKE_CHANNEL);
    }
}

//! Operation manager configuration.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Configuration for the operation manager.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct OpsConfig {
    /// Buffer size of the broadcast event channel.
    #[builder(default = "100")]
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Consecutive per-entry failures after which a transfer task aborts.
    #[builder(default = "100")]
    #[serde(default = "default_error_limit")]
    pub consecutive_error_limit: usize,

    /// Number of samples in the transfer-speed moving window.
    #[builder(default = "20")]
    #[serde(default = "default_speed_window")]
    pub speed_window: usize,
}

fn default_event_capacity() -> usize {
    100
}

fn default_error_limit() -> usize {
    100
}

fn default_speed_window() -> usize {
    20
}

impl OpsConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(capacity) = self.event_capacity {
            if capacity == 0 {
                return Err("Event capacity must be at least 1".to_string());
            }
        }
        if let Some(window) = self.speed_window {
            if window == 0 {
                return Err("Speed window must be at least 1".to_string());
            }
        }
        Ok(())
    }
}

impl OpsConfig {
    /// Create a new config builder.
    pub fn builder() -> OpsConfigBuilder {
        OpsConfigBuilder::default()
    }
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            consecutive_error_limit: default_error_limit(),
            speed_window: default_speed_window(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OpsConfig::default();
        assert_eq!(config.event_capacity, 100);
        assert_eq!(config.consecutive_error_limit, 100);
        assert_eq!(config.speed_window, 20);
    }

    #[test]
    fn test_config_builder() {
        let config = OpsConfig::builder()
            .event_capacity(16usize)
            .consecutive_error_limit(3usize)
            .build()
            .unwrap();

        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.consecutive_error_limit, 3);
        assert_eq!(config.speed_window, 20);
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let result = OpsConfig::builder().event_capacity(0usize).build();
        assert!(result.is_err());
    }
}

//! Engine configuration: CLI flags with environment fallbacks.

use std::time::Duration;

use clap::Args;
use serde::Serialize;

use crate::agent::RunnerSettings;
use crate::api::GatePolicy;
use crate::error::ConfigError;

pub const DATA_API_BASE: &str = "https://data-api.polymarket.com";
pub const CLOB_API_BASE: &str = "https://clob.polymarket.com";

/// Tunables shared by every agent in the process.
#[derive(Debug, Clone, Args, Serialize)]
pub struct EngineConfig {
    /// Base URL of the activity feed API
    #[arg(long, env = "POLYFLEET_DATA_API_URL", default_value = DATA_API_BASE)]
    pub data_api_url: String,

    /// Base URL of the market and order API
    #[arg(long, env = "POLYFLEET_CLOB_API_URL", default_value = CLOB_API_BASE)]
    pub clob_api_url: String,

    /// API key for live order submission
    #[arg(long, env = "POLYFLEET_ORDER_API_KEY", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub order_api_key: Option<String>,

    /// Seconds between two poll cycles of one agent
    #[arg(long, env = "POLYFLEET_POLL_INTERVAL", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Minimum milliseconds between any two upstream requests
    #[arg(long, env = "POLYFLEET_REQUEST_SPACING_MS", default_value_t = 200)]
    pub request_spacing_ms: u64,

    /// First backoff delay after a throttling response, in milliseconds
    #[arg(long, env = "POLYFLEET_BACKOFF_BASE_MS", default_value_t = 1000)]
    pub backoff_base_ms: u64,

    /// Largest single backoff delay, in seconds
    #[arg(long, env = "POLYFLEET_BACKOFF_CAP_SECS", default_value_t = 60)]
    pub backoff_cap_secs: u64,

    /// Attempts per feed request before the cycle is skipped
    #[arg(long, env = "POLYFLEET_MAX_FEED_ATTEMPTS", default_value_t = 5)]
    pub max_feed_attempts: u32,

    /// Activity events fetched per request
    #[arg(long, env = "POLYFLEET_ACTIVITY_PAGE_SIZE", default_value_t = 100)]
    pub activity_page_size: u32,

    /// Seconds to wait for an agent to stop (default: three poll intervals)
    #[arg(long, env = "POLYFLEET_STOP_TIMEOUT")]
    pub stop_timeout_secs: Option<u64>,

    /// Seconds to wait for all agents on shutdown
    #[arg(long, env = "POLYFLEET_SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Seconds between performance snapshots of a running agent
    #[arg(long, env = "POLYFLEET_SNAPSHOT_INTERVAL", default_value_t = 3600)]
    pub snapshot_interval_secs: u64,

    /// Consecutive cycles lost to store failures before an agent faults
    #[arg(long, env = "POLYFLEET_PERSISTENCE_FAULT_THRESHOLD", default_value_t = 5)]
    pub persistence_fault_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_api_url: DATA_API_BASE.to_string(),
            clob_api_url: CLOB_API_BASE.to_string(),
            order_api_key: None,
            poll_interval_secs: 5,
            request_spacing_ms: 200,
            backoff_base_ms: 1000,
            backoff_cap_secs: 60,
            max_feed_attempts: 5,
            activity_page_size: 100,
            stop_timeout_secs: None,
            shutdown_timeout_secs: 30,
            snapshot_interval_secs: 3600,
            persistence_fault_threshold: 5,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Zero { field: "poll_interval_secs" });
        }
        if self.request_spacing_ms == 0 {
            return Err(ConfigError::Zero { field: "request_spacing_ms" });
        }
        if self.max_feed_attempts == 0 {
            return Err(ConfigError::Zero { field: "max_feed_attempts" });
        }
        if self.activity_page_size == 0 {
            return Err(ConfigError::Zero { field: "activity_page_size" });
        }
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Zero { field: "backoff_base_ms" });
        }
        let policy = self.gate_policy();
        if policy.backoff_cap < policy.backoff_base {
            return Err(ConfigError::BackoffCap {
                base: policy.backoff_base,
                cap: policy.backoff_cap,
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.poll_interval() * 3)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            poll_interval: self.poll_interval(),
            snapshot_interval: self.snapshot_interval(),
            persistence_fault_threshold: self.persistence_fault_threshold.max(1),
        }
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            spacing: Duration::from_millis(self.request_spacing_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.stop_timeout(), Duration::from_secs(15));
        assert_eq!(config.gate_policy().spacing, Duration::from_millis(200));
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let config = EngineConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "poll_interval_secs" })
        );
    }

    #[test]
    fn test_rejects_cap_below_base() {
        let config = EngineConfig {
            backoff_base_ms: 5000,
            backoff_cap_secs: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BackoffCap { .. })));
    }

    #[test]
    fn test_explicit_stop_timeout() {
        let config = EngineConfig {
            stop_timeout_secs: Some(2),
            ..Default::default()
        };
        assert_eq!(config.stop_timeout(), Duration::from_secs(2));
    }
}

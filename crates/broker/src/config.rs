//! Broker configuration.

use std::time::Duration;

use serde::Deserialize;

/// Broker configuration loaded from environment variables.
///
/// Variables are prefixed with `FLOE_`:
/// - `FLOE_HOST` / `FLOE_PORT`: control API bind address
/// - `FLOE_POLL_MS`: dispatcher poll interval in milliseconds
/// - `FLOE_DIRTY_LIMIT`: executions picked up per poll
/// - `FLOE_CLAIM_TTL`: broker slot lease in seconds
/// - `FLOE_REAP_INTERVAL`: queue reaper interval in seconds
/// - `FLOE_WORKER_STALE_AFTER`: worker registry cleanup threshold in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    #[serde(default = "default_dirty_limit")]
    pub dirty_limit: i64,

    #[serde(default = "default_claim_ttl")]
    pub claim_ttl: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval: u64,

    #[serde(default = "default_worker_stale_after")]
    pub worker_stale_after: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_poll_ms() -> u64 {
    250
}

fn default_dirty_limit() -> i64 {
    32
}

fn default_claim_ttl() -> u64 {
    30
}

fn default_reap_interval() -> u64 {
    10
}

fn default_worker_stale_after() -> u64 {
    120
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_ms: default_poll_ms(),
            dirty_limit: default_dirty_limit(),
            claim_ttl: default_claim_ttl(),
            reap_interval: default_reap_interval(),
            worker_stale_after: default_worker_stale_after(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from `FLOE_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLOE_").from_env::<BrokerConfig>()
    }

    /// Bind address for the control API.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Dispatcher poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    /// Broker slot lease duration.
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8090");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.dirty_limit, 32);
    }
}

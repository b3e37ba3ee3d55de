//! Worker configuration.

use std::time::Duration;

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier.
    pub worker_id: String,

    /// Worker pool name.
    pub pool_name: String,

    /// Jobs leased per poll.
    pub batch_size: i64,

    /// Lease visibility window.
    pub visibility: Duration,

    /// Sleep between empty polls.
    pub poll_interval: Duration,

    /// Maximum concurrent jobs.
    pub max_concurrent: usize,

    /// Default per-attempt deadline when the task has none.
    pub default_timeout: Duration,

    /// Worker registry heartbeat interval.
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let worker_id =
            std::env::var("FLOE_WORKER_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let pool_name =
            std::env::var("FLOE_WORKER_POOL").unwrap_or_else(|_| "default".to_string());

        let batch_size: i64 = std::env::var("FLOE_WORKER_BATCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let visibility_secs: u64 = std::env::var("FLOE_WORKER_VISIBILITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let poll_ms: u64 = std::env::var("FLOE_WORKER_POLL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);

        let max_concurrent: usize = std::env::var("FLOE_WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let timeout_secs: u64 = std::env::var("FLOE_WORKER_DEFAULT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let heartbeat_secs: u64 = std::env::var("FLOE_WORKER_HEARTBEAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        Self {
            worker_id,
            pool_name,
            batch_size,
            visibility: Duration::from_secs(visibility_secs),
            poll_interval: Duration::from_millis(poll_ms),
            max_concurrent,
            default_timeout: Duration::from_secs(timeout_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
        }
    }

    /// Interval between job lease extensions: a third of the visibility
    /// window, so two beats can fail before the lease expires.
    pub fn lease_beat(&self) -> Duration {
        self.visibility / 3
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            pool_name: "default".to_string(),
            batch_size: 5,
            visibility: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            max_concurrent: 4,
            default_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.pool_name, "default");
        assert_eq!(config.max_concurrent, 4);
    }

    #[test]
    fn test_lease_beat_is_third_of_visibility() {
        let config = WorkerConfig::default();
        assert_eq!(config.lease_beat(), Duration::from_secs(10));
    }
}

//! Engine configuration - concurrency limits, timeouts, leases and retry policy

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What a node failure does to the rest of the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Independent branches keep running; only dependents are blocked
    #[default]
    Isolate,
    /// The first failure blocks every node that has not started
    FailFast,
}

/// Bounded exponential backoff for transient store failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nodes of one task executing at once
    pub max_concurrency: usize,
    /// Optional cap across every task in the process
    pub global_max_concurrency: Option<usize>,
    /// Upper bound on a single agent step
    pub agent_timeout_secs: u64,
    /// Fail human steps nobody answers within this window
    pub human_input_timeout_secs: Option<u64>,
    /// How often a running node refreshes its lease
    pub heartbeat_interval_secs: u64,
    /// A running node silent for longer than this is treated as crashed
    pub stale_after_secs: u64,
    /// Scheduler re-reads the store at least this often
    pub poll_interval_ms: u64,
    pub failure_policy: FailurePolicy,
    pub store_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            global_max_concurrency: None,
            agent_timeout_secs: 300,
            human_input_timeout_secs: None,
            heartbeat_interval_secs: 5,
            stale_after_secs: 60,
            poll_interval_ms: 500,
            failure_policy: FailurePolicy::Isolate,
            store_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file; missing fields take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be greater than 0");
        }
        if self.global_max_concurrency == Some(0) {
            anyhow::bail!("global_max_concurrency must be greater than 0");
        }
        if self.agent_timeout_secs == 0 {
            anyhow::bail!("agent_timeout_secs must be greater than 0");
        }
        if self.human_input_timeout_secs == Some(0) {
            anyhow::bail!("human_input_timeout_secs must be greater than 0");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than 0");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }
        if self.stale_after_secs <= self.heartbeat_interval_secs {
            anyhow::bail!(
                "stale_after_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.stale_after_secs,
                self.heartbeat_interval_secs
            );
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn human_input_timeout(&self) -> Option<Duration> {
        self.human_input_timeout_secs.map(Duration::from_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.failure_policy, FailurePolicy::Isolate);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(4), Duration::from_millis(1000));
        assert_eq!(retry.backoff(80), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("max_concurrency: 8\nfailure_policy: fail_fast\n").unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.agent_timeout_secs, 300);
        assert_eq!(config.store_retry, RetryPolicy::default());
    }

    #[test]
    fn test_lease_must_outlive_heartbeat() {
        let config = EngineConfig {
            heartbeat_interval_secs: 30,
            stale_after_secs: 30,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

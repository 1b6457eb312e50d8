//! Engine and worker-pool configuration.
//!
//! Plain structs with `Default` impls so callers can override a single knob, and serde
//! derives so the surrounding application can load them from its own config file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to queued (not yet started) jobs when the worker pool closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Workers keep running until the backlog is empty.
    #[default]
    Drain,
    /// Workers drop whatever is still queued; in-flight jobs still finish.
    DiscardPending,
}

/// Sizing and shutdown behaviour of the handler worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (at least one is always spawned).
    pub workers: usize,
    /// Maximum number of queued jobs; `None` queues without limit.
    pub backlog_limit: Option<usize>,
    pub shutdown_policy: ShutdownPolicy,
    /// Worker threads are named `<prefix>-worker-<n>`.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            backlog_limit: None,
            shutdown_policy: ShutdownPolicy::Drain,
            thread_name_prefix: "dispatch".to_string(),
        }
    }
}

/// Top-level configuration used when the engine starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: WorkerPoolConfig,
    /// Upper bound on a single transport read, so the receive loop notices `stop()`.
    #[serde(with = "duration_millis")]
    pub receive_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            receive_timeout: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers;
        self
    }

    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.pool.backlog_limit = Some(limit);
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.pool.shutdown_policy = policy;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }
}

/// Available parallelism clamped to 2..=8.
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 8)
}

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = EngineConfig::default();
        assert!((2..=8).contains(&config.pool.workers));
        assert_eq!(config.pool.backlog_limit, None);
        assert_eq!(config.pool.shutdown_policy, ShutdownPolicy::Drain);
        assert_eq!(config.receive_timeout, Duration::from_millis(100));
    }

    #[test]
    fn builder_methods_override_single_knobs() {
        let config = EngineConfig::default()
            .with_workers(3)
            .with_backlog_limit(64)
            .with_shutdown_policy(ShutdownPolicy::DiscardPending)
            .with_receive_timeout(Duration::from_millis(20));
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.pool.backlog_limit, Some(64));
        assert_eq!(config.pool.shutdown_policy, ShutdownPolicy::DiscardPending);
        assert_eq!(config.receive_timeout, Duration::from_millis(20));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{
            "receive_timeout": 250,
            "pool": { "workers": 4, "shutdown_policy": "discard_pending" }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.receive_timeout, Duration::from_millis(250));
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.shutdown_policy, ShutdownPolicy::DiscardPending);
        assert_eq!(config.pool.thread_name_prefix, "dispatch");
    }

    #[test]
    fn config_serializes_durations_as_millis() {
        let config = EngineConfig::default().with_receive_timeout(Duration::from_millis(75));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["receive_timeout"], 75);
    }
}

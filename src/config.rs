use crate::core::{OverseerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Controls when the state writer flushes buffered deltas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WriterPolicy {
    /// Period of the background flush task, in milliseconds.
    pub flush_interval_ms: u64,
    /// Flush as soon as this many targets are dirty.
    pub max_pending_updates: usize,
    /// Flush once the oldest buffered delta is older than this, in milliseconds.
    pub max_pending_age_ms: u64,
}

impl Default for WriterPolicy {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
            max_pending_updates: 32,
            max_pending_age_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueuePolicy {
    /// Maximum number of queue entries peeked per processing cycle.
    pub batch_size: usize,
    /// How long the processing loop waits on an empty queue before
    /// re-checking leadership and shutdown, in milliseconds.
    pub idle_wait_ms: u64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_wait_ms: 1_000,
        }
    }
}

/// Retry behavior for version conflicts and store outages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Version conflicts tolerated per message before the loop backs off.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given 1-based attempt, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }
}

/// Upper bounds on the collection layouts a message may request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollectionLimits {
    pub max_shards_per_collection: u64,
    pub max_replication_factor: u64,
    /// `add_replica` is rejected once a shard holds this many replicas.
    pub max_replicas_per_shard: usize,
}

impl Default for CollectionLimits {
    fn default() -> Self {
        Self {
            max_shards_per_collection: 1_024,
            max_replication_factor: 64,
            max_replicas_per_shard: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventBusPolicy {
    /// Events buffered per listener before the oldest are dropped.
    pub listener_capacity: usize,
}

impl Default for EventBusPolicy {
    fn default() -> Self {
        Self {
            listener_capacity: 256,
        }
    }
}

/// Configuration of one overseer-capable node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OverseerConfig {
    /// Node name used for live-node registration and as election identity.
    pub node_name: String,
    pub writer: WriterPolicy,
    pub queue: QueuePolicy,
    pub retry: RetryPolicy,
    pub events: EventBusPolicy,
    pub limits: CollectionLimits,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            node_name: format!("node-{}", uuid::Uuid::new_v4().simple()),
            writer: WriterPolicy::default(),
            queue: QueuePolicy::default(),
            retry: RetryPolicy::default(),
            events: EventBusPolicy::default(),
            limits: CollectionLimits::default(),
        }
    }
}

impl OverseerConfig {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            ..Self::default()
        }
    }

    /// Set the background flush period
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.writer.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the dirty-target threshold that forces a flush
    pub fn max_pending_updates(mut self, max: usize) -> Self {
        self.writer.max_pending_updates = max;
        self
    }

    /// Set the age threshold that forces a flush
    pub fn max_pending_age(mut self, age: Duration) -> Self {
        self.writer.max_pending_age_ms = age.as_millis() as u64;
        self
    }

    /// Set the queue batch size
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.queue.batch_size = batch_size;
        self
    }

    /// Set the idle wait on an empty queue
    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.queue.idle_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-listener event buffer
    pub fn listener_capacity(mut self, capacity: usize) -> Self {
        self.events.listener_capacity = capacity;
        self
    }

    /// Set the collection layout limits
    pub fn collection_limits(mut self, limits: CollectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn flush_interval_duration(&self) -> Duration {
        Duration::from_millis(self.writer.flush_interval_ms.max(1))
    }

    pub fn idle_wait_duration(&self) -> Duration {
        Duration::from_millis(self.queue.idle_wait_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(OverseerError::Config(
                "node_name must not be empty".to_string(),
            ));
        }
        if self.node_name.contains('/') {
            return Err(OverseerError::Config(format!(
                "node_name '{}' must not contain '/'",
                self.node_name
            )));
        }
        if self.queue.batch_size == 0 {
            return Err(OverseerError::Config(
                "queue.batch_size must be >= 1".to_string(),
            ));
        }
        if self.writer.max_pending_updates == 0 {
            return Err(OverseerError::Config(
                "writer.max_pending_updates must be >= 1".to_string(),
            ));
        }
        if self.limits.max_shards_per_collection == 0
            || self.limits.max_replication_factor == 0
            || self.limits.max_replicas_per_shard == 0
        {
            return Err(OverseerError::Config(
                "collection limits must be >= 1".to_string(),
            ));
        }
        if self.events.listener_capacity == 0 {
            return Err(OverseerError::Config(
                "events.listener_capacity must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| OverseerError::Config(format!("invalid overseer config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 35,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(35));
        assert_eq!(retry.backoff(30), Duration::from_millis(35));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            OverseerConfig::from_json_str(r#"{"node_name":"n1","queue":{"batch_size":7}}"#)
                .unwrap();
        assert_eq!(config.node_name, "n1");
        assert_eq!(config.queue.batch_size, 7);
        assert_eq!(config.queue.idle_wait_ms, QueuePolicy::default().idle_wait_ms);
        assert_eq!(config.writer, WriterPolicy::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(OverseerConfig::from_json_str(r#"{"node_name":""}"#).is_err());
        assert!(OverseerConfig::new("a/b").validate().is_err());
        assert!(OverseerConfig::new("n1").batch_size(0).validate().is_err());
        assert!(OverseerConfig::new("n1").validate().is_ok());
        let no_shards = CollectionLimits {
            max_shards_per_collection: 0,
            ..CollectionLimits::default()
        };
        assert!(OverseerConfig::new("n1").collection_limits(no_shards).validate().is_err());
    }

    #[test]
    fn json_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overseer.json");
        std::fs::write(&path, r#"{"node_name":"from-file","writer":{"flush_interval_ms":5}}"#)
            .unwrap();
        let config = OverseerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.node_name, "from-file");
        assert_eq!(config.flush_interval_duration(), Duration::from_millis(5));
    }
}

//! Replication configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::{DeliverPolicy, ReplicationError};

/// Minimum and maximum stream/object-store replica counts accepted by the
/// bus.
pub const MIN_REPLICAS: usize = 1;
pub const MAX_REPLICAS: usize = 5;

/// Configuration for one database's replication pipeline.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Message bus URL.
    pub url: String,
    /// Stream (and subject) name the changesets flow on.
    pub stream: String,
    /// Replica count for the stream and snapshot bucket (1-5).
    pub replicas: usize,
    /// Stream retention age.
    pub max_age: Duration,
    /// Per-publish timeout waiting for a durable ack.
    pub publish_timeout: Duration,
    /// Operator-chosen subscriber delivery policy. `None` means "all",
    /// unless a snapshot restore overrides it with a resume sequence.
    pub policy: Option<DeliverPolicy>,
    /// Interval between automatic snapshots. `None` disables the timer.
    pub snapshot_interval: Option<Duration>,
    /// When true, DDL statements are not replicated.
    pub disable_ddl_sync: bool,
    /// Directory for the asynchronous-publication outbox. `None` keeps
    /// publication synchronous with commits.
    pub outbox_dir: Option<PathBuf>,
}

impl ReplicationConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: "quill_replication".to_string(),
            replicas: 1,
            max_age: Duration::from_secs(24 * 60 * 60),
            publish_timeout: Duration::from_secs(15),
            policy: None,
            snapshot_interval: None,
            disable_ddl_sync: false,
            outbox_dir: None,
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: DeliverPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    pub fn without_ddl_sync(mut self) -> Self {
        self.disable_ddl_sync = true;
        self
    }

    pub fn with_outbox_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.outbox_dir = Some(dir.into());
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        if self.url.is_empty() {
            return Err(ReplicationError::Config("url cannot be empty".into()));
        }
        if self.stream.is_empty() {
            return Err(ReplicationError::Config("stream cannot be empty".into()));
        }
        if !(MIN_REPLICAS..=MAX_REPLICAS).contains(&self.replicas) {
            return Err(ReplicationError::Config(format!(
                "replicas must be between {MIN_REPLICAS} and {MAX_REPLICAS}, got {}",
                self.replicas
            )));
        }
        if self.publish_timeout.is_zero() {
            return Err(ReplicationError::Config(
                "publish timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ReplicationConfig::new("nats://localhost:4222")
            .validate()
            .is_ok());
    }

    #[test]
    fn rejects_replica_counts_outside_range() {
        for replicas in [0, 6] {
            let config = ReplicationConfig::new("nats://localhost:4222").with_replicas(replicas);
            assert!(config.validate().is_err(), "{replicas}");
        }
        for replicas in [1, 3, 5] {
            let config = ReplicationConfig::new("nats://localhost:4222").with_replicas(replicas);
            assert!(config.validate().is_ok(), "{replicas}");
        }
    }

    #[test]
    fn rejects_empty_url() {
        assert!(ReplicationConfig::new("").validate().is_err());
    }
}

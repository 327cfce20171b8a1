//! Command-line interface for quilld.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use quill_replication::{DeliverPolicy, ReplicationConfig};

/// quilld - leaderless replicated-SQLite node
#[derive(Debug, Parser)]
#[command(name = "quilld", version, about, long_about = None)]
pub struct Cli {
    /// Node name (defaults to $HOSTNAME)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// HTTP server port
    #[arg(short = 'p', long, default_value_t = 8080)]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Maximum pooled connections per database
    #[arg(long, default_value_t = 10)]
    pub max_connections: u32,

    /// Replication message bus URL (replication is enabled when set)
    #[arg(long)]
    pub replication_url: Option<String>,

    /// Replication stream name
    #[arg(long, default_value = "quill_replication")]
    pub replication_stream: String,

    /// Replication stream max age in seconds
    #[arg(long, default_value_t = 86_400)]
    pub replication_max_age_secs: u64,

    /// Replication publisher timeout in seconds
    #[arg(long, default_value_t = 15)]
    pub replication_timeout_secs: u64,

    /// Subscriber delivery policy
    /// (all|last|new|by_start_sequence=N|by_start_time="YYYY-MM-DD HH:MM:SS")
    #[arg(long)]
    pub replication_policy: Option<String>,

    /// Stream and snapshot-bucket replicas on a clustered bus (1-5)
    #[arg(long, default_value_t = 1)]
    pub replicas: usize,

    /// Interval between automatic snapshots in seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub snapshot_interval_secs: u64,

    /// Restore the latest snapshot from the bus at startup and resume the
    /// subscription after it
    #[arg(long)]
    pub from_latest_snapshot: bool,

    /// Do not replicate DDL statements
    #[arg(long)]
    pub disable_ddl_sync: bool,

    /// Spool committed changesets to disk instead of blocking commits on
    /// the bus
    #[arg(long)]
    pub async_replication: bool,

    /// Outbox directory for asynchronous replication
    #[arg(long)]
    pub async_replication_store_dir: Option<PathBuf>,

    /// Path to an interceptor rule file (TOML)
    #[arg(long)]
    pub interceptor: Option<PathBuf>,

    /// Database files to serve
    #[arg(value_name = "DATABASE")]
    pub databases: Vec<PathBuf>,
}

impl Cli {
    /// The node name: flag, then hostname, then a fixed fallback.
    pub fn node_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "quill-node".to_string())
    }

    /// Database paths, defaulting to `quill.db`.
    pub fn database_paths(&self) -> Vec<PathBuf> {
        if self.databases.is_empty() {
            vec![PathBuf::from("quill.db")]
        } else {
            self.databases.clone()
        }
    }

    /// Builds the shared replication configuration, or `None` when no bus
    /// URL is configured.
    pub fn replication_config(&self) -> anyhow::Result<Option<ReplicationConfig>> {
        let Some(url) = &self.replication_url else {
            return Ok(None);
        };

        let mut config = ReplicationConfig::new(url.clone())
            .with_stream(self.replication_stream.clone())
            .with_replicas(self.replicas)
            .with_max_age(Duration::from_secs(self.replication_max_age_secs))
            .with_publish_timeout(Duration::from_secs(self.replication_timeout_secs));

        if let Some(policy) = &self.replication_policy {
            config = config.with_policy(policy.parse::<DeliverPolicy>()?);
        }
        if self.snapshot_interval_secs > 0 {
            config =
                config.with_snapshot_interval(Duration::from_secs(self.snapshot_interval_secs));
        }
        if self.disable_ddl_sync {
            config = config.without_ddl_sync();
        }

        config.validate()?;
        Ok(Some(config))
    }

    /// Base directory for the asynchronous-replication outbox, if enabled.
    pub fn outbox_base_dir(&self) -> Option<PathBuf> {
        if !self.async_replication {
            return None;
        }
        Some(
            self.async_replication_store_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".quill-outbox")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["quilld"]);
        assert_eq!(cli.port, 8080);
        assert_eq!(cli.database_paths(), [PathBuf::from("quill.db")]);
        assert!(cli.replication_config().unwrap().is_none());
        assert!(cli.outbox_base_dir().is_none());
    }

    #[test]
    fn replication_flags_build_a_config() {
        let cli = Cli::parse_from([
            "quilld",
            "--replication-url",
            "nats://localhost:4222",
            "--replication-stream",
            "edge",
            "--replicas",
            "3",
            "--replication-policy",
            "by_start_sequence=10",
            "--snapshot-interval-secs",
            "60",
            "--disable-ddl-sync",
            "data/app.db",
        ]);
        let config = cli.replication_config().unwrap().unwrap();
        assert_eq!(config.stream, "edge");
        assert_eq!(config.replicas, 3);
        assert_eq!(config.policy, Some(DeliverPolicy::ByStartSequence(10)));
        assert_eq!(config.snapshot_interval, Some(Duration::from_secs(60)));
        assert!(config.disable_ddl_sync);
        assert_eq!(cli.database_paths(), [PathBuf::from("data/app.db")]);
    }

    #[test]
    fn invalid_replica_count_is_rejected() {
        let cli = Cli::parse_from([
            "quilld",
            "--replication-url",
            "nats://localhost:4222",
            "--replicas",
            "9",
        ]);
        assert!(cli.replication_config().is_err());
    }

    #[test]
    fn async_replication_defaults_its_store_dir() {
        let cli = Cli::parse_from(["quilld", "--async-replication"]);
        assert_eq!(cli.outbox_base_dir(), Some(PathBuf::from(".quill-outbox")));
    }
}

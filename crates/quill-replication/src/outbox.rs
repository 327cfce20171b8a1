//! On-disk outbox for asynchronous replication.
//!
//! With `--async-replication` enabled, the commit hook spools each
//! committed changeset to a sequenced file instead of blocking on the bus;
//! the local commit succeeds as soon as the spool write is durable. A
//! background task drains the directory in filename order, publishing each
//! record with retry and deleting the file only after a durable ack, so
//! per-origin commit order is preserved across restarts.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use quill_cdc::Changeset;
use quill_types::{PublishError, StreamSeq};

use crate::ReplicationError;

const SPOOL_EXTENSION: &str = "json";
const POISON_EXTENSION: &str = "poison";
const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// A directory of spooled changesets awaiting publication.
#[derive(Debug)]
pub struct Outbox {
    dir: PathBuf,
    counter: AtomicU64,
}

impl Outbox {
    /// Opens (creating if necessary) the outbox directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ReplicationError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably writes one changeset to the spool.
    ///
    /// Called from the commit hook on the connection's worker thread, so
    /// the write is synchronous and fsynced: once this returns, the record
    /// survives a crash.
    pub fn spool(&self, changeset: &Changeset) -> Result<PathBuf, PublishError> {
        let encoded = changeset
            .encode()
            .map_err(|e| PublishError::Encode(e.to_string()))?;
        let counter = self.counter.fetch_add(1, Ordering::AcqRel);
        let name = format!("{:020}-{:06}.{SPOOL_EXTENSION}", changeset.timestamp_ns, counter);
        let path = self.dir.join(name);

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&path)?;
            file.write_all(&encoded)?;
            file.sync_all()
        };
        write().map_err(|e| PublishError::Spool(e.to_string()))?;
        Ok(path)
    }

    /// Spooled files in publication order.
    pub fn pending(&self) -> Result<Vec<PathBuf>, ReplicationError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SPOOL_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Publishes spooled changesets in order, stopping at the first
    /// failure so commit order is never reordered around an outage.
    ///
    /// Corrupt spool files are quarantined rather than retried forever.
    /// Returns the number of records published.
    pub async fn drain_once<F, Fut>(&self, mut publish: F) -> Result<usize, ReplicationError>
    where
        F: FnMut(Changeset) -> Fut,
        Fut: Future<Output = Result<StreamSeq, PublishError>>,
    {
        let mut published = 0;
        for path in self.pending()? {
            let payload = tokio::fs::read(&path).await?;
            let changeset = match Changeset::decode(&payload) {
                Ok(changeset) => changeset,
                Err(error) => {
                    tracing::error!(%error, path = %path.display(), "quarantining corrupt outbox record");
                    let quarantined = path.with_extension(POISON_EXTENSION);
                    tokio::fs::rename(&path, &quarantined).await?;
                    continue;
                }
            };
            match publish(changeset).await {
                Ok(seq) => {
                    tokio::fs::remove_file(&path).await?;
                    published += 1;
                    tracing::debug!(%seq, path = %path.display(), "outbox record published");
                }
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "outbox publish failed; will retry");
                    break;
                }
            }
        }
        Ok(published)
    }

    /// Runs the drain loop until shutdown.
    pub fn spawn_drain(
        self: std::sync::Arc<Self>,
        publisher: std::sync::Arc<crate::CdcPublisher>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(DRAIN_INTERVAL) => {
                        if let Err(error) = self.drain_once(|cs| publisher.publish(cs)).await {
                            tracing::error!(%error, "outbox drain failed");
                        }
                    }
                }
            }
        })
    }
}

//! Snapshot capture and restore over the bus's object store.
//!
//! A snapshot is a consistent binary image of the database file stored in
//! the bucket `<stream>_SNAPSHOTS` under the key `latest`, with the
//! subscriber's acknowledged stream sequence in the object metadata. On
//! startup a node can restore `latest` and resume its subscription from
//! the recorded sequence instead of replaying the whole stream.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_nats::jetstream::object_store::{ObjectMetadata, ObjectStore};
use async_nats::jetstream::stream::StorageType;
use sqlx::SqlitePool;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use quill_types::StreamSeq;

use crate::error::{bus_err, ReplicationError};
use crate::{Bus, DeliverPolicy, ReplicationConfig};

/// Object key of the current snapshot.
const LATEST_OBJECT: &str = "latest";

/// Metadata key carrying the stream sequence at capture time.
pub const SEQUENCE_METADATA_KEY: &str = "seq";

/// Bucket naming convention for a stream's snapshots.
pub fn bucket_name(stream: &str) -> String {
    format!("{stream}_SNAPSHOTS")
}

/// The delivery policy a restored node subscribes with.
///
/// An operator-specified policy always wins; otherwise the subscription
/// resumes at the position immediately after the snapshot.
pub fn resume_policy(snapshot_seq: StreamSeq, operator: Option<DeliverPolicy>) -> DeliverPolicy {
    operator.unwrap_or(DeliverPolicy::ByStartSequence(snapshot_seq.successor().get()))
}

/// Fetches the latest snapshot (if any) and materialises it as the local
/// database file. Returns the sequence recorded at capture time.
///
/// Called before the database is opened, so stale WAL side files from a
/// previous life of the file are removed along the way.
pub async fn restore_latest(
    bus: &Bus,
    config: &ReplicationConfig,
    target: &Path,
) -> Result<Option<StreamSeq>, ReplicationError> {
    let store = ensure_bucket(bus, config).await?;
    let info = match store.info(LATEST_OBJECT).await {
        Ok(info) => info,
        Err(error) => {
            tracing::info!(%error, "no snapshot available to restore");
            return Ok(None);
        }
    };
    let sequence = sequence_from_metadata(&info.metadata);

    let mut object = store.get(LATEST_OBJECT).await.map_err(bus_err)?;
    let mut file = tokio::fs::File::create(target).await?;
    tokio::io::copy(&mut object, &mut file).await?;
    file.sync_all().await?;
    for suffix in ["-wal", "-shm"] {
        let mut side = target.as_os_str().to_os_string();
        side.push(suffix);
        let _ = tokio::fs::remove_file(&side).await;
    }

    tracing::info!(target = %target.display(), %sequence, "restored latest snapshot");
    Ok(Some(sequence))
}

/// Captures and serves snapshots for one database.
pub struct Snapshotter {
    store: ObjectStore,
    pool: SqlitePool,
    latest_seq: Arc<AtomicU64>,
    guard: tokio::sync::Mutex<()>,
}

impl Snapshotter {
    /// Opens (creating if necessary) the snapshot bucket.
    ///
    /// `latest_seq` is the subscriber's acknowledged-sequence handle; it is
    /// read under an atomic load at capture time.
    pub async fn open(
        bus: &Bus,
        config: &ReplicationConfig,
        pool: SqlitePool,
        latest_seq: Arc<AtomicU64>,
    ) -> Result<Self, ReplicationError> {
        let store = ensure_bucket(bus, config).await?;
        Ok(Self {
            store,
            pool,
            latest_seq,
            guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Takes one snapshot, returning the sequence recorded with it.
    ///
    /// One snapshot at a time per database: the advisory lock is required,
    /// not optional, because the tombstone dance below would lose the
    /// previous snapshot if two captures raced. A failed attempt restores
    /// the previous `latest` from its tombstone.
    pub async fn take_snapshot(&self) -> Result<StreamSeq, ReplicationError> {
        let _guard = self.guard.lock().await;
        let sequence = StreamSeq::new(self.latest_seq.load(Ordering::Acquire));

        let tombstone = format!("bkp_{}", nanos_now());
        let preserved = match self
            .store
            .update_metadata(
                LATEST_OBJECT,
                ObjectMetadata {
                    name: tombstone.clone(),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(%error, "no previous snapshot to preserve");
                false
            }
        };

        let result = self.write_latest(sequence).await;
        if preserved {
            match &result {
                Ok(_) => {
                    if let Err(error) = self.store.delete(&tombstone).await {
                        tracing::warn!(%error, tombstone, "failed to delete snapshot tombstone");
                    }
                }
                Err(_) => {
                    let restore = self
                        .store
                        .update_metadata(
                            &tombstone,
                            ObjectMetadata {
                                name: LATEST_OBJECT.to_string(),
                                ..Default::default()
                            },
                        )
                        .await;
                    if let Err(error) = restore {
                        tracing::error!(%error, tombstone, "failed to restore previous snapshot");
                    }
                }
            }
        }

        result.map(|_| sequence)
    }

    /// The latest snapshot's sequence and payload, for the admin surface.
    pub async fn latest(&self) -> Result<(StreamSeq, Vec<u8>), ReplicationError> {
        let info = self
            .store
            .info(LATEST_OBJECT)
            .await
            .map_err(|e| ReplicationError::Snapshot(format!("no latest snapshot: {e}")))?;
        let sequence = sequence_from_metadata(&info.metadata);

        let mut object = self.store.get(LATEST_OBJECT).await.map_err(bus_err)?;
        let mut payload = Vec::with_capacity(info.size as usize);
        object.read_to_end(&mut payload).await?;
        Ok((sequence, payload))
    }

    /// Snapshots on a timer until shutdown.
    pub fn spawn_timer(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let snapshotter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => match snapshotter.take_snapshot().await {
                        Ok(sequence) => tracing::info!(%sequence, "snapshot taken"),
                        Err(error) => tracing::error!(%error, "failed to take snapshot"),
                    }
                }
            }
        })
    }

    async fn write_latest(&self, sequence: StreamSeq) -> Result<(), ReplicationError> {
        // VACUUM INTO produces a consistent single-file image even under
        // WAL, without holding the writer lock for the upload.
        let staging = tempfile::tempdir()?;
        let image = staging.path().join("snapshot.db");
        let vacuum = format!("VACUUM INTO '{}'", image.display());
        sqlx::query(&vacuum).execute(&self.pool).await?;

        let mut file = tokio::fs::File::open(&image).await?;
        let mut metadata = ObjectMetadata {
            name: LATEST_OBJECT.to_string(),
            ..Default::default()
        };
        metadata
            .metadata
            .insert(SEQUENCE_METADATA_KEY.to_string(), sequence.to_string());

        let info = self.store.put(metadata, &mut file).await.map_err(bus_err)?;
        tracing::info!(
            bucket = %info.bucket,
            name = %info.name,
            size = info.size,
            "snapshot stored"
        );
        Ok(())
    }
}

async fn ensure_bucket(bus: &Bus, config: &ReplicationConfig) -> Result<ObjectStore, ReplicationError> {
    let bucket = bucket_name(&config.stream);
    let bucket_config = async_nats::jetstream::object_store::Config {
        bucket: bucket.clone(),
        storage: StorageType::File,
        num_replicas: config.replicas,
        ..Default::default()
    };
    match bus.context().create_object_store(bucket_config).await {
        Ok(store) => Ok(store),
        Err(_) => bus.context().get_object_store(&bucket).await.map_err(bus_err),
    }
}

fn sequence_from_metadata(metadata: &std::collections::HashMap<String, String>) -> StreamSeq {
    metadata
        .get(SEQUENCE_METADATA_KEY)
        .and_then(|seq| seq.parse::<u64>().ok())
        .map(StreamSeq::new)
        .unwrap_or_default()
}

fn nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

//! Changeset publisher.
//!
//! Serialises committed changesets and submits them to the stream's
//! subject, returning the sequence the durable log assigned. The publisher
//! is invoked inline on the committing connection through the
//! [`ChangesetPublisher`] bridge, so a publish failure gates the local
//! commit.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;

use quill_cdc::{block_on_bridge, Changeset, ChangesetPublisher};
use quill_types::{ProcessId, PublishError, StreamSeq};

use crate::error::{bus_err, ReplicationError};
use crate::{Bus, Outbox, ReplicationConfig};

/// Publishes changesets to the replication stream.
pub struct CdcPublisher {
    context: jetstream::Context,
    subject: String,
    timeout: Duration,
    process_id: ProcessId,
    runtime: tokio::runtime::Handle,
    outbox: Option<Arc<Outbox>>,
}

impl CdcPublisher {
    /// Creates the publisher and ensures the replication stream exists.
    ///
    /// Stream settings: file storage, configured replica count and max age,
    /// discard-oldest, limits-based retention. A create-or-update failure
    /// is fatal against a single server; on a clustered bus it is logged
    /// and startup continues with whatever configuration the cluster
    /// already holds.
    pub async fn open(
        bus: &Bus,
        config: &ReplicationConfig,
        process_id: ProcessId,
    ) -> Result<Self, ReplicationError> {
        let stream_config = jetstream::stream::Config {
            name: config.stream.clone(),
            subjects: vec![config.stream.clone()],
            num_replicas: config.replicas,
            storage: jetstream::stream::StorageType::File,
            max_age: config.max_age,
            discard: jetstream::stream::DiscardPolicy::Old,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };
        match tokio::time::timeout(
            config.publish_timeout,
            bus.context().get_or_create_stream(stream_config),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                if bus.is_clustered() {
                    tracing::warn!(%error, stream = %config.stream, "failed to create or update stream");
                } else {
                    return Err(bus_err(error));
                }
            }
            Err(_) => {
                return Err(ReplicationError::Bus(format!(
                    "timed out creating stream {}",
                    config.stream
                )))
            }
        }

        Ok(Self {
            context: bus.context().clone(),
            subject: config.stream.clone(),
            timeout: config.publish_timeout,
            process_id,
            runtime: tokio::runtime::Handle::current(),
            outbox: None,
        })
    }

    /// Routes committed changesets through the on-disk outbox instead of
    /// blocking commits on the bus (asynchronous replication).
    pub fn with_outbox(mut self, outbox: Arc<Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Publishes one changeset, waiting up to the configured timeout for a
    /// durable ack.
    pub async fn publish(&self, mut changeset: Changeset) -> Result<StreamSeq, PublishError> {
        changeset.process_id = self.process_id;
        let payload = changeset
            .encode()
            .map_err(|e| PublishError::Encode(e.to_string()))?;

        let ack = tokio::time::timeout(self.timeout, async {
            let published = self
                .context
                .publish(self.subject.clone(), payload.into())
                .await
                .map_err(|e| PublishError::Bus(e.to_string()))?;
            published.await.map_err(|e| PublishError::Bus(e.to_string()))
        })
        .await
        .map_err(|_| PublishError::Timeout)??;

        tracing::info!(stream = %ack.stream, seq = ack.sequence, "published CDC message");
        Ok(StreamSeq::new(ack.sequence))
    }
}

impl ChangesetPublisher for CdcPublisher {
    fn publish_blocking(&self, changeset: Changeset) -> Result<Option<StreamSeq>, PublishError> {
        if let Some(outbox) = &self.outbox {
            let path = outbox.spool(&changeset)?;
            tracing::debug!(path = %path.display(), "changeset spooled for asynchronous publication");
            return Ok(None);
        }
        let seq = block_on_bridge(&self.runtime, self.publish(changeset))?;
        Ok(Some(seq))
    }
}

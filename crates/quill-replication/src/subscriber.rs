//! Durable changeset subscriber.
//!
//! One long-lived task per subscription pulls deliveries in stream order,
//! filters records originated by this process, and hands the rest to the
//! applier. Acks are explicit: a successful (or skipped) apply acks the
//! delivery, a failed apply withholds the ack so the log redelivers it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::consumer;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use quill_cdc::Changeset;
use quill_types::{ProcessId, StreamSeq};

use crate::error::{bus_err, ReplicationError};
use crate::{Applier, Bus, DeliverPolicy, ReplicationConfig};

/// How long `close` waits for the in-flight handler to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Durable consumer state exposed on the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationInfo {
    pub name: String,
    pub stream: String,
    pub delivered_consumer_seq: u64,
    pub delivered_stream_seq: u64,
    pub ack_floor_stream_seq: u64,
    pub num_ack_pending: usize,
    pub num_redelivered: usize,
    pub num_pending: u64,
}

/// Consumes the replication stream and replays remote changesets.
///
/// Lifecycle: created → consuming ⇄ paused → drained. Pausing stops new
/// pulls without touching the durable consumer; closing drains the
/// in-flight handler before returning.
pub struct CdcSubscriber {
    stream: jetstream::stream::Stream,
    node: String,
    latest_seq: Arc<AtomicU64>,
    paused: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CdcSubscriber {
    /// Creates (or resumes) the durable consumer named after this node and
    /// starts the consuming task.
    pub async fn start(
        bus: &Bus,
        config: &ReplicationConfig,
        node: &str,
        process_id: ProcessId,
        applier: Applier,
        policy: DeliverPolicy,
    ) -> Result<Self, ReplicationError> {
        let stream = bus
            .context()
            .get_stream(config.stream.clone())
            .await
            .map_err(bus_err)?;

        let consumer_config = consumer::pull::Config {
            durable_name: Some(node.to_string()),
            filter_subject: config.stream.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            deliver_policy: policy.to_consumer_policy(),
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(node, consumer_config)
            .await
            .map_err(bus_err)?;
        let mut messages = consumer.messages().await.map_err(bus_err)?;

        let latest_seq = Arc::new(AtomicU64::new(0));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let (paused, mut paused_rx) = watch::channel(false);

        let task_node = node.to_string();
        let task_seq = Arc::clone(&latest_seq);
        let task = tokio::spawn(async move {
            loop {
                if *paused_rx.borrow() {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = paused_rx.changed() => {}
                    }
                    continue;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    next = messages.next() => match next {
                        Some(Ok(message)) => {
                            handle_delivery(message, &task_node, process_id, &applier, &task_seq)
                                .await;
                        }
                        Some(Err(error)) => {
                            tracing::warn!(%error, node = %task_node, "consumer delivery error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        None => {
                            tracing::info!(node = %task_node, "consumer message stream closed");
                            break;
                        }
                    }
                }
            }
        });

        tracing::info!(node, stream = %config.stream, %policy, "CDC subscriber started");
        Ok(Self {
            stream,
            node: node.to_string(),
            latest_seq,
            paused,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Stops pulling new deliveries without tearing the consumer down.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    /// Resumes a paused subscription.
    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    /// The highest stream sequence this subscriber has acknowledged.
    pub fn latest_seq(&self) -> StreamSeq {
        StreamSeq::new(self.latest_seq.load(Ordering::Acquire))
    }

    /// Shared handle for the snapshotter's atomic reads.
    pub fn latest_seq_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.latest_seq)
    }

    /// Stops consuming and drains the in-flight handler.
    pub async fn close(&self) {
        tracing::info!(node = %self.node, "draining CDC subscriber");
        let _ = self.shutdown.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                tracing::warn!(node = %self.node, "subscriber drain timed out");
            }
        }
    }

    /// Consumer info for the admin surface: one entry when `name` is
    /// given, otherwise every durable consumer on the stream.
    pub async fn delivered_info(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<ReplicationInfo>, ReplicationError> {
        let mut names = Vec::new();
        match name {
            Some(name) => names.push(name.to_string()),
            None => {
                let mut consumer_names = self.stream.consumer_names();
                while let Some(name) = consumer_names.try_next().await.map_err(bus_err)? {
                    names.push(name);
                }
            }
        }

        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            let mut consumer: consumer::PullConsumer =
                self.stream.get_consumer(&name).await.map_err(bus_err)?;
            let info = consumer.info().await.map_err(bus_err)?;
            infos.push(ReplicationInfo {
                name: info.name.clone(),
                stream: info.stream_name.clone(),
                delivered_consumer_seq: info.delivered.consumer_sequence,
                delivered_stream_seq: info.delivered.stream_sequence,
                ack_floor_stream_seq: info.ack_floor.stream_sequence,
                num_ack_pending: info.num_ack_pending,
                num_redelivered: info.num_redelivered,
                num_pending: info.num_pending,
            });
        }
        Ok(infos)
    }

    /// Tears down a durable consumer by name.
    pub async fn remove_consumer(&self, name: &str) -> Result<(), ReplicationError> {
        self.stream.delete_consumer(name).await.map_err(bus_err)?;
        Ok(())
    }
}

async fn handle_delivery(
    message: jetstream::Message,
    node: &str,
    process_id: ProcessId,
    applier: &Applier,
    latest_seq: &AtomicU64,
) {
    let seq = match message.info() {
        Ok(info) => info.stream_sequence,
        Err(error) => {
            tracing::error!(%error, "failed to read delivery metadata");
            return;
        }
    };

    let mut changeset = match Changeset::decode(&message.payload) {
        Ok(changeset) => changeset,
        Err(error) => {
            // Poison pill: format corruption must not stall the stream.
            tracing::error!(%error, stream_seq = seq, "failed to decode CDC message; dropping");
            ack(&message, seq, latest_seq).await;
            return;
        }
    };
    changeset.stream_seq = Some(StreamSeq::new(seq));

    if is_self_originated(&changeset, node, process_id) {
        ack(&message, seq, latest_seq).await;
        return;
    }

    tracing::info!(
        node = %changeset.node,
        changes = changeset.len(),
        stream_seq = seq,
        "received CDC message"
    );
    match applier.apply(&changeset).await {
        Ok(_) => ack(&message, seq, latest_seq).await,
        Err(error) => {
            // No ack: the log redelivers until an operator intervenes.
            tracing::error!(%error, stream_seq = seq, "failed to apply CDC message");
        }
    }
}

async fn ack(message: &jetstream::Message, seq: u64, latest_seq: &AtomicU64) {
    if let Err(error) = message.ack().await {
        tracing::error!(%error, stream_seq = seq, "failed to ack message");
    }
    latest_seq.store(seq, Ordering::Release);
}

/// Only traffic from this exact process incarnation is suppressed: the
/// node name must match AND the process sentinel must match. Records from
/// a prior incarnation of the same node are applied, which is how a node
/// re-converges after a restart.
fn is_self_originated(changeset: &Changeset, node: &str, process_id: ProcessId) -> bool {
    changeset.node == node && changeset.process_id == process_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_cdc::Change;

    fn changeset(node: &str, process_id: i64) -> Changeset {
        let mut cs = Changeset::new(node, vec![Change::sql("SELECT 1")]);
        cs.process_id = ProcessId::new(process_id);
        cs
    }

    #[test]
    fn suppresses_only_this_process() {
        let local = ProcessId::new(100);
        assert!(is_self_originated(&changeset("a", 100), "a", local));
        // Same node, earlier incarnation: applied.
        assert!(!is_self_originated(&changeset("a", 50), "a", local));
        // Different node, same sentinel: applied.
        assert!(!is_self_originated(&changeset("b", 100), "a", local));
    }
}

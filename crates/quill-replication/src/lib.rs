//! quill-replication: the durable fan-out between Quill nodes.
//!
//! Committed changesets leave a node through the [`CdcPublisher`], travel
//! through a NATS JetStream stream, and arrive at every peer's
//! [`CdcSubscriber`], which filters self-originated records and replays the
//! rest through the [`Applier`] on a dedicated hookless connection. The
//! [`Snapshotter`] periodically captures a consistent image of the database
//! file keyed by stream sequence so restarted or newly added nodes can
//! catch up without replaying the whole stream.

mod applier;
mod bus;
mod config;
mod error;
mod interceptor;
mod outbox;
mod policy;
mod publisher;
mod snapshot;
mod subscriber;

pub use applier::{Applier, ApplyOutcome};
pub use bus::Bus;
pub use config::ReplicationConfig;
pub use error::ReplicationError;
pub use interceptor::{ChangesetInterceptor, InterceptorRules, RuleInterceptor};
pub use outbox::Outbox;
pub use policy::DeliverPolicy;
pub use publisher::CdcPublisher;
pub use snapshot::{bucket_name, resume_policy, restore_latest, Snapshotter, SEQUENCE_METADATA_KEY};
pub use subscriber::{CdcSubscriber, ReplicationInfo};

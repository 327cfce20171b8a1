//! Shared message bus connection.

use async_nats::jetstream;

use crate::error::{bus_err, ReplicationError};

/// One NATS connection shared by a database's publisher, subscriber and
/// snapshotter.
#[derive(Debug, Clone)]
pub struct Bus {
    client: async_nats::Client,
    context: jetstream::Context,
}

impl Bus {
    /// Connects to the message bus.
    pub async fn connect(url: &str) -> Result<Self, ReplicationError> {
        let client = async_nats::connect(url).await.map_err(bus_err)?;
        let context = jetstream::new(client.clone());
        tracing::info!(url, "connected to message bus");
        Ok(Self { client, context })
    }

    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }

    /// Returns true when the server advertises cluster peers.
    ///
    /// On a clustered bus a stream create-or-update failure is survivable
    /// (another node may have created it with different settings); on a
    /// single server it is fatal.
    pub fn is_clustered(&self) -> bool {
        !self.client.server_info().connect_urls.is_empty()
    }
}

//! Node-to-node transport seam.
//!
//! The cluster logic talks to peers through [`PeerConnector`] and
//! [`PeerLink`]. Wire framing belongs to the transport; the in-process
//! [`LocalPeerConnector`] links registries living in the same process.

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::core::client::{ClientContext, Confirmation, ServerEvent};
use crate::core::error::BrokerError;
use crate::core::message::MessageId;
use crate::core::storage::StorageRegistry;
use crate::core::subscriber::SubscriptionOptions;

use super::stats::{ServerIdentity, StatsBatch};

#[async_trait]
pub trait PeerLink: Send + Sync + Debug {
    fn address(&self) -> &str;

    /// Exchanges identities; returns the peer's.
    async fn server_activity(&self, local: &ServerIdentity) -> Result<ServerIdentity, BrokerError>;

    async fn send_stats(&self, from: &ServerIdentity, batch: StatsBatch) -> Result<(), BrokerError>;

    /// Subscribes on the peer as `user`; the receiver yields the peer's
    /// events for that subscription.
    async fn subscribe(
        &self,
        user: &str,
        queue: &str,
        options: SubscriptionOptions,
    ) -> Result<flume::Receiver<ServerEvent>, BrokerError>;

    /// Answers a delivery received through [`PeerLink::subscribe`].
    async fn confirm(
        &self,
        message_id: MessageId,
        confirmation: Confirmation,
    ) -> Result<(), BrokerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync + Debug {
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerLink>, BrokerError>;
}

/// Connects to registries registered in this process under an address.
#[derive(Debug, Default)]
pub struct LocalPeerConnector {
    nodes: DashMap<String, Weak<StorageRegistry>>,
}

impl LocalPeerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, registry: &Arc<StorageRegistry>) {
        self.nodes.insert(address.into(), Arc::downgrade(registry));
    }

    pub fn unregister(&self, address: &str) {
        self.nodes.remove(address);
    }
}

#[async_trait]
impl PeerConnector for LocalPeerConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerLink>, BrokerError> {
        let target = self
            .nodes
            .get(address)
            .map(|e| e.value().clone())
            .ok_or_else(|| BrokerError::Peer(format!("no node at {address}")))?;
        Ok(Arc::new(LocalPeerLink {
            address: address.to_string(),
            target,
            session: Mutex::new(None),
        }))
    }
}

#[derive(Debug)]
struct LocalPeerLink {
    address: String,
    target: Weak<StorageRegistry>,
    /// Internal client on the peer, created by `subscribe`.
    session: Mutex<Option<Arc<ClientContext>>>,
}

impl LocalPeerLink {
    fn registry(&self) -> Result<Arc<StorageRegistry>, BrokerError> {
        self.target
            .upgrade()
            .ok_or_else(|| BrokerError::Peer(format!("node at {} is gone", self.address)))
    }
}

#[async_trait]
impl PeerLink for LocalPeerLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn server_activity(&self, local: &ServerIdentity) -> Result<ServerIdentity, BrokerError> {
        let registry = self.registry()?;
        let cluster = registry
            .cluster()
            .ok_or_else(|| BrokerError::Peer(format!("node at {} is not clustered", self.address)))?;
        Ok(cluster.handle_activity(local.clone()))
    }

    async fn send_stats(&self, from: &ServerIdentity, batch: StatsBatch) -> Result<(), BrokerError> {
        let registry = self.registry()?;
        let cluster = registry
            .cluster()
            .ok_or_else(|| BrokerError::Peer(format!("node at {} is not clustered", self.address)))?;
        cluster.handle_stats(from, batch);
        Ok(())
    }

    async fn subscribe(
        &self,
        user: &str,
        queue: &str,
        options: SubscriptionOptions,
    ) -> Result<flume::Receiver<ServerEvent>, BrokerError> {
        let registry = self.registry()?;
        let account = registry
            .user(user)
            .ok_or_else(|| BrokerError::UserNotFound(user.to_string()))?;
        let (ctx, events) = registry.connect_client(Some(account));
        if let Err(err) = registry.subscribe(&ctx, queue, options) {
            registry.disconnect_client(ctx.id()).await;
            return Err(err);
        }
        let previous = self.session.lock().replace(ctx);
        if let Some(previous) = previous {
            registry.disconnect_client(previous.id()).await;
        }
        Ok(events)
    }

    async fn confirm(
        &self,
        message_id: MessageId,
        confirmation: Confirmation,
    ) -> Result<(), BrokerError> {
        let session = self.session.lock().clone();
        let ctx = session.ok_or(BrokerError::Disconnected)?;
        if !ctx.confirm(message_id, confirmation) {
            debug!(
                target: "relaymq::cluster",
                peer = %self.address,
                id = message_id,
                "late confirmation ignored by peer"
            );
        }
        Ok(())
    }

    async fn close(&self) {
        let session = self.session.lock().take();
        if let (Some(ctx), Some(registry)) = (session, self.target.upgrade()) {
            registry.disconnect_client(ctx.id()).await;
        }
    }
}

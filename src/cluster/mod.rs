//! Cluster coordination.
//!
//! Nodes discover each other from the configured peer list, exchange per-queue
//! activity periodically, and steer idle subscribers toward peers that hold
//! traffic for the same queue (hint, redirect or proxy).

pub mod peer;
pub mod proxy;
pub mod stats;
pub mod strategy;

pub use peer::{LocalPeerConnector, PeerConnector, PeerLink};
pub use stats::{
    ActiveQueueStat, ClusterServer, PeerQueueStat, QueueStat, ServerId, ServerIdentity, StatsBatch,
};

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ClusterSettings;
use crate::core::client::ServerEvent;
use crate::core::error::BrokerError;
use crate::core::storage::StorageRegistry;
use crate::core::subscriber::{ClusterStrategy, Subscription};

#[derive(Debug)]
pub struct ClusterCoordinator {
    registry: Weak<StorageRegistry>,
    identity: ServerIdentity,
    settings: ClusterSettings,
    connector: Arc<dyn PeerConnector>,
    servers: DashMap<ServerId, Arc<ClusterServer>>,
}

impl ClusterCoordinator {
    /// Creates the coordinator for `registry` from its cluster settings and
    /// attaches it. Fails when the registry is not configured for a cluster.
    pub fn attach(
        registry: &Arc<StorageRegistry>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>, BrokerError> {
        let settings = registry
            .settings()
            .cluster
            .clone()
            .ok_or_else(|| BrokerError::Internal("cluster is not configured".to_string()))?;
        let cluster = Arc::new(Self {
            registry: Arc::downgrade(registry),
            identity: ServerIdentity {
                id: ServerId::generate(),
                address: settings.address.clone(),
            },
            settings,
            connector,
            servers: DashMap::new(),
        });
        registry.set_cluster(Arc::clone(&cluster))?;
        info!(
            target: "relaymq::cluster",
            server = %cluster.identity.id,
            address = %cluster.identity.address,
            peers = cluster.settings.peers.len(),
            "cluster coordinator attached"
        );
        Ok(cluster)
    }

    #[inline]
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn server(&self, id: &ServerId) -> Option<Arc<ClusterServer>> {
        self.servers.get(id).map(|e| Arc::clone(&*e))
    }

    pub fn server_by_address(&self, address: &str) -> Option<Arc<ClusterServer>> {
        self.servers
            .iter()
            .find(|e| e.value().identity().address == address)
            .map(|e| Arc::clone(e.value()))
    }

    pub fn servers(&self) -> Vec<Arc<ClusterServer>> {
        self.servers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn upsert_server(&self, identity: ServerIdentity) -> Arc<ClusterServer> {
        use dashmap::mapref::entry::Entry;
        match self.servers.entry(identity.id) {
            Entry::Occupied(slot) if slot.get().identity().address == identity.address => {
                Arc::clone(slot.get())
            }
            Entry::Occupied(mut slot) => {
                let server = Arc::new(ClusterServer::new(identity));
                slot.insert(Arc::clone(&server));
                server
            }
            Entry::Vacant(slot) => {
                debug!(
                    target: "relaymq::cluster",
                    server = %identity.id,
                    address = %identity.address,
                    "peer recorded"
                );
                Arc::clone(&slot.insert(Arc::new(ClusterServer::new(identity))))
            }
        }
    }

    /// `ServerActivity` from a peer: records it and answers with this node's
    /// identity.
    pub fn handle_activity(&self, remote: ServerIdentity) -> ServerIdentity {
        if remote.id != self.identity.id {
            self.upsert_server(remote);
        }
        self.identity.clone()
    }

    /// `ServerStats` from a peer.
    pub fn handle_stats(&self, from: &ServerIdentity, batch: StatsBatch) {
        if from.id == self.identity.id {
            return;
        }
        let server = self.upsert_server(from.clone());
        match batch {
            StatsBatch::Start => server.begin_stats(),
            StatsBatch::Chunk(stats) => server.apply_chunk(stats),
            StatsBatch::Finish => {
                let pruned = server.finish_stats();
                trace!(
                    target: "relaymq::cluster",
                    server = %from.id,
                    queues = server.queue_count(),
                    pruned,
                    "peer stats refreshed"
                );
            }
        }
    }

    /// Connects to every configured peer not linked yet. The node's own
    /// address is skipped, and so is any peer that turns out to be this node.
    pub async fn discover(&self) {
        for address in &self.settings.peers {
            if *address == self.identity.address {
                continue;
            }
            if self
                .server_by_address(address)
                .is_some_and(|s| s.link().is_some())
            {
                continue;
            }
            let link = match self.connector.connect(address).await {
                Ok(link) => link,
                Err(err) => {
                    debug!(target: "relaymq::cluster", peer = %address, error = %err, "peer unreachable");
                    continue;
                }
            };
            match link.server_activity(&self.identity).await {
                Ok(remote) if remote.id == self.identity.id => {
                    link.close().await;
                }
                Ok(remote) => {
                    let server = self.upsert_server(remote);
                    server.set_link(Some(link));
                    info!(
                        target: "relaymq::cluster",
                        server = %server.identity().id,
                        peer = %address,
                        "peer linked"
                    );
                }
                Err(err) => {
                    warn!(target: "relaymq::cluster", peer = %address, error = %err, "identity exchange failed");
                    link.close().await;
                }
            }
        }
    }

    /// Sends this node's queue activity to every linked peer as one batch.
    pub async fn broadcast_stats(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let stats = registry.queue_stats();
        for server in self.servers() {
            let Some(link) = server.link() else {
                continue;
            };
            if let Err(err) = self.send_batch(link.as_ref(), &stats).await {
                warn!(
                    target: "relaymq::cluster",
                    peer = %link.address(),
                    error = %err,
                    "stats exchange failed; dropping link"
                );
                server.set_link(None);
                link.close().await;
            }
        }
    }

    async fn send_batch(&self, link: &dyn PeerLink, stats: &[QueueStat]) -> Result<(), BrokerError> {
        link.send_stats(&self.identity, StatsBatch::Start).await?;
        for chunk in stats.chunks(self.settings.stats_batch_size.max(1)) {
            link.send_stats(&self.identity, StatsBatch::Chunk(chunk.to_vec()))
                .await?;
        }
        link.send_stats(&self.identity, StatsBatch::Finish).await
    }

    /// Fresh peer views of one queue.
    pub fn peer_stats(&self, user: &str, queue: &str) -> Vec<PeerQueueStat> {
        self.servers
            .iter()
            .filter_map(|e| {
                let server = e.value();
                let stat = server.stat(user, queue).filter(|s| !s.outdated)?;
                Some(PeerQueueStat {
                    server: server.identity().id,
                    address: server.identity().address.clone(),
                    length: stat.length,
                    subscriptions: stat.subscriptions,
                })
            })
            .collect()
    }

    /// Runs the subscription's strategy. Called by the shared timer once the
    /// subscription's queue has been empty for its idle threshold.
    pub async fn evaluate(&self, sub: &Arc<Subscription>) {
        let Some(queue) = sub.current_queue() else {
            return;
        };
        let Some(client) = sub.client() else {
            return;
        };
        let local_subscriptions = queue.subscription_count();
        let peers = self.peer_stats(sub.user().name(), sub.queue_name());

        match sub.options().strategy {
            ClusterStrategy::Wait => {}
            ClusterStrategy::Hint => {
                let servers = strategy::hint_candidates(queue.len(), local_subscriptions, &peers);
                if servers.is_empty() {
                    return;
                }
                debug!(
                    target: "relaymq::cluster",
                    client = %client.id(),
                    queue = %queue.name(),
                    candidates = servers.len(),
                    "sending cluster hint"
                );
                let _ = client.send(ServerEvent::ClusterHint {
                    queue: queue.name().to_string(),
                    servers,
                });
            }
            ClusterStrategy::Redirect => {
                let Some(target) = strategy::redirect_target(local_subscriptions, &peers) else {
                    return;
                };
                info!(
                    target: "relaymq::cluster",
                    client = %client.id(),
                    queue = %queue.name(),
                    peer = %target.address,
                    "redirecting subscriber"
                );
                let _ = client.send(ServerEvent::ClusterRedirect {
                    queue: queue.name().to_string(),
                    address: target.address,
                });
            }
            ClusterStrategy::Proxy => {
                if sub.has_proxy() {
                    return;
                }
                let Some(target) = strategy::redirect_target(local_subscriptions, &peers) else {
                    return;
                };
                match proxy::open(self.connector.as_ref(), &target.address, sub).await {
                    Ok(handle) => {
                        if sub.install_proxy(handle) {
                            info!(
                                target: "relaymq::cluster",
                                client = %client.id(),
                                queue = %queue.name(),
                                peer = %target.address,
                                "proxying subscription from peer"
                            );
                        }
                    }
                    Err(err) => warn!(
                        target: "relaymq::cluster",
                        peer = %target.address,
                        error = %err,
                        "opening proxy failed"
                    ),
                }
            }
        }
    }

    /// Discovery and stats loops until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut discovery = tokio::time::interval(self.settings.discovery_interval);
        let mut stats = tokio::time::interval(self.settings.stats_interval);
        discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = discovery.tick() => self.discover().await,
                _ = stats.tick() => self.broadcast_stats().await,
            }
        }
        for server in self.servers() {
            if let Some(link) = server.link() {
                server.set_link(None);
                link.close().await;
            }
        }
        debug!(target: "relaymq::cluster", "cluster loops stopped");
    }
}

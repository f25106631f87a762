//! Broker runtime.
//!
//! Owns the registry and the background loops around it: the shared
//! subscription timer, the memory monitor and, on clustered nodes, the
//! discovery and stats loops. Transports hand each connection to
//! [`crate::broker::handlers::handle`] with the runtime's registry.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterCoordinator, LocalPeerConnector, PeerConnector};
use crate::config::BrokerSettings;
use crate::core::error::BrokerError;
use crate::core::persistence::Persistence;
use crate::core::storage::StorageRegistry;
use crate::metrics;

#[derive(Debug)]
pub struct BrokerRuntime {
    registry: Arc<StorageRegistry>,
    cluster: Option<Arc<ClusterCoordinator>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerRuntime {
    /// Creates a registry from `settings`, restores persisted state and
    /// starts the background loops.
    pub async fn start(
        settings: BrokerSettings,
        persistence: Arc<dyn Persistence>,
        connector: Option<Arc<dyn PeerConnector>>,
    ) -> Result<Self, BrokerError> {
        let registry = StorageRegistry::new(settings, persistence);
        registry.restore().await?;
        Self::launch(registry, connector)
    }

    /// Starts the loops around an already restored registry. Clustered
    /// settings without a connector fall back to in-process links, which
    /// never reach a remote peer.
    pub fn launch(
        registry: Arc<StorageRegistry>,
        connector: Option<Arc<dyn PeerConnector>>,
    ) -> Result<Self, BrokerError> {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(3);

        let cluster = match registry.settings().cluster {
            Some(ref cluster) => {
                let connector = connector.unwrap_or_else(|| {
                    if !cluster.peers.is_empty() {
                        warn!(
                            target: "relaymq::engine",
                            peers = ?cluster.peers,
                            "clustering enabled without a peer connector; remote peers will not link"
                        );
                    }
                    Arc::new(LocalPeerConnector::new())
                });
                let cluster = ClusterCoordinator::attach(&registry, connector)?;
                tasks.push(tokio::spawn(
                    Arc::clone(&cluster).run(cancel.child_token()),
                ));
                Some(cluster)
            }
            None => None,
        };

        tasks.push(tokio::spawn(timer_loop(
            Arc::clone(&registry),
            cancel.child_token(),
        )));
        tasks.push(tokio::spawn(memory_loop(
            Arc::clone(&registry),
            cancel.child_token(),
        )));

        metrics::set_ready(true);
        info!(
            target: "relaymq::engine",
            clustered = cluster.is_some(),
            users = registry.users().len(),
            "broker started"
        );
        Ok(Self {
            registry,
            cluster,
            cancel,
            tasks,
        })
    }

    #[inline]
    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    #[inline]
    pub fn cluster(&self) -> Option<&Arc<ClusterCoordinator>> {
        self.cluster.as_ref()
    }

    /// Stops the loops, then every client and subscription.
    pub async fn shutdown(self) {
        metrics::set_ready(false);
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(target: "relaymq::engine", error = %err, "background task failed");
            }
        }
        self.registry.shutdown().await;
        info!(target: "relaymq::engine", "broker stopped");
    }
}

async fn timer_loop(registry: Arc<StorageRegistry>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(registry.settings().timer_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => registry.tick(Instant::now()).await,
        }
    }
    debug!(target: "relaymq::engine", "timer stopped");
}

async fn memory_loop(registry: Arc<StorageRegistry>, cancel: CancellationToken) {
    if registry.settings().memory_capacity == 0 {
        return;
    }
    let mut ticker = tokio::time::interval(registry.settings().memory_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pressure = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = registry.refresh_memory_pressure();
                if now != pressure {
                    info!(target: "relaymq::engine", under_pressure = now, "memory pressure changed");
                    pressure = now;
                }
            }
        }
    }
}

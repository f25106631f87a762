mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relaymq::broker::{handle, Command, HandlerContext, Response};
use relaymq::cluster::{ClusterCoordinator, LocalPeerConnector, PeerConnector, PeerLink};
use relaymq::core::client::{Confirmation, ServerEvent};
use relaymq::core::error::BrokerError;
use relaymq::core::persistence::MemoryPersistence;
use relaymq::core::queue::QueueOptions;
use relaymq::core::routing::SendRequest;
use relaymq::core::subscriber::{ClusterStrategy, SubscriptionOptions};
use relaymq::{BrokerRuntime, StorageRegistry};
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(2);
const IDLE: Duration = Duration::from_millis(50);

struct Node {
    registry: Arc<StorageRegistry>,
    cluster: Arc<ClusterCoordinator>,
}

fn node(connector: &Arc<LocalPeerConnector>, address: &str, peers: &[&str]) -> Node {
    node_via(connector, connector.clone(), address, peers)
}

/// A node reachable through `directory` that dials peers with `dialer`.
fn node_via(
    directory: &Arc<LocalPeerConnector>,
    dialer: Arc<dyn PeerConnector>,
    address: &str,
    peers: &[&str],
) -> Node {
    common::init_logging();
    let settings = common::fast_settings()
        .with_cluster(address, peers.iter().map(|p| p.to_string()).collect());
    let registry = StorageRegistry::new(settings, Arc::new(MemoryPersistence::new()));
    directory.register(address, &registry);
    let cluster = ClusterCoordinator::attach(&registry, dialer).unwrap();
    Node { registry, cluster }
}

/// Dials through a local directory, stalling every connect once `stalled`
/// is set.
#[derive(Debug)]
struct StallingConnector {
    inner: Arc<LocalPeerConnector>,
    stalled: AtomicBool,
}

#[async_trait]
impl PeerConnector for StallingConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerLink>, BrokerError> {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.inner.connect(address).await
    }
}

/// Two linked nodes; `alice/jobs` exists on both and holds `backlog`
/// messages on node "a".
async fn pair(backlog: usize) -> (Node, Node) {
    let connector = Arc::new(LocalPeerConnector::new());
    let a = node(&connector, "a", &["a", "b"]);
    let b = node(&connector, "b", &["a", "b"]);
    seed(&a, &b, backlog).await;
    (a, b)
}

async fn seed(a: &Node, b: &Node, backlog: usize) {
    for n in [a, b] {
        let alice = n.registry.add_user("alice", "pw", false).await.unwrap();
        n.registry
            .add_queue(&alice, "jobs", QueueOptions::default())
            .await
            .unwrap();
    }
    let alice = a.registry.user("alice").unwrap();
    let (ctx, _events) = a.registry.connect_client(Some(alice));
    for i in 0..backlog {
        let request = SendRequest::new("jobs", format!("job-{i}"), WAIT);
        a.registry.routing().send(&ctx, request).await.unwrap();
    }

    a.cluster.discover().await;
    b.cluster.discover().await;
    a.cluster.broadcast_stats().await;
}

fn idle_subscriber(
    n: &Node,
    strategy: ClusterStrategy,
    confirm: bool,
) -> (
    Arc<relaymq::core::client::ClientContext>,
    flume::Receiver<ServerEvent>,
) {
    let alice = n.registry.user("alice").unwrap();
    let (ctx, events) = n.registry.connect_client(Some(alice));
    let options = SubscriptionOptions::new(WAIT, IDLE)
        .with_confirm(confirm)
        .with_strategy(strategy);
    n.registry.subscribe(&ctx, "jobs", options).unwrap();
    (ctx, events)
}

#[tokio::test]
async fn discovery_links_peers_and_skips_self() {
    let (a, b) = pair(0).await;
    assert_eq!(a.cluster.servers().len(), 1);
    assert_eq!(b.cluster.servers().len(), 1);
    let peer = a.cluster.server_by_address("b").expect("b known to a");
    assert_eq!(peer.identity().id, b.cluster.identity().id);
    assert!(peer.link().is_some());
}

#[tokio::test]
async fn stats_batches_replace_the_previous_view() {
    let (a, b) = pair(3).await;
    let stats = b.cluster.peer_stats("ALICE", "jobs");
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].address, "a");
    assert_eq!(stats[0].length, 3);
    assert_eq!(stats[0].subscriptions, 0);

    let alice = a.registry.user("alice").unwrap();
    a.registry.delete_queue(&alice, "jobs").await.unwrap();
    a.cluster.broadcast_stats().await;
    assert!(b.cluster.peer_stats("alice", "jobs").is_empty());
}

#[tokio::test]
async fn hint_lists_busier_peers() {
    let (_a, b) = pair(3).await;
    let (_ctx, events) = idle_subscriber(&b, ClusterStrategy::Hint, false);

    tokio::time::sleep(IDLE * 2).await;
    b.registry.tick(Instant::now()).await;

    match common::next_event(&events, WAIT).await {
        Some(ServerEvent::ClusterHint { queue, servers }) => {
            assert_eq!(queue, "jobs");
            assert_eq!(servers.len(), 1);
            assert_eq!(servers[0].address, "a");
            assert_eq!(servers[0].length, 3);
        }
        other => panic!("expected hint, got {other:?}"),
    }

    // Rate limited: a second tick right away does nothing.
    b.registry.tick(Instant::now()).await;
    assert!(common::next_event(&events, Duration::from_millis(30)).await.is_none());
    b.registry.shutdown().await;
}

#[tokio::test]
async fn redirect_names_least_subscribed_peer() {
    let (_a, b) = pair(1).await;
    let (_ctx, events) = idle_subscriber(&b, ClusterStrategy::Redirect, false);

    tokio::time::sleep(IDLE * 2).await;
    b.registry.tick(Instant::now()).await;

    match common::next_event(&events, WAIT).await {
        Some(ServerEvent::ClusterRedirect { queue, address }) => {
            assert_eq!(queue, "jobs");
            assert_eq!(address, "a");
        }
        other => panic!("expected redirect, got {other:?}"),
    }
    b.registry.shutdown().await;
}

#[tokio::test]
async fn wait_strategy_never_steers() {
    let (_a, b) = pair(3).await;
    let (_ctx, events) = idle_subscriber(&b, ClusterStrategy::Wait, false);
    tokio::time::sleep(IDLE * 2).await;
    b.registry.tick(Instant::now()).await;
    assert!(common::next_event(&events, Duration::from_millis(50)).await.is_none());
    b.registry.shutdown().await;
}

#[tokio::test]
async fn proxy_forwards_peer_messages_and_confirmations() {
    let (a, b) = pair(2).await;
    let (ctx, events) = idle_subscriber(&b, ClusterStrategy::Proxy, true);
    let sub = ctx.subscription("jobs").unwrap();

    tokio::time::sleep(IDLE * 2).await;
    b.registry.tick(Instant::now()).await;
    assert_eq!(sub.proxy_address().as_deref(), Some("a"));

    for expected in ["job-0", "job-1"] {
        let delivery = common::next_delivery(&events, WAIT).await.expect("proxied delivery");
        assert_eq!(delivery.payload, Bytes::from(expected));
        assert!(delivery.confirm);
        assert!(ctx.confirm(delivery.message_id, Confirmation::success()));
    }

    let remote = a.registry.user("alice").unwrap().queue("jobs").unwrap();
    assert!(common::eventually(WAIT, || remote.is_empty()).await);

    // A local delivery supersedes the proxy.
    let alice = b.registry.user("alice").unwrap();
    let (sender, _s) = b.registry.connect_client(Some(alice));
    b.registry
        .routing()
        .send(&sender, SendRequest::new("jobs", "local", WAIT))
        .await
        .unwrap();
    let local = common::next_delivery(&events, WAIT).await.expect("local delivery");
    assert_eq!(local.payload, Bytes::from_static(b"local"));
    assert!(ctx.confirm(local.message_id, Confirmation::success()));
    assert!(common::eventually(WAIT, || !sub.has_proxy()).await);

    b.registry.shutdown().await;
    a.registry.shutdown().await;
}

#[tokio::test]
async fn stalled_proxy_connect_does_not_delay_other_subscriptions() {
    let directory = Arc::new(LocalPeerConnector::new());
    let dialer = Arc::new(StallingConnector {
        inner: directory.clone(),
        stalled: AtomicBool::new(false),
    });
    let a = node(&directory, "a", &["a", "b"]);
    let b = node_via(&directory, dialer.clone(), "b", &["a", "b"]);
    seed(&a, &b, 3).await;

    let (_proxied, _proxied_events) = idle_subscriber(&b, ClusterStrategy::Proxy, false);
    let (_hinted, hint_events) = idle_subscriber(&b, ClusterStrategy::Hint, false);
    tokio::time::sleep(IDLE * 2).await;

    dialer.stalled.store(true, Ordering::SeqCst);
    let ticking = {
        let registry = b.registry.clone();
        tokio::spawn(async move { registry.tick(Instant::now()).await })
    };
    match common::next_event(&hint_events, Duration::from_millis(500)).await {
        Some(ServerEvent::ClusterHint { servers, .. }) => assert_eq!(servers[0].address, "a"),
        other => panic!("expected hint while proxy connect stalls, got {other:?}"),
    }
    ticking.abort();
    b.registry.shutdown().await;
}

#[tokio::test]
async fn server_activity_requires_cluster_admin() {
    let connector = Arc::new(LocalPeerConnector::new());
    let b = node(&connector, "b", &[]);
    let admin = b.registry.add_user("root", "pw", true).await.unwrap();
    let plain = b.registry.add_user("alice", "pw", false).await.unwrap();

    let (admin_ctx, _a) = b.registry.connect_client(Some(admin));
    let (plain_ctx, _p) = b.registry.connect_client(Some(plain));
    let remote = relaymq::cluster::ServerIdentity {
        id: relaymq::cluster::ServerId::generate(),
        address: "c".into(),
    };

    let denied = handle(
        &HandlerContext::new(b.registry.clone(), plain_ctx),
        Command::ServerActivity {
            identity: remote.clone(),
        },
    )
    .await;
    assert!(denied.is_err());

    let answer = handle(
        &HandlerContext::new(b.registry.clone(), admin_ctx),
        Command::ServerActivity { identity: remote },
    )
    .await
    .unwrap();
    assert_eq!(answer, Response::Server(b.cluster.identity().clone()));
    assert!(b.cluster.server_by_address("c").is_some());
}

#[tokio::test]
async fn runtimes_exchange_stats_in_the_background() {
    common::init_logging();
    let connector = Arc::new(LocalPeerConnector::new());
    let mut runtimes = Vec::new();
    for (address, peer) in [("a", "b"), ("b", "a")] {
        let mut settings = common::fast_settings().with_cluster(address, vec![peer.to_string()]);
        if let Some(cluster) = settings.cluster.as_mut() {
            cluster.discovery_interval = Duration::from_millis(20);
            cluster.stats_interval = Duration::from_millis(20);
        }
        let registry = StorageRegistry::new(settings, Arc::new(MemoryPersistence::new()));
        connector.register(address, &registry);
        let alice = registry.add_user("alice", "pw", false).await.unwrap();
        registry
            .add_queue(&alice, "jobs", QueueOptions::default())
            .await
            .unwrap();
        runtimes.push(BrokerRuntime::launch(registry, Some(connector.clone())).unwrap());
    }

    let b_cluster = runtimes[1].cluster().unwrap().clone();
    assert!(
        common::eventually(WAIT, || b_cluster.peer_stats("alice", "jobs").len() == 1).await
    );
    for runtime in runtimes {
        runtime.shutdown().await;
    }
}

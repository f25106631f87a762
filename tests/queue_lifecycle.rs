mod common;

use std::time::Duration;

use bytes::Bytes;
use relaymq::core::error::BrokerError;
use relaymq::core::queue::{LimitStrategy, QueueLimit, QueueOptions, QueueStatus};
use relaymq::core::routing::SendRequest;
use relaymq::core::subscriber::{SubscriptionOptions, WorkerState};

const WAIT: Duration = Duration::from_secs(2);

fn exchange() -> QueueOptions {
    QueueOptions {
        exchange: true,
        ..Default::default()
    }
}

fn send(queue: &str, payload: &'static str) -> SendRequest {
    SendRequest::new(queue, payload, Duration::from_millis(100))
}

#[tokio::test]
async fn subscription_follows_a_recreated_queue() {
    let registry = common::registry();
    let alice = common::user(&registry, "alice").await;
    let original = registry
        .add_queue(&alice, "jobs", QueueOptions::default())
        .await
        .unwrap();
    let (ctx, events) = common::client(&registry, &alice);
    let sub = registry
        .subscribe(&ctx, "jobs", SubscriptionOptions::new(WAIT, WAIT))
        .unwrap();

    registry.delete_queue(&alice, "jobs").await.unwrap();
    assert_eq!(original.status(), QueueStatus::Deleted);
    assert!(common::eventually(WAIT, || sub.state() == WorkerState::Searching).await);
    assert!(sub.current_queue().is_none());

    let successor = registry
        .add_queue(&alice, "Jobs", QueueOptions::default())
        .await
        .unwrap();
    assert!(common::eventually(WAIT, || successor.subscription_count() == 1).await);

    registry.routing().send(&ctx, send("jobs", "after")).await.unwrap();
    let delivery = common::next_delivery(&events, WAIT).await.expect("delivery");
    assert_eq!(delivery.payload, Bytes::from_static(b"after"));
    assert_eq!(original.subscription_count(), 0);
    registry.shutdown().await;
}

#[tokio::test]
async fn deleted_queue_rejects_sends_through_cached_handle() {
    let registry = common::registry();
    let alice = common::user(&registry, "alice").await;
    registry
        .add_queue(&alice, "jobs", QueueOptions::default())
        .await
        .unwrap();
    let (ctx, _events) = common::client(&registry, &alice);
    registry.routing().send(&ctx, send("jobs", "a")).await.unwrap();

    registry.delete_queue(&alice, "jobs").await.unwrap();
    let err = registry.routing().send(&ctx, send("jobs", "b")).await.unwrap_err();
    assert!(matches!(err, BrokerError::QueueNotFound(_)));
}

#[tokio::test]
async fn bindings_stay_symmetric_through_deletes() {
    let registry = common::registry();
    let alice = common::user(&registry, "alice").await;
    registry.add_queue(&alice, "x", exchange()).await.unwrap();
    let a = registry.add_queue(&alice, "a", QueueOptions::default()).await.unwrap();
    let b = registry.add_queue(&alice, "b", QueueOptions::default()).await.unwrap();
    registry
        .add_binding(&alice, "x", "a", false, Some("^orders\\."))
        .await
        .unwrap();
    registry.add_binding(&alice, "x", "b", false, None).await.unwrap();

    let dup = registry.add_binding(&alice, "X", "A", false, None).await.unwrap_err();
    assert!(matches!(dup, BrokerError::BindingAlreadyExists { .. }));

    let (ctx, _events) = common::client(&registry, &alice);
    let routing = registry.routing();
    routing
        .send(&ctx, send("x", "o").with_routing_key("orders.7"))
        .await
        .unwrap();
    routing
        .send(&ctx, send("x", "m").with_routing_key("misc"))
        .await
        .unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 2);

    registry.delete_queue(&alice, "a").await.unwrap();
    assert!(registry.get_binding(&alice, "x", "a").is_err());
    assert!(alice.bindings().by_queue("a").is_empty());
    assert_eq!(alice.bindings().by_exchange("x").len(), 1);

    registry.delete_queue(&alice, "x").await.unwrap();
    assert!(alice.bindings().by_queue("b").is_empty());
    assert!(alice.bindings().is_empty());
}

#[tokio::test]
async fn exchange_without_matching_binding_cannot_route() {
    let registry = common::registry();
    let alice = common::user(&registry, "alice").await;
    registry.add_queue(&alice, "x", exchange()).await.unwrap();
    registry.add_queue(&alice, "a", QueueOptions::default()).await.unwrap();
    registry
        .add_binding(&alice, "x", "a", false, Some("^eu$"))
        .await
        .unwrap();
    let (ctx, _events) = common::client(&registry, &alice);

    let err = registry
        .routing()
        .send(&ctx, send("x", "p").with_routing_key("us"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ExchangeCannotRouteMessage(_)));

    let err = registry
        .subscribe(&ctx, "x", SubscriptionOptions::new(WAIT, WAIT))
        .unwrap_err();
    assert!(matches!(err, BrokerError::QueueIsExchange(_)));
}

#[tokio::test]
async fn queue_definitions_are_validated() {
    let registry = common::registry();
    let alice = common::user(&registry, "alice").await;

    let limited_exchange = QueueOptions {
        exchange: true,
        limit: Some(QueueLimit::length(5, LimitStrategy::Reject)),
        ..Default::default()
    };
    let err = registry.add_queue(&alice, "x", limited_exchange).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidQueue(_)));

    let zero = QueueOptions {
        limit: Some(QueueLimit::length(0, LimitStrategy::Reject)),
        ..Default::default()
    };
    assert!(registry.add_queue(&alice, "z", zero).await.is_err());
    assert!(registry.add_queue(&alice, " ", QueueOptions::default()).await.is_err());

    registry.add_queue(&alice, "x", exchange()).await.unwrap();
    registry.add_queue(&alice, "plain", QueueOptions::default()).await.unwrap();
    let err = registry
        .add_binding(&alice, "x", "plain", true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DurableBindingRequiresDurableQueues { .. }));
    let err = registry
        .add_binding(&alice, "plain", "x", false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotAnExchange(_)));
    let err = registry
        .add_binding(&alice, "x", "plain", false, Some("("))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidPattern { .. }));
}

#[tokio::test]
async fn clear_and_search() {
    let registry = common::registry();
    let alice = common::user(&registry, "alice").await;
    for name in ["orders-eu", "orders-us", "audit"] {
        registry
            .add_queue(&alice, name, QueueOptions::default())
            .await
            .unwrap();
    }
    let (ctx, _events) = common::client(&registry, &alice);
    for payload in ["1", "2", "3"] {
        registry.routing().send(&ctx, send("audit", payload)).await.unwrap();
    }

    assert_eq!(registry.clear_queue(&alice, "audit").await.unwrap(), 3);
    let info = registry.get_queue(&alice, "AUDIT").unwrap();
    assert_eq!(info.length, 0);
    assert_eq!(info.status, QueueStatus::Started);

    let found = registry.search_queues(&alice, Some("^ORDERS")).unwrap();
    let names: Vec<_> = found.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, ["orders-eu", "orders-us"]);
    assert_eq!(registry.search_queues(&alice, None).unwrap().len(), 3);
    assert!(registry.search_queues(&alice, Some("[")).is_err());
}

#[tokio::test]
async fn users_are_isolated_and_deletion_cascades() {
    let registry = common::registry();
    let alice = common::user(&registry, "alice").await;
    let bob = common::user(&registry, "bob").await;
    registry.add_queue(&alice, "shared", QueueOptions::default()).await.unwrap();
    registry.add_queue(&bob, "shared", QueueOptions::default()).await.unwrap();

    let (alice_ctx, _a) = common::client(&registry, &alice);
    registry.routing().send(&alice_ctx, send("shared", "a")).await.unwrap();
    assert_eq!(bob.queue("shared").unwrap().len(), 0);

    let dup = registry.add_user("ALICE", "pw", false).await.unwrap_err();
    assert!(matches!(dup, BrokerError::UserAlreadyExists(_)));

    let (bob_ctx, _b) = common::client(&registry, &bob);
    let bob_queue = bob.queue("shared").unwrap();
    registry.delete_user("bob").await.unwrap();
    assert!(registry.user("bob").is_none());
    assert!(!bob_ctx.is_connected());
    assert_eq!(bob_queue.status(), QueueStatus::Deleted);
    assert!(alice_ctx.is_connected());
    assert_eq!(registry.stats().queues, 1);
}

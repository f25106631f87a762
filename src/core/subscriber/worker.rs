use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::core::client::{ClientContext, Confirmation, Delivery, ServerEvent};
use crate::core::error::BrokerError;
use crate::core::message::Message;
use crate::core::queue::Queue;
use crate::core::storage::StorageRegistry;
use crate::metrics;

use super::subscription::{Subscription, WorkerState};

/// Delivery loop of one subscription. Ends on cancellation or when a
/// delivery fails; either way the subscription is unregistered on exit so
/// the client can subscribe to the queue again.
pub(crate) async fn run(sub: Arc<Subscription>, registry: Arc<StorageRegistry>) {
    let poll_interval = registry.settings().poll_interval;
    let search_interval = registry.settings().search_interval;
    debug!(
        target: "relaymq::subscriber",
        client = %sub.client_id(),
        queue = %sub.queue_name(),
        "delivery worker started"
    );

    loop {
        if sub.cancel_token().is_cancelled() {
            break;
        }

        let queue = match sub.current_queue() {
            Some(queue) if !queue.status().is_terminal() => queue,
            _ => {
                sub.detach();
                sub.set_state(WorkerState::Searching);
                match search_successor(&sub, search_interval).await {
                    Some(queue) => {
                        sub.attach(Arc::clone(&queue));
                        queue
                    }
                    None => break,
                }
            }
        };

        sub.set_state(WorkerState::Dequeuing);
        let message = tokio::select! {
            _ = sub.cancel_token().cancelled() => break,
            message = queue.try_dequeue(poll_interval) => message,
        };
        let Some(message) = message else {
            sub.set_state(WorkerState::Idle);
            continue;
        };

        let Some(client) = sub.client() else {
            registry.routing().redeliver(sub.user(), message);
            break;
        };
        if let Err(err) = deliver(&sub, &client, &registry, message).await {
            warn!(
                target: "relaymq::subscriber",
                client = %sub.client_id(),
                queue = %sub.queue_name(),
                error = %err,
                "delivery failed; ending subscription"
            );
            break;
        }
        sub.set_state(WorkerState::Idle);
    }

    sub.stop_proxy();
    sub.detach();
    sub.set_state(WorkerState::Stopped);
    registry.release_subscription(&sub);
    debug!(
        target: "relaymq::subscriber",
        client = %sub.client_id(),
        queue = %sub.queue_name(),
        "delivery worker stopped"
    );
}

/// Polls the owner's queue index until a started queue with the same name
/// appears. Returns `None` once cancelled.
async fn search_successor(sub: &Subscription, interval: Duration) -> Option<Arc<Queue>> {
    loop {
        let found = sub
            .user()
            .queue(sub.queue_name())
            .filter(|q| q.is_started() && !q.is_exchange());
        if let Some(queue) = found {
            info!(
                target: "relaymq::subscriber",
                client = %sub.client_id(),
                queue = %queue.name(),
                "subscription moved to recreated queue"
            );
            return Some(queue);
        }
        tokio::select! {
            _ = sub.cancel_token().cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn deliver(
    sub: &Subscription,
    client: &ClientContext,
    registry: &StorageRegistry,
    mut message: Message,
) -> Result<(), BrokerError> {
    sub.set_state(WorkerState::Delivering);

    if !message.is_payload_loaded() {
        match load_payload(registry, sub, &message).await {
            Ok(Some(payload)) => message.payload = Some(payload),
            Ok(None) => {
                warn!(
                    target: "relaymq::subscriber",
                    queue = %message.queue,
                    id = message.id,
                    "durable copy missing; dropping message"
                );
                return Ok(());
            }
            Err(err) => {
                registry.routing().redeliver(sub.user(), message);
                return Err(err);
            }
        }
    }

    let needs_confirmation = sub.options().confirm || message.request;
    let confirmation = needs_confirmation.then(|| client.expect_confirmation(message.id));
    message.delivered = true;
    let delivery = Delivery {
        message_id: message.id,
        queue: message.queue.clone(),
        routing_key: message.routing_key.clone(),
        payload: message.payload.clone().unwrap_or_default(),
        confirm: needs_confirmation,
        request: message.request,
    };

    if let Err(err) = client.send(ServerEvent::Deliver(delivery)) {
        client.forget_confirmation(message.id);
        registry.routing().redeliver(sub.user(), message);
        return Err(err);
    }
    // A locally sourced delivery supersedes any proxy to a peer.
    sub.stop_proxy();

    let outcome = match confirmation {
        None => Some(Confirmation::success()),
        Some(rx) => {
            sub.set_state(WorkerState::Confirming);
            tokio::select! {
                _ = sub.cancel_token().cancelled() => None,
                res = tokio::time::timeout(sub.options().confirm_timeout, rx) => res.ok().and_then(Result::ok),
            }
        }
    };

    match outcome {
        Some(confirmation) if confirmation.success => {
            complete(sub, registry, &message, confirmation.data).await;
        }
        _ => {
            client.forget_confirmation(message.id);
            debug!(
                target: "relaymq::subscriber",
                client = %sub.client_id(),
                id = message.id,
                "message not confirmed; redelivering"
            );
            registry.routing().redeliver(sub.user(), message);
        }
    }
    Ok(())
}

async fn load_payload(
    registry: &StorageRegistry,
    sub: &Subscription,
    message: &Message,
) -> Result<Option<Bytes>, BrokerError> {
    let record = registry
        .persistence()
        .load_message(sub.user().name(), &message.queue, message.id)
        .await?;
    Ok(record.map(|r| Bytes::from(r.payload)))
}

async fn complete(
    sub: &Subscription,
    registry: &StorageRegistry,
    message: &Message,
    reply: Option<Bytes>,
) {
    if message.persistence.is_persistent() {
        if let Err(err) = registry
            .persistence()
            .delete_message(sub.user().name(), &message.queue, message.id)
            .await
        {
            warn!(
                target: "relaymq::subscriber",
                queue = %message.queue,
                id = message.id,
                error = %err,
                "failed to delete durable copy of delivered message"
            );
        }
    }
    if message.request {
        registry.routing().route_reply(message, reply);
    }
    sub.mark_active();
    metrics::inc_delivered(1);
}

//! Proxy subscriptions.
//!
//! A proxy subscribes on a peer with the `Wait` strategy and forwards each
//! delivery to the local client under a fresh local id. Confirmations travel
//! back under the peer's id. The proxy lives until its subscription delivers
//! a local message again, or stops.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::client::{Confirmation, Delivery, ServerEvent};
use crate::core::error::BrokerError;
use crate::core::message::generate_id;
use crate::core::subscriber::{ClusterStrategy, Subscription, SubscriptionOptions};
use crate::metrics;

use super::peer::{PeerConnector, PeerLink};

#[derive(Debug)]
pub struct ProxyHandle {
    address: String,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl ProxyHandle {
    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stops forwarding; the task closes the peer link on its way out.
    pub(crate) fn close(self) {
        self.cancel.cancel();
    }
}

pub(crate) async fn open(
    connector: &dyn PeerConnector,
    address: &str,
    sub: &Arc<Subscription>,
) -> Result<ProxyHandle, BrokerError> {
    let link = connector.connect(address).await?;
    let remote_options = SubscriptionOptions {
        strategy: ClusterStrategy::Wait,
        ..*sub.options()
    };
    let events = match link
        .subscribe(sub.user().name(), sub.queue_name(), remote_options)
        .await
    {
        Ok(events) => events,
        Err(err) => {
            link.close().await;
            return Err(err);
        }
    };

    let cancel = sub.cancel_token().child_token();
    let task = tokio::spawn(forward(
        Arc::downgrade(sub),
        link,
        events,
        cancel.clone(),
    ));
    Ok(ProxyHandle {
        address: address.to_string(),
        cancel,
        _task: task,
    })
}

async fn forward(
    owner: Weak<Subscription>,
    link: Arc<dyn PeerLink>,
    events: flume::Receiver<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        // Steering events from the peer are meaningless to the local client.
        let ServerEvent::Deliver(remote) = event else {
            continue;
        };
        let Some(sub) = owner.upgrade() else {
            break;
        };
        let Some(client) = sub.client() else {
            break;
        };

        let remote_id = remote.message_id;
        let local_id = generate_id();
        let needs_confirmation = remote.confirm || remote.request;
        let pending = needs_confirmation.then(|| client.expect_confirmation(local_id));

        let delivery = Delivery {
            message_id: local_id,
            ..remote
        };
        if client.send(ServerEvent::Deliver(delivery)).is_err() {
            if needs_confirmation {
                let _ = link.confirm(remote_id, Confirmation::failure()).await;
            }
            break;
        }
        metrics::inc_proxied(1);

        if let Some(rx) = pending {
            let confirmation = tokio::select! {
                _ = cancel.cancelled() => Confirmation::failure(),
                res = tokio::time::timeout(sub.options().confirm_timeout, rx) => {
                    res.ok().and_then(Result::ok).unwrap_or_default()
                }
            };
            client.forget_confirmation(local_id);
            if let Err(err) = link.confirm(remote_id, confirmation).await {
                warn!(
                    target: "relaymq::cluster",
                    peer = %link.address(),
                    error = %err,
                    "forwarding confirmation to peer failed"
                );
                break;
            }
        }
    }

    debug!(target: "relaymq::cluster", peer = %link.address(), "proxy closed");
    link.close().await;
}

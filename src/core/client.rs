//! Per-connection state shared between the command handlers and the
//! delivery workers of that connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::PeerQueueStat;
use crate::core::binding::name_key;
use crate::core::error::BrokerError;
use crate::core::message::MessageId;
use crate::core::queue::Queue;
use crate::core::subscriber::Subscription;
use crate::core::user::User;

/// Unique identifier for a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_owned())
    }
}

/// A message pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub queue: String,
    pub routing_key: Option<String>,
    pub payload: Bytes,
    /// The subscriber must answer with `ConfirmMessage`.
    pub confirm: bool,
    /// The confirmation's data is routed back to the sender as a reply.
    pub request: bool,
}

/// Frames the broker pushes to a client outside of request/response.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Deliver(Delivery),
    Reply {
        correlation_id: u64,
        queue: String,
        payload: Option<Bytes>,
    },
    ClusterHint {
        queue: String,
        servers: Vec<PeerQueueStat>,
    },
    ClusterRedirect {
        queue: String,
        address: String,
    },
}

/// A subscriber's answer to a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Confirmation {
    pub success: bool,
    /// Reply body for request messages.
    pub data: Option<Bytes>,
}

impl Confirmation {
    pub fn success() -> Self {
        Self {
            success: true,
            data: None,
        }
    }

    pub fn reply(data: impl Into<Bytes>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
pub struct ClientContext {
    id: ClientId,
    user: Option<Arc<User>>,
    outbound: flume::Sender<ServerEvent>,
    connected: AtomicBool,
    cancel: CancellationToken,
    subscriptions: DashMap<String, Arc<Subscription>>,
    pending: DashMap<MessageId, oneshot::Sender<Confirmation>>,
    last_queue: Mutex<Option<Arc<Queue>>>,
}

impl ClientContext {
    /// Creates a connected context. The returned receiver is drained by the
    /// transport; every server-to-client frame goes through it, so concurrent
    /// producers never interleave partial frames.
    pub fn new(
        id: ClientId,
        user: Option<Arc<User>>,
        parent: &CancellationToken,
    ) -> (Arc<Self>, flume::Receiver<ServerEvent>) {
        let (tx, rx) = flume::unbounded();
        let ctx = Arc::new(Self {
            id,
            user,
            outbound: tx,
            connected: AtomicBool::new(true),
            cancel: parent.child_token(),
            subscriptions: DashMap::new(),
            pending: DashMap::new(),
            last_queue: Mutex::new(None),
        });
        (ctx, rx)
    }

    #[inline]
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    #[inline]
    pub fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    pub fn require_user(&self) -> Result<&Arc<User>, BrokerError> {
        self.user.as_ref().ok_or(BrokerError::NotAuthenticated)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn send(&self, event: ServerEvent) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }
        self.outbound
            .send(event)
            .map_err(|_| BrokerError::Disconnected)
    }

    /// Registers interest in the confirmation of `message_id`.
    pub fn expect_confirmation(&self, message_id: MessageId) -> oneshot::Receiver<Confirmation> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id, tx);
        rx
    }

    /// Completes a pending confirmation. Returns `false` when nothing waits
    /// for `message_id` (already timed out, or never delivered here).
    pub fn confirm(&self, message_id: MessageId, confirmation: Confirmation) -> bool {
        match self.pending.remove(&message_id) {
            Some((_, tx)) => tx.send(confirmation).is_ok(),
            None => false,
        }
    }

    pub fn forget_confirmation(&self, message_id: MessageId) {
        self.pending.remove(&message_id);
    }

    pub fn subscription(&self, queue: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(&name_key(queue)).map(|e| Arc::clone(&*e))
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub(crate) fn insert_subscription(
        &self,
        queue: &str,
        subscription: Arc<Subscription>,
    ) -> Result<(), BrokerError> {
        use dashmap::mapref::entry::Entry;
        match self.subscriptions.entry(name_key(queue)) {
            Entry::Occupied(_) => Err(BrokerError::SubscriptionAlreadyExists(queue.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(subscription);
                Ok(())
            }
        }
    }

    pub(crate) fn remove_subscription(&self, queue: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.remove(&name_key(queue)).map(|(_, s)| s)
    }

    /// Removes `subscription` only if it is still the registered one.
    pub(crate) fn release_subscription(&self, subscription: &Arc<Subscription>) -> bool {
        self.subscriptions
            .remove_if(&name_key(subscription.queue_name()), |_, current| {
                Arc::ptr_eq(current, subscription)
            })
            .is_some()
    }

    /// Last queue used for a send, if it still answers to `name` and runs.
    pub(crate) fn cached_queue(&self, name: &str) -> Option<Arc<Queue>> {
        let guard = self.last_queue.lock();
        let queue = guard.as_ref()?;
        (queue.name().eq_ignore_ascii_case(name) && queue.is_started()).then(|| Arc::clone(queue))
    }

    pub(crate) fn remember_queue(&self, queue: &Arc<Queue>) {
        *self.last_queue.lock() = Some(Arc::clone(queue));
    }

    /// Marks the connection gone and cancels its delivery workers. Pending
    /// confirmations are dropped, which fails their waits.
    pub(crate) fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(target: "relaymq::client", client = %self.id, "client disconnected");
        }
        self.cancel.cancel();
        self.pending.clear();
        self.last_queue.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::{QueueOptions, QueueStatus};

    fn ctx() -> (Arc<ClientContext>, flume::Receiver<ServerEvent>) {
        ClientContext::new(ClientId::from("c1"), None, &CancellationToken::new())
    }

    #[tokio::test]
    async fn confirmation_reaches_waiter_once() {
        let (ctx, _rx) = ctx();
        let rx = ctx.expect_confirmation(7);
        assert!(ctx.confirm(7, Confirmation::reply("ok")));
        assert!(!ctx.confirm(7, Confirmation::success()));
        let got = rx.await.unwrap();
        assert_eq!(got.data.as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn send_fails_after_disconnect() {
        let (ctx, rx) = ctx();
        let event = ServerEvent::ClusterRedirect {
            queue: "q".into(),
            address: "peer:1".into(),
        };
        ctx.send(event.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), event);

        ctx.disconnect();
        assert!(ctx.cancel_token().is_cancelled());
        assert!(matches!(ctx.send(event), Err(BrokerError::Disconnected)));
    }

    #[test]
    fn cached_queue_is_revalidated() {
        let (ctx, _rx) = ctx();
        let q = Arc::new(Queue::new("u", "Orders", QueueOptions::default()));
        q.set_status(QueueStatus::Started);
        ctx.remember_queue(&q);

        assert!(ctx.cached_queue("orders").is_some());
        assert!(ctx.cached_queue("other").is_none());
        q.set_status(QueueStatus::Deleting);
        assert!(ctx.cached_queue("orders").is_none());
    }

    #[test]
    fn require_user_without_login() {
        let (ctx, _rx) = ctx();
        assert!(matches!(
            ctx.require_user(),
            Err(BrokerError::NotAuthenticated)
        ));
    }
}

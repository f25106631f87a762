use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::proxy::ProxyHandle;
use crate::core::client::{ClientContext, ClientId};
use crate::core::queue::Queue;
use crate::core::storage::StorageRegistry;
use crate::core::user::User;

/// What an idle subscription does when peers hold traffic for its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStrategy {
    #[default]
    Wait,
    Hint,
    Redirect,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Wait for `ConfirmMessage` before taking the next message.
    pub confirm: bool,
    pub confirm_timeout: Duration,
    pub strategy: ClusterStrategy,
    pub idle_threshold: Duration,
}

impl SubscriptionOptions {
    pub fn new(confirm_timeout: Duration, idle_threshold: Duration) -> Self {
        Self {
            confirm: false,
            confirm_timeout,
            strategy: ClusterStrategy::Wait,
            idle_threshold,
        }
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_strategy(mut self, strategy: ClusterStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Dequeuing,
    Delivering,
    Confirming,
    /// The queue was deleted; waiting for a queue of the same name.
    Searching,
    Stopped,
}

#[derive(Debug)]
pub struct Subscription {
    client: Weak<ClientContext>,
    client_id: ClientId,
    user: Arc<User>,
    queue_name: String,
    options: SubscriptionOptions,
    state: Mutex<WorkerState>,
    queue: Mutex<Option<Arc<Queue>>>,
    cancel: CancellationToken,
    last_activity: Mutex<Instant>,
    idle_ms: AtomicU64,
    last_cluster_action: Mutex<Option<Instant>>,
    proxy: Mutex<Option<ProxyHandle>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn new(
        client: &Arc<ClientContext>,
        user: Arc<User>,
        queue: Arc<Queue>,
        options: SubscriptionOptions,
    ) -> Arc<Self> {
        queue.add_subscription();
        Arc::new(Self {
            client: Arc::downgrade(client),
            client_id: client.id().clone(),
            user,
            queue_name: queue.name().to_string(),
            options,
            state: Mutex::new(WorkerState::Idle),
            queue: Mutex::new(Some(queue)),
            cancel: client.cancel_token().child_token(),
            last_activity: Mutex::new(Instant::now()),
            idle_ms: AtomicU64::new(0),
            last_cluster_action: Mutex::new(None),
            proxy: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn client(&self) -> Option<Arc<ClientContext>> {
        self.client.upgrade()
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[inline]
    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    #[inline]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    #[inline]
    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Queue currently feeding this subscription, `None` while searching.
    pub fn current_queue(&self) -> Option<Arc<Queue>> {
        self.queue.lock().clone()
    }

    pub(crate) fn attach(&self, queue: Arc<Queue>) {
        queue.add_subscription();
        if let Some(previous) = self.queue.lock().replace(queue) {
            previous.remove_subscription();
        }
    }

    pub(crate) fn detach(&self) {
        if let Some(previous) = self.queue.lock().take() {
            previous.remove_subscription();
        }
    }

    /// Time since the last confirmed delivery, as of the last timer tick.
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.idle_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn mark_active(&self) {
        *self.last_activity.lock() = Instant::now();
        self.idle_ms.store(0, Ordering::Relaxed);
    }

    pub(crate) fn start(self: &Arc<Self>, registry: Arc<StorageRegistry>) {
        let handle = tokio::spawn(super::worker::run(Arc::clone(self), registry));
        *self.task.lock() = Some(handle);
    }

    /// Cancels the worker and any proxy. An in-flight message is redelivered
    /// by the worker on its way out.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
        self.stop_proxy();
    }

    /// Waits for the worker task to finish.
    pub(crate) async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy.lock().is_some()
    }

    pub fn proxy_address(&self) -> Option<String> {
        self.proxy.lock().as_ref().map(|p| p.address().to_string())
    }

    /// Installs a proxy unless one is already active; a rejected handle is
    /// closed.
    pub(crate) fn install_proxy(&self, handle: ProxyHandle) -> bool {
        let mut slot = self.proxy.lock();
        if slot.is_some() || self.cancel.is_cancelled() {
            drop(slot);
            handle.close();
            return false;
        }
        *slot = Some(handle);
        true
    }

    pub(crate) fn stop_proxy(&self) -> bool {
        let handle = self.proxy.lock().take();
        match handle {
            Some(handle) => {
                debug!(
                    target: "relaymq::subscriber",
                    client = %self.client_id,
                    queue = %self.queue_name,
                    peer = %handle.address(),
                    "closing cluster proxy"
                );
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Timer hook: refreshes the idle time and runs the cluster strategy when
    /// the queue is empty and has been idle past the threshold. Strategy
    /// actions fire at most once per threshold interval.
    pub(crate) async fn on_timer(self: &Arc<Self>, registry: &StorageRegistry, now: Instant) {
        let idle = now.saturating_duration_since(*self.last_activity.lock());
        self.idle_ms
            .store(idle.as_millis() as u64, Ordering::Relaxed);

        if self.options.strategy == ClusterStrategy::Wait || self.cancel.is_cancelled() {
            return;
        }
        let Some(cluster) = registry.cluster() else {
            return;
        };
        let queue_empty = self.current_queue().map_or(false, |q| q.is_empty());
        if !queue_empty || idle < self.options.idle_threshold {
            return;
        }
        {
            let mut last = self.last_cluster_action.lock();
            if let Some(at) = *last {
                if now.saturating_duration_since(at) < self.options.idle_threshold {
                    return;
                }
            }
            *last = Some(now);
        }
        cluster.evaluate(self).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(queue) = self.queue.get_mut().take() {
            queue.remove_subscription();
        }
    }
}

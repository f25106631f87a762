//! Top-level container of broker state.
//!
//! The registry owns users (and through them queues and bindings), the
//! connected clients, the index of live subscriptions driven by the shared
//! timer, and the memory monitor. Every administrative mutation follows the
//! same shape: update the in-memory index, write through to persistence, undo
//! the index change if the write fails.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterCoordinator, QueueStat};
use crate::config::BrokerSettings;
use crate::core::binding::{name_key, Binding};
use crate::core::client::{ClientContext, ClientId, ServerEvent};
use crate::core::error::BrokerError;
use crate::core::memory::MemoryMonitor;
use crate::core::message::{observe_id, Message};
use crate::core::persistence::{BindingRecord, Persistence, QueueRecord};
use crate::core::queue::{LimitKind, Queue, QueueInfo, QueueOptions, QueueStatus};
use crate::core::routing::RoutingCoordinator;
use crate::core::subscriber::{Subscription, SubscriptionOptions};
use crate::core::user::{User, UserStats};

type SubscriptionKey = (ClientId, String);

#[derive(Debug)]
pub struct StorageRegistry {
    settings: BrokerSettings,
    persistence: Arc<dyn Persistence>,
    users: DashMap<String, Arc<User>>,
    clients: DashMap<ClientId, Arc<ClientContext>>,
    subscriptions: DashMap<SubscriptionKey, Arc<Subscription>>,
    memory: MemoryMonitor,
    cluster: OnceLock<Arc<ClusterCoordinator>>,
    shutdown: CancellationToken,
}

impl StorageRegistry {
    pub fn new(settings: BrokerSettings, persistence: Arc<dyn Persistence>) -> Arc<Self> {
        let memory = MemoryMonitor::new(settings.memory_capacity, settings.forced_limit_percent);
        Arc::new(Self {
            settings,
            persistence,
            users: DashMap::new(),
            clients: DashMap::new(),
            subscriptions: DashMap::new(),
            memory,
            cluster: OnceLock::new(),
            shutdown: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    #[inline]
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    #[inline]
    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    #[inline]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn cluster(&self) -> Option<&Arc<ClusterCoordinator>> {
        self.cluster.get()
    }

    pub(crate) fn set_cluster(&self, cluster: Arc<ClusterCoordinator>) -> Result<(), BrokerError> {
        self.cluster
            .set(cluster)
            .map_err(|_| BrokerError::Internal("cluster already attached".to_string()))
    }

    pub fn routing(&self) -> RoutingCoordinator<'_> {
        RoutingCoordinator::new(self)
    }

    // ─── users ───────────────────────────────────────────────────────────

    pub fn user(&self, name: &str) -> Option<Arc<User>> {
        self.users.get(&name_key(name)).map(|e| Arc::clone(&*e))
    }

    pub fn users(&self) -> Vec<Arc<User>> {
        self.users.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub async fn add_user(
        &self,
        name: &str,
        password: &str,
        admin: bool,
    ) -> Result<Arc<User>, BrokerError> {
        if name.trim().is_empty() {
            return Err(BrokerError::Internal("user name must not be empty".to_string()));
        }
        let user = Arc::new(User::new(name, password, admin));
        self.insert_user(Arc::clone(&user))?;

        if let Err(err) = self.persistence.save_user(&user.to_record()).await {
            self.users
                .remove_if(&name_key(name), |_, current| Arc::ptr_eq(current, &user));
            return Err(err.into());
        }
        info!(target: "relaymq::storage", user = %name, admin, "user added");
        Ok(user)
    }

    fn insert_user(&self, user: Arc<User>) -> Result<(), BrokerError> {
        use dashmap::mapref::entry::Entry;
        match self.users.entry(name_key(user.name())) {
            Entry::Occupied(_) => Err(BrokerError::UserAlreadyExists(user.name().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(user);
                Ok(())
            }
        }
    }

    /// Removes a user together with everything it owns. Its connected
    /// clients are disconnected.
    pub async fn delete_user(&self, name: &str) -> Result<(), BrokerError> {
        let (_, user) = self
            .users
            .remove(&name_key(name))
            .ok_or_else(|| BrokerError::UserNotFound(name.to_string()))?;

        if let Err(err) = self.persistence.delete_user(user.name()).await {
            self.users.insert(name_key(user.name()), user);
            return Err(err.into());
        }

        let owned: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|e| {
                e.value()
                    .user()
                    .is_some_and(|u| Arc::ptr_eq(u, &user))
            })
            .map(|e| e.key().clone())
            .collect();
        for client in owned {
            self.disconnect_client(&client).await;
        }
        for queue in user.queues() {
            if user.remove_queue(&queue) {
                self.dispose_queue(&user, &queue).await;
            }
        }
        info!(target: "relaymq::storage", user = %name, "user deleted");
        Ok(())
    }

    // ─── queues ──────────────────────────────────────────────────────────

    pub async fn add_queue(
        &self,
        user: &Arc<User>,
        name: &str,
        options: QueueOptions,
    ) -> Result<Arc<Queue>, BrokerError> {
        validate_queue(name, &options)?;
        let queue = Arc::new(Queue::new(user.name(), name, options));
        user.insert_queue(Arc::clone(&queue))?;

        if options.durable {
            let record = QueueRecord {
                name: name.to_string(),
                options,
            };
            if let Err(err) = self.persistence.save_queue(user.name(), &record).await {
                user.remove_queue(&queue);
                queue.set_status(QueueStatus::Deleted);
                return Err(err.into());
            }
        }
        queue.set_status(QueueStatus::Started);
        info!(
            target: "relaymq::storage",
            user = %user.name(),
            queue = %name,
            durable = options.durable,
            exchange = options.exchange,
            "queue added"
        );
        Ok(queue)
    }

    /// Deletes a queue. The queue leaves the index before it is torn down, so
    /// lookups never observe a half-deleted queue; subscriptions switch to
    /// searching for a successor.
    pub async fn delete_queue(&self, user: &Arc<User>, name: &str) -> Result<(), BrokerError> {
        let queue = user
            .queue(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        if !user.remove_queue(&queue) {
            return Err(BrokerError::QueueNotFound(name.to_string()));
        }

        if queue.is_durable() {
            if let Err(err) = self.persistence.delete_queue(user.name(), queue.name()).await {
                if user.insert_queue(Arc::clone(&queue)).is_err() {
                    warn!(
                        target: "relaymq::storage",
                        queue = %queue.name(),
                        "queue recreated during failed delete; keeping the new one"
                    );
                    self.dispose_queue(user, &queue).await;
                }
                return Err(err.into());
            }
        }
        self.dispose_queue(user, &queue).await;
        info!(target: "relaymq::storage", user = %user.name(), queue = %name, "queue deleted");
        Ok(())
    }

    /// Tears down a queue already removed from the index.
    async fn dispose_queue(&self, user: &User, queue: &Arc<Queue>) {
        queue.set_status(QueueStatus::Deleting);

        for binding in user.bindings().remove_all_for(queue.name()) {
            if binding.is_durable() {
                if let Err(err) = self
                    .persistence
                    .delete_binding(user.name(), binding.exchange(), binding.queue())
                    .await
                {
                    warn!(
                        target: "relaymq::storage",
                        exchange = %binding.exchange(),
                        queue = %binding.queue(),
                        error = %err,
                        "failed to delete durable binding of deleted queue"
                    );
                }
            }
        }

        let drained = queue.clear();
        self.delete_durable_copies(user, &drained).await;
        if queue.is_durable() {
            self.purge_durable_messages(user, queue.name()).await;
        }
        queue.set_status(QueueStatus::Deleted);
    }

    /// Deletes stored copies still held by workers or left from a restart.
    async fn purge_durable_messages(&self, user: &User, queue: &str) {
        let ids = match self.persistence.load_message_keys(user.name(), queue).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(
                    target: "relaymq::storage",
                    queue = %queue,
                    error = %err,
                    "failed to list durable messages of deleted queue"
                );
                return;
            }
        };
        for id in ids {
            if let Err(err) = self.persistence.delete_message(user.name(), queue, id).await {
                warn!(
                    target: "relaymq::storage",
                    queue = %queue,
                    id,
                    error = %err,
                    "failed to delete durable message of deleted queue"
                );
            }
        }
    }

    async fn delete_durable_copies(&self, user: &User, messages: &[Message]) {
        for message in messages.iter().filter(|m| m.persistence.is_persistent()) {
            if let Err(err) = self
                .persistence
                .delete_message(user.name(), &message.queue, message.id)
                .await
            {
                warn!(
                    target: "relaymq::storage",
                    queue = %message.queue,
                    id = message.id,
                    error = %err,
                    "failed to delete durable message copy"
                );
            }
        }
    }

    /// Drops every buffered message; the queue stays usable.
    pub async fn clear_queue(&self, user: &Arc<User>, name: &str) -> Result<u64, BrokerError> {
        let queue = user
            .queue(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        if !queue.set_status(QueueStatus::Clearing) {
            return Err(BrokerError::QueueNotFound(name.to_string()));
        }
        let drained = queue.clear();
        queue.set_status(QueueStatus::Started);
        self.delete_durable_copies(user, &drained).await;
        debug!(
            target: "relaymq::storage",
            queue = %queue.name(),
            cleared = drained.len(),
            "queue cleared"
        );
        Ok(drained.len() as u64)
    }

    pub fn get_queue(&self, user: &User, name: &str) -> Result<QueueInfo, BrokerError> {
        user.queue(name)
            .map(|q| q.info())
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    pub fn search_queues(
        &self,
        user: &User,
        pattern: Option<&str>,
    ) -> Result<Vec<QueueInfo>, BrokerError> {
        Ok(user
            .search_queues(pattern)?
            .iter()
            .map(|q| q.info())
            .collect())
    }

    // ─── bindings ────────────────────────────────────────────────────────

    pub async fn add_binding(
        &self,
        user: &User,
        exchange: &str,
        queue: &str,
        durable: bool,
        pattern: Option<&str>,
    ) -> Result<Arc<Binding>, BrokerError> {
        let binding = user.validate_binding(exchange, queue, durable, pattern)?;
        let binding = user.bindings().add(binding)?;

        if durable {
            let record = BindingRecord {
                exchange: binding.exchange().to_string(),
                queue: binding.queue().to_string(),
                durable,
                pattern: binding.pattern().map(str::to_string),
            };
            if let Err(err) = self.persistence.save_binding(user.name(), &record).await {
                let _ = user.bindings().remove(exchange, queue);
                return Err(err.into());
            }
        }
        debug!(
            target: "relaymq::storage",
            exchange = %binding.exchange(),
            queue = %binding.queue(),
            "binding added"
        );
        Ok(binding)
    }

    pub async fn delete_binding(
        &self,
        user: &User,
        exchange: &str,
        queue: &str,
    ) -> Result<(), BrokerError> {
        let removed = user.bindings().remove(exchange, queue)?;
        if removed.is_durable() {
            if let Err(err) = self
                .persistence
                .delete_binding(user.name(), removed.exchange(), removed.queue())
                .await
            {
                let restored = Binding::new(
                    removed.exchange(),
                    removed.queue(),
                    true,
                    removed.pattern(),
                )?;
                let _ = user.bindings().add(restored);
                return Err(err.into());
            }
        }
        Ok(())
    }

    pub fn get_binding(
        &self,
        user: &User,
        exchange: &str,
        queue: &str,
    ) -> Result<Arc<Binding>, BrokerError> {
        user.bindings()
            .get(exchange, queue)
            .ok_or_else(|| BrokerError::BindingNotFound {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
            })
    }

    // ─── clients & subscriptions ─────────────────────────────────────────

    /// Creates and registers a client context. The receiver carries every
    /// event for that client.
    pub fn connect_client(
        &self,
        user: Option<Arc<User>>,
    ) -> (Arc<ClientContext>, flume::Receiver<ServerEvent>) {
        let (ctx, rx) = ClientContext::new(ClientId::generate(), user, &self.shutdown);
        self.clients.insert(ctx.id().clone(), Arc::clone(&ctx));
        debug!(target: "relaymq::storage", client = %ctx.id(), "client connected");
        (ctx, rx)
    }

    pub fn client(&self, id: &ClientId) -> Option<Arc<ClientContext>> {
        self.clients.get(id).map(|e| Arc::clone(&*e))
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Unregisters a client, stops its subscriptions (redelivering in-flight
    /// messages) and fails its pending confirmations.
    pub async fn disconnect_client(&self, id: &ClientId) {
        let Some((_, ctx)) = self.clients.remove(id) else {
            return;
        };
        let subscriptions = ctx.subscriptions();
        for sub in &subscriptions {
            self.subscriptions
                .remove(&(id.clone(), name_key(sub.queue_name())));
            ctx.remove_subscription(sub.queue_name());
            sub.stop();
        }
        ctx.disconnect();
        for sub in subscriptions {
            sub.join().await;
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        ctx: &Arc<ClientContext>,
        queue: &str,
        options: SubscriptionOptions,
    ) -> Result<Arc<Subscription>, BrokerError> {
        let user = ctx.require_user()?;
        let target = user
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if target.is_exchange() {
            return Err(BrokerError::QueueIsExchange(target.name().to_string()));
        }
        if ctx.subscription(queue).is_some() {
            return Err(BrokerError::SubscriptionAlreadyExists(queue.to_string()));
        }

        let sub = Subscription::new(ctx, Arc::clone(user), target, options);
        ctx.insert_subscription(queue, Arc::clone(&sub))?;
        self.subscriptions
            .insert((ctx.id().clone(), name_key(queue)), Arc::clone(&sub));
        sub.start(Arc::clone(self));
        debug!(
            target: "relaymq::storage",
            client = %ctx.id(),
            queue = %queue,
            confirm = options.confirm,
            strategy = ?options.strategy,
            "subscribed"
        );
        Ok(sub)
    }

    /// Stops a subscription. The timer registration goes first so no timer
    /// action fires after removal.
    pub async fn unsubscribe(&self, ctx: &ClientContext, queue: &str) -> Result<(), BrokerError> {
        self.subscriptions
            .remove(&(ctx.id().clone(), name_key(queue)));
        let sub = ctx
            .remove_subscription(queue)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(queue.to_string()))?;
        sub.stop();
        sub.join().await;
        Ok(())
    }

    /// Drops the index entries of a subscription whose worker has ended.
    /// Entries already replaced by a newer subscription for the same
    /// (client, queue) pair are left alone.
    pub(crate) fn release_subscription(&self, sub: &Arc<Subscription>) {
        let key = (sub.client_id().clone(), name_key(sub.queue_name()));
        let timer_entry = self
            .subscriptions
            .remove_if(&key, |_, current| Arc::ptr_eq(current, sub))
            .is_some();
        let client_entry = sub
            .client()
            .map_or(false, |client| client.release_subscription(sub));
        if timer_entry || client_entry {
            debug!(
                target: "relaymq::storage",
                client = %sub.client_id(),
                queue = %sub.queue_name(),
                "ended subscription released"
            );
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Shared timer tick: idle tracking and cluster strategies for every
    /// subscription. Subscriptions are driven concurrently so a slow peer
    /// only holds up its own strategy action.
    pub async fn tick(&self, now: Instant) {
        let subscriptions: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        join_all(subscriptions.iter().map(|sub| sub.on_timer(self, now))).await;
    }

    // ─── aggregates ──────────────────────────────────────────────────────

    pub fn stats(&self) -> UserStats {
        self.users.iter().fold(UserStats::default(), |mut acc, e| {
            acc += e.value().stats();
            acc
        })
    }

    /// Samples in-memory volume and updates the pressure flag. Forced caps
    /// are lifted once pressure clears.
    pub fn refresh_memory_pressure(&self) -> bool {
        let was_under_pressure = self.memory.under_pressure();
        let pressure = self.memory.refresh(self.stats().memory_volume);
        if was_under_pressure && !pressure {
            for user in self.users.iter() {
                for queue in user.queues() {
                    queue.lift_forced_limit();
                }
            }
        }
        pressure
    }

    /// Activity of every started non-exchange queue, for peers.
    pub fn queue_stats(&self) -> Vec<QueueStat> {
        let mut stats: Vec<QueueStat> = self
            .users
            .iter()
            .flat_map(|user| {
                user.queues()
                    .into_iter()
                    .filter(|q| q.is_started() && !q.is_exchange())
                    .map(|q| QueueStat {
                        user: q.user().to_string(),
                        queue: q.name().to_string(),
                        length: q.len(),
                        subscriptions: q.subscription_count(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        stats.sort_by(|a, b| (&a.user, &a.queue).cmp(&(&b.user, &b.queue)));
        stats
    }

    // ─── restore & shutdown ──────────────────────────────────────────────

    /// Rebuilds users, durable queues, durable bindings and persisted messages
    /// from storage, then creates the configured administrator when storage
    /// holds no users at all.
    pub async fn restore(&self) -> Result<(), BrokerError> {
        let mut restored_messages = 0usize;
        for user_key in self.persistence.load_user_keys().await? {
            let Some(record) = self.persistence.load_user(&user_key).await? else {
                continue;
            };
            let user = Arc::new(User::from_record(record));
            if let Err(err) = self.insert_user(Arc::clone(&user)) {
                warn!(target: "relaymq::storage", error = %err, "skipping duplicate user record");
                continue;
            }

            for queue_key in self.persistence.load_queue_keys(user.name()).await? {
                let Some(record) = self.persistence.load_queue(user.name(), &queue_key).await?
                else {
                    continue;
                };
                let queue = Arc::new(Queue::new(user.name(), &record.name, record.options));
                user.insert_queue(Arc::clone(&queue))?;
                queue.set_status(QueueStatus::Started);

                if queue.is_exchange() {
                    continue;
                }
                for id in self
                    .persistence
                    .load_message_keys(user.name(), queue.name())
                    .await?
                {
                    let Some(record) = self
                        .persistence
                        .load_message(user.name(), queue.name(), id)
                        .await?
                    else {
                        continue;
                    };
                    observe_id(record.id);
                    let mut message = record.into_message(queue.name());
                    message.release_payload();
                    queue.enqueue(message)?;
                    restored_messages += 1;
                }
            }

            for (exchange, queue) in self.persistence.load_binding_keys(user.name()).await? {
                let Some(record) = self
                    .persistence
                    .load_binding(user.name(), &exchange, &queue)
                    .await?
                else {
                    continue;
                };
                let binding = user.validate_binding(
                    &record.exchange,
                    &record.queue,
                    record.durable,
                    record.pattern.as_deref(),
                );
                match binding.and_then(|b| user.bindings().add(b)) {
                    Ok(_) => {}
                    Err(err) => warn!(
                        target: "relaymq::storage",
                        exchange = %record.exchange,
                        queue = %record.queue,
                        error = %err,
                        "skipping invalid binding record"
                    ),
                }
            }
        }

        if self.users.is_empty() {
            if let Some((name, password)) = self.settings.default_admin.clone() {
                self.add_user(&name, &password, true).await?;
            }
        }
        info!(
            target: "relaymq::storage",
            users = self.users.len(),
            messages = restored_messages,
            "state restored"
        );
        Ok(())
    }

    /// Cancels every client and subscription and waits for the workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let clients: Vec<ClientId> = self.clients.iter().map(|e| e.key().clone()).collect();
        for id in clients {
            self.disconnect_client(&id).await;
        }
    }
}

fn validate_queue(name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
    if name.trim().is_empty() {
        return Err(BrokerError::InvalidQueue("queue name must not be empty".to_string()));
    }
    if options.exchange && options.limit.is_some() {
        return Err(BrokerError::InvalidQueue(format!(
            "exchange '{name}' cannot carry a limit"
        )));
    }
    if let Some(limit) = options.limit {
        let max = match limit.kind {
            LimitKind::Length(n) | LimitKind::Volume(n) => n,
        };
        if max == 0 {
            return Err(BrokerError::InvalidQueue(format!(
                "queue '{name}' limit must be positive"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::MemoryPersistence;
    use crate::core::queue::{LimitStrategy, QueueLimit};

    fn registry_with(persistence: Arc<MemoryPersistence>) -> Arc<StorageRegistry> {
        StorageRegistry::new(BrokerSettings::default(), persistence)
    }

    #[tokio::test]
    async fn add_queue_rolls_back_on_save_failure() {
        let persistence = Arc::new(MemoryPersistence::new());
        let registry = registry_with(persistence.clone());
        let user = registry.add_user("alice", "pw", false).await.unwrap();

        persistence.set_failing(true);
        let durable = QueueOptions {
            durable: true,
            ..Default::default()
        };
        let err = registry.add_queue(&user, "q", durable).await.unwrap_err();
        assert!(matches!(err, BrokerError::Persistence(_)));
        assert!(user.queue("q").is_none());

        persistence.set_failing(false);
        registry.add_queue(&user, "q", durable).await.unwrap();
        assert!(user.queue("q").unwrap().is_started());
    }

    #[tokio::test]
    async fn duplicate_user_is_a_conflict() {
        let registry = registry_with(Arc::new(MemoryPersistence::new()));
        registry.add_user("bob", "pw", false).await.unwrap();
        let err = registry.add_user("BOB", "pw", false).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn delete_queue_removes_bindings_at_both_ends() {
        let registry = registry_with(Arc::new(MemoryPersistence::new()));
        let user = registry.add_user("alice", "pw", false).await.unwrap();
        let exchange = QueueOptions {
            exchange: true,
            ..Default::default()
        };
        registry.add_queue(&user, "x", exchange).await.unwrap();
        registry
            .add_queue(&user, "q", QueueOptions::default())
            .await
            .unwrap();
        registry.add_binding(&user, "x", "q", false, None).await.unwrap();

        registry.delete_queue(&user, "q").await.unwrap();
        assert!(!user.bindings().has_exchange_entry("x"));
        assert!(!user.bindings().has_queue_entry("q"));
        assert!(registry.get_queue(&user, "q").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn exchange_with_limit_is_invalid() {
        let registry = registry_with(Arc::new(MemoryPersistence::new()));
        let user = registry.add_user("alice", "pw", false).await.unwrap();
        let options = QueueOptions {
            exchange: true,
            limit: Some(QueueLimit::length(1, LimitStrategy::Reject)),
            ..Default::default()
        };
        assert!(matches!(
            registry.add_queue(&user, "x", options).await,
            Err(BrokerError::InvalidQueue(_))
        ));
    }

    #[tokio::test]
    async fn restore_creates_default_admin_once() {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut settings = BrokerSettings::default();
        settings.default_admin = Some(("root".to_string(), "secret".to_string()));

        let registry = StorageRegistry::new(settings.clone(), persistence.clone());
        registry.restore().await.unwrap();
        let admin = registry.user("root").unwrap();
        assert!(admin.is_admin());

        let again = StorageRegistry::new(settings, persistence);
        again.restore().await.unwrap();
        assert_eq!(again.users().len(), 1);
    }
}

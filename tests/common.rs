#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use relaymq::config::BrokerSettings;
use relaymq::core::client::{ClientContext, Delivery, ServerEvent};
use relaymq::core::message::MessageId;
use relaymq::core::persistence::{
    BindingRecord, MemoryPersistence, MessageRecord, Persistence, PersistenceError, QueueRecord,
    UserRecord,
};
use relaymq::core::user::User;
use relaymq::StorageRegistry;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = relaymq::logging::init_with_default("warn");
    });
}

/// Settings with short intervals so workers and timers react quickly.
pub fn fast_settings() -> BrokerSettings {
    BrokerSettings {
        poll_interval: Duration::from_millis(20),
        search_interval: Duration::from_millis(20),
        default_confirm_timeout: Duration::from_millis(500),
        default_idle_threshold: Duration::from_millis(100),
        timer_interval: Duration::from_millis(20),
        memory_check_interval: Duration::from_millis(20),
        ..BrokerSettings::default()
    }
}

pub fn registry() -> Arc<StorageRegistry> {
    registry_with(Arc::new(MemoryPersistence::new()))
}

pub fn registry_with(persistence: Arc<dyn Persistence>) -> Arc<StorageRegistry> {
    init_logging();
    StorageRegistry::new(fast_settings(), persistence)
}

pub async fn user(registry: &StorageRegistry, name: &str) -> Arc<User> {
    registry
        .add_user(name, "pw", false)
        .await
        .expect("user created")
}

pub fn client(
    registry: &StorageRegistry,
    user: &Arc<User>,
) -> (Arc<ClientContext>, flume::Receiver<ServerEvent>) {
    registry.connect_client(Some(Arc::clone(user)))
}

/// Next event within `within`, or `None`.
pub async fn next_event(
    rx: &flume::Receiver<ServerEvent>,
    within: Duration,
) -> Option<ServerEvent> {
    tokio::time::timeout(within, rx.recv_async())
        .await
        .ok()
        .and_then(Result::ok)
}

/// Next `Deliver` event, skipping anything else.
pub async fn next_delivery(
    rx: &flume::Receiver<ServerEvent>,
    within: Duration,
) -> Option<Delivery> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_event(rx, remaining).await? {
            ServerEvent::Deliver(delivery) => return Some(delivery),
            _ => continue,
        }
    }
}

/// Polls `check` every 10ms until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory storage that behaves like a remote backend: message saves
/// suspend for `save_delay`, and message reads fail while `failing_reads`
/// is set.
#[derive(Debug, Default)]
pub struct SlowStorage {
    pub inner: MemoryPersistence,
    save_delay: Duration,
    failing_reads: AtomicBool,
}

impl SlowStorage {
    pub fn new(save_delay: Duration) -> Self {
        Self {
            save_delay,
            ..Self::default()
        }
    }

    pub fn set_failing_reads(&self, failing: bool) {
        self.failing_reads.store(failing, Ordering::SeqCst);
    }

    fn check_readable(&self) -> Result<(), PersistenceError> {
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("read timed out".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for SlowStorage {
    async fn save_user(&self, user: &UserRecord) -> Result<(), PersistenceError> {
        self.inner.save_user(user).await
    }

    async fn delete_user(&self, user: &str) -> Result<(), PersistenceError> {
        self.inner.delete_user(user).await
    }

    async fn load_user(&self, user: &str) -> Result<Option<UserRecord>, PersistenceError> {
        self.inner.load_user(user).await
    }

    async fn load_user_keys(&self) -> Result<Vec<String>, PersistenceError> {
        self.inner.load_user_keys().await
    }

    async fn save_queue(&self, user: &str, queue: &QueueRecord) -> Result<(), PersistenceError> {
        self.inner.save_queue(user, queue).await
    }

    async fn delete_queue(&self, user: &str, queue: &str) -> Result<(), PersistenceError> {
        self.inner.delete_queue(user, queue).await
    }

    async fn load_queue(
        &self,
        user: &str,
        queue: &str,
    ) -> Result<Option<QueueRecord>, PersistenceError> {
        self.inner.load_queue(user, queue).await
    }

    async fn load_queue_keys(&self, user: &str) -> Result<Vec<String>, PersistenceError> {
        self.inner.load_queue_keys(user).await
    }

    async fn save_binding(
        &self,
        user: &str,
        binding: &BindingRecord,
    ) -> Result<(), PersistenceError> {
        self.inner.save_binding(user, binding).await
    }

    async fn delete_binding(
        &self,
        user: &str,
        exchange: &str,
        queue: &str,
    ) -> Result<(), PersistenceError> {
        self.inner.delete_binding(user, exchange, queue).await
    }

    async fn load_binding(
        &self,
        user: &str,
        exchange: &str,
        queue: &str,
    ) -> Result<Option<BindingRecord>, PersistenceError> {
        self.inner.load_binding(user, exchange, queue).await
    }

    async fn load_binding_keys(
        &self,
        user: &str,
    ) -> Result<Vec<(String, String)>, PersistenceError> {
        self.inner.load_binding_keys(user).await
    }

    async fn save_message(
        &self,
        user: &str,
        queue: &str,
        message: &MessageRecord,
    ) -> Result<(), PersistenceError> {
        tokio::time::sleep(self.save_delay).await;
        self.inner.save_message(user, queue, message).await
    }

    async fn delete_message(
        &self,
        user: &str,
        queue: &str,
        id: MessageId,
    ) -> Result<(), PersistenceError> {
        self.inner.delete_message(user, queue, id).await
    }

    async fn load_message(
        &self,
        user: &str,
        queue: &str,
        id: MessageId,
    ) -> Result<Option<MessageRecord>, PersistenceError> {
        self.check_readable()?;
        self.inner.load_message(user, queue, id).await
    }

    async fn load_message_keys(
        &self,
        user: &str,
        queue: &str,
    ) -> Result<Vec<MessageId>, PersistenceError> {
        self.check_readable()?;
        self.inner.load_message_keys(user, queue).await
    }
}

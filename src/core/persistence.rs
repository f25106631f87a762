//! Durable storage contract.
//!
//! The broker only talks to storage through [`Persistence`]. Every call is
//! scoped by user and, where relevant, queue; callers roll back the in-memory
//! change that triggered a failed save.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::binding::name_key;
use crate::core::message::{Message, MessageId, Persistence as PersistenceClass};
use crate::core::queue::QueueOptions;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("record corrupted: {0}")]
    Corruption(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub admin: bool,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub name: String,
    pub options: QueueOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub exchange: String,
    pub queue: String,
    pub durable: bool,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub routing_key: Option<String>,
    pub persistence: PersistenceClass,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl MessageRecord {
    /// Captures a message that still holds its payload.
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            routing_key: message.routing_key.clone(),
            persistence: message.persistence,
            timestamp: message.timestamp,
            payload: message
                .payload
                .as_ref()
                .map(|p| p.to_vec())
                .unwrap_or_default(),
        }
    }

    /// Rebuilds the message for `queue`. Request origins are not durable: the
    /// requesting connection is gone after a restart.
    pub fn into_message(self, queue: &str) -> Message {
        let size = self.payload.len() as u64;
        Message {
            id: self.id,
            queue: queue.to_string(),
            routing_key: self.routing_key,
            persistence: self.persistence,
            request: false,
            origin: None,
            payload: Some(Bytes::from(self.payload)),
            size,
            timestamp: self.timestamp,
            delivered: false,
        }
    }
}

#[async_trait]
pub trait Persistence: Send + Sync + Debug {
    async fn save_user(&self, user: &UserRecord) -> Result<(), PersistenceError>;
    async fn delete_user(&self, user: &str) -> Result<(), PersistenceError>;
    async fn load_user(&self, user: &str) -> Result<Option<UserRecord>, PersistenceError>;
    async fn load_user_keys(&self) -> Result<Vec<String>, PersistenceError>;

    async fn save_queue(&self, user: &str, queue: &QueueRecord) -> Result<(), PersistenceError>;
    async fn delete_queue(&self, user: &str, queue: &str) -> Result<(), PersistenceError>;
    async fn load_queue(
        &self,
        user: &str,
        queue: &str,
    ) -> Result<Option<QueueRecord>, PersistenceError>;
    async fn load_queue_keys(&self, user: &str) -> Result<Vec<String>, PersistenceError>;

    async fn save_binding(
        &self,
        user: &str,
        binding: &BindingRecord,
    ) -> Result<(), PersistenceError>;
    async fn delete_binding(
        &self,
        user: &str,
        exchange: &str,
        queue: &str,
    ) -> Result<(), PersistenceError>;
    async fn load_binding(
        &self,
        user: &str,
        exchange: &str,
        queue: &str,
    ) -> Result<Option<BindingRecord>, PersistenceError>;
    async fn load_binding_keys(
        &self,
        user: &str,
    ) -> Result<Vec<(String, String)>, PersistenceError>;

    async fn save_message(
        &self,
        user: &str,
        queue: &str,
        message: &MessageRecord,
    ) -> Result<(), PersistenceError>;
    async fn delete_message(
        &self,
        user: &str,
        queue: &str,
        id: MessageId,
    ) -> Result<(), PersistenceError>;
    async fn load_message(
        &self,
        user: &str,
        queue: &str,
        id: MessageId,
    ) -> Result<Option<MessageRecord>, PersistenceError>;
    /// Ids in save order.
    async fn load_message_keys(
        &self,
        user: &str,
        queue: &str,
    ) -> Result<Vec<MessageId>, PersistenceError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, UserRecord>,
    queues: HashMap<(String, String), QueueRecord>,
    bindings: HashMap<(String, String, String), BindingRecord>,
    messages: HashMap<(String, String), BTreeMap<MessageId, MessageRecord>>,
}

/// In-process storage backend. Keeps every record in maps; writes can be made
/// to fail on demand to exercise rollback paths.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every save and delete returns an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn message_count(&self, user: &str, queue: &str) -> usize {
        self.state
            .lock()
            .messages
            .get(&(name_key(user), name_key(queue)))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_user(&self, user: &UserRecord) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state
            .lock()
            .users
            .insert(name_key(&user.name), user.clone());
        Ok(())
    }

    async fn delete_user(&self, user: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let key = name_key(user);
        let mut state = self.state.lock();
        state.users.remove(&key);
        state.queues.retain(|(u, _), _| *u != key);
        state.bindings.retain(|(u, _, _), _| *u != key);
        state.messages.retain(|(u, _), _| *u != key);
        Ok(())
    }

    async fn load_user(&self, user: &str) -> Result<Option<UserRecord>, PersistenceError> {
        Ok(self.state.lock().users.get(&name_key(user)).cloned())
    }

    async fn load_user_keys(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.state.lock().users.keys().cloned().collect())
    }

    async fn save_queue(&self, user: &str, queue: &QueueRecord) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state
            .lock()
            .queues
            .insert((name_key(user), name_key(&queue.name)), queue.clone());
        Ok(())
    }

    async fn delete_queue(&self, user: &str, queue: &str) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let key = (name_key(user), name_key(queue));
        let mut state = self.state.lock();
        state.queues.remove(&key);
        state.messages.remove(&key);
        Ok(())
    }

    async fn load_queue(
        &self,
        user: &str,
        queue: &str,
    ) -> Result<Option<QueueRecord>, PersistenceError> {
        Ok(self
            .state
            .lock()
            .queues
            .get(&(name_key(user), name_key(queue)))
            .cloned())
    }

    async fn load_queue_keys(&self, user: &str) -> Result<Vec<String>, PersistenceError> {
        let key = name_key(user);
        Ok(self
            .state
            .lock()
            .queues
            .keys()
            .filter(|(u, _)| *u == key)
            .map(|(_, q)| q.clone())
            .collect())
    }

    async fn save_binding(
        &self,
        user: &str,
        binding: &BindingRecord,
    ) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let key = (
            name_key(user),
            name_key(&binding.exchange),
            name_key(&binding.queue),
        );
        self.state.lock().bindings.insert(key, binding.clone());
        Ok(())
    }

    async fn delete_binding(
        &self,
        user: &str,
        exchange: &str,
        queue: &str,
    ) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let key = (name_key(user), name_key(exchange), name_key(queue));
        self.state.lock().bindings.remove(&key);
        Ok(())
    }

    async fn load_binding(
        &self,
        user: &str,
        exchange: &str,
        queue: &str,
    ) -> Result<Option<BindingRecord>, PersistenceError> {
        let key = (name_key(user), name_key(exchange), name_key(queue));
        Ok(self.state.lock().bindings.get(&key).cloned())
    }

    async fn load_binding_keys(
        &self,
        user: &str,
    ) -> Result<Vec<(String, String)>, PersistenceError> {
        let key = name_key(user);
        Ok(self
            .state
            .lock()
            .bindings
            .keys()
            .filter(|(u, _, _)| *u == key)
            .map(|(_, x, q)| (x.clone(), q.clone()))
            .collect())
    }

    async fn save_message(
        &self,
        user: &str,
        queue: &str,
        message: &MessageRecord,
    ) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.state
            .lock()
            .messages
            .entry((name_key(user), name_key(queue)))
            .or_default()
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn delete_message(
        &self,
        user: &str,
        queue: &str,
        id: MessageId,
    ) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let key = (name_key(user), name_key(queue));
        let mut state = self.state.lock();
        if let Some(node) = state.messages.get_mut(&key) {
            node.remove(&id);
            if node.is_empty() {
                state.messages.remove(&key);
            }
        }
        Ok(())
    }

    async fn load_message(
        &self,
        user: &str,
        queue: &str,
        id: MessageId,
    ) -> Result<Option<MessageRecord>, PersistenceError> {
        Ok(self
            .state
            .lock()
            .messages
            .get(&(name_key(user), name_key(queue)))
            .and_then(|node| node.get(&id))
            .cloned())
    }

    async fn load_message_keys(
        &self,
        user: &str,
        queue: &str,
    ) -> Result<Vec<MessageId>, PersistenceError> {
        Ok(self
            .state
            .lock()
            .messages
            .get(&(name_key(user), name_key(queue)))
            .map(|node| node.keys().copied().collect())
            .unwrap_or_default())
    }
}

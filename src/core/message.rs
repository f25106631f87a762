use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::client::ClientId;

pub type MessageId = u64;

/// How a message survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Persistence {
    /// Memory only.
    #[default]
    None,
    /// Kept in memory and saved to durable storage.
    MemoryAndDisk,
    /// Saved to durable storage; the in-memory payload is dropped after the save.
    DiskOnly,
}

impl Persistence {
    #[inline]
    pub fn is_persistent(self) -> bool {
        !matches!(self, Persistence::None)
    }
}

/// Where the reply to a request message has to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub client: ClientId,
    pub correlation_id: u64,
}

/// The in-flight unit moved between queues and subscribers.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub queue: String,
    pub routing_key: Option<String>,
    pub persistence: Persistence,
    pub request: bool,
    pub origin: Option<Origin>,
    /// `None` once a disk-only payload has been dropped from memory.
    pub payload: Option<Bytes>,
    /// Payload byte length, kept when the payload itself is dropped.
    pub size: u64,
    pub timestamp: u64,
    pub delivered: bool,
}

impl Message {
    pub fn new(queue: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let payload: Bytes = payload.into();
        Self {
            id: generate_id(),
            queue: queue.into(),
            routing_key: None,
            persistence: Persistence::None,
            request: false,
            origin: None,
            size: payload.len() as u64,
            payload: Some(payload),
            timestamp: current_timestamp(),
            delivered: false,
        }
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn as_request(mut self, origin: Origin) -> Self {
        self.request = true;
        self.origin = Some(origin);
        self
    }

    /// Copy for another fan-out target. Each copy gets its own id so durable
    /// records and pending confirmations never collide.
    pub fn clone_for(&self, queue: &str) -> Self {
        let mut copy = self.clone();
        copy.id = generate_id();
        copy.queue = queue.to_string();
        copy
    }

    #[inline]
    pub fn is_payload_loaded(&self) -> bool {
        self.payload.is_some()
    }

    /// Drops the in-memory payload of a disk-only message.
    pub fn release_payload(&mut self) {
        if self.persistence == Persistence::DiskOnly {
            self.payload = None;
        }
    }
}

pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generates a monotonically increasing u64 ID (fast, lock-free).
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
pub(crate) fn generate_id() -> MessageId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Restored ids must never be handed out again.
pub(crate) fn observe_id(id: MessageId) {
    NEXT_ID.fetch_max(id.saturating_add(1), Ordering::Relaxed);
}

//! Per-peer queue activity tables.
//!
//! A peer reports its queues as a batch: `Start`, any number of `Chunk`s,
//! `Finish`. `Start` marks every known entry outdated, chunks overwrite or
//! insert fresh entries, and `Finish` prunes whatever is still outdated. An
//! entry therefore survives a batch only if the batch mentioned it.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::binding::name_key;

use super::peer::PeerLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(Uuid);

impl ServerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// What a node announces about itself in `ServerActivity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub id: ServerId,
    pub address: String,
}

/// One queue as reported in a stats chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStat {
    pub user: String,
    pub queue: String,
    pub length: u64,
    pub subscriptions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsBatch {
    Start,
    Chunk(Vec<QueueStat>),
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveQueueStat {
    pub length: u64,
    pub subscriptions: usize,
    pub outdated: bool,
}

/// A peer's view of one queue, handed to strategies and hint receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerQueueStat {
    pub server: ServerId,
    pub address: String,
    pub length: u64,
    pub subscriptions: usize,
}

#[derive(Debug)]
pub struct ClusterServer {
    identity: ServerIdentity,
    queues: DashMap<(String, String), ActiveQueueStat>,
    link: Mutex<Option<Arc<dyn PeerLink>>>,
}

impl ClusterServer {
    pub fn new(identity: ServerIdentity) -> Self {
        Self {
            identity,
            queues: DashMap::new(),
            link: Mutex::new(None),
        }
    }

    #[inline]
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn link(&self) -> Option<Arc<dyn PeerLink>> {
        self.link.lock().clone()
    }

    pub(crate) fn set_link(&self, link: Option<Arc<dyn PeerLink>>) {
        *self.link.lock() = link;
    }

    pub fn stat(&self, user: &str, queue: &str) -> Option<ActiveQueueStat> {
        self.queues
            .get(&(name_key(user), name_key(queue)))
            .map(|e| *e.value())
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn begin_stats(&self) {
        for mut entry in self.queues.iter_mut() {
            entry.outdated = true;
        }
    }

    pub(crate) fn apply_chunk(&self, stats: Vec<QueueStat>) {
        for stat in stats {
            self.queues.insert(
                (name_key(&stat.user), name_key(&stat.queue)),
                ActiveQueueStat {
                    length: stat.length,
                    subscriptions: stat.subscriptions,
                    outdated: false,
                },
            );
        }
    }

    /// Drops entries the last batch did not refresh; returns how many.
    pub(crate) fn finish_stats(&self) -> usize {
        let before = self.queues.len();
        self.queues.retain(|_, stat| !stat.outdated);
        before - self.queues.len()
    }
}

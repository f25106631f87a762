use std::sync::Arc;

use dashmap::DashMap;
use regex::RegexBuilder;
use sha2::{Digest, Sha256};

use crate::core::binding::{name_key, Binding, BindingTable};
use crate::core::error::BrokerError;
use crate::core::message::Message;
use crate::core::persistence::UserRecord;
use crate::core::queue::Queue;

/// Hex-encoded SHA-256 of a password.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Aggregate view over a user's queues, summed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserStats {
    pub queues: usize,
    pub length: u64,
    pub volume: u64,
    pub memory_volume: u64,
    pub subscriptions: usize,
}

impl std::ops::AddAssign for UserStats {
    fn add_assign(&mut self, rhs: Self) {
        self.queues += rhs.queues;
        self.length += rhs.length;
        self.volume += rhs.volume;
        self.memory_volume += rhs.memory_volume;
        self.subscriptions += rhs.subscriptions;
    }
}

#[derive(Debug)]
pub struct User {
    name: String,
    admin: bool,
    password_hash: String,
    queues: DashMap<String, Arc<Queue>>,
    bindings: BindingTable,
}

impl User {
    pub fn new(name: impl Into<String>, password: &str, admin: bool) -> Self {
        Self::from_record(UserRecord {
            name: name.into(),
            admin,
            password_hash: hash_password(password),
        })
    }

    pub fn from_record(record: UserRecord) -> Self {
        Self {
            name: record.name,
            admin: record.admin,
            password_hash: record.password_hash,
            queues: DashMap::new(),
            bindings: BindingTable::new(),
        }
    }

    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            name: self.name.clone(),
            admin: self.admin,
            password_hash: self.password_hash.clone(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn password_matches(&self, password: &str) -> bool {
        self.password_hash == hash_password(password)
    }

    #[inline]
    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(&name_key(name)).map(|e| Arc::clone(&*e))
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub(crate) fn insert_queue(&self, queue: Arc<Queue>) -> Result<(), BrokerError> {
        use dashmap::mapref::entry::Entry;
        match self.queues.entry(name_key(queue.name())) {
            Entry::Occupied(_) => Err(BrokerError::QueueAlreadyExists(queue.name().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(queue);
                Ok(())
            }
        }
    }

    /// Removes `queue` only if the index still holds that exact instance.
    pub(crate) fn remove_queue(&self, queue: &Arc<Queue>) -> bool {
        self.queues
            .remove_if(&name_key(queue.name()), |_, current| Arc::ptr_eq(current, queue))
            .is_some()
    }

    /// Case-insensitive regex search over queue names; `None` lists all.
    pub fn search_queues(&self, pattern: Option<&str>) -> Result<Vec<Arc<Queue>>, BrokerError> {
        let matcher = match pattern {
            Some(p) => Some(
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| BrokerError::InvalidPattern {
                        pattern: p.to_string(),
                        reason: e.to_string(),
                    })?,
            ),
            None => None,
        };
        let mut found: Vec<Arc<Queue>> = self
            .queues
            .iter()
            .filter(|e| matcher.as_ref().map_or(true, |re| re.is_match(e.value().name())))
            .map(|e| Arc::clone(e.value()))
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(found)
    }

    /// Checks both ends of a binding and compiles it.
    pub fn validate_binding(
        &self,
        exchange: &str,
        queue: &str,
        durable: bool,
        pattern: Option<&str>,
    ) -> Result<Binding, BrokerError> {
        let x = self
            .queue(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        if !x.is_exchange() {
            return Err(BrokerError::NotAnExchange(exchange.to_string()));
        }
        let q = self
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if q.is_exchange() {
            return Err(BrokerError::QueueIsExchange(queue.to_string()));
        }
        if durable && !(x.is_durable() && q.is_durable()) {
            return Err(BrokerError::DurableBindingRequiresDurableQueues {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
            });
        }
        Binding::new(x.name(), q.name(), durable, pattern)
    }

    /// Resolves the queues a message sent to `queue` lands in.
    ///
    /// Plain queue: itself. Exchange: every bound queue whose pattern matches
    /// the routing key. Persistent messages require durable targets.
    pub fn resolve_targets(
        &self,
        queue: &Arc<Queue>,
        message: &Message,
    ) -> Result<Vec<Arc<Queue>>, BrokerError> {
        let targets = if queue.is_exchange() {
            let key = message.routing_key.as_deref();
            let targets: Vec<Arc<Queue>> = self
                .bindings
                .by_exchange(queue.name())
                .into_iter()
                .filter(|b| b.matches(key))
                .filter_map(|b| self.queue(b.queue()))
                .collect();
            if targets.is_empty() {
                return Err(BrokerError::ExchangeCannotRouteMessage(
                    queue.name().to_string(),
                ));
            }
            targets
        } else {
            vec![Arc::clone(queue)]
        };

        if message.persistence.is_persistent() {
            if let Some(target) = targets.iter().find(|q| !q.is_durable()) {
                return Err(BrokerError::PersistentMessageInNotDurableQueue(
                    target.name().to_string(),
                ));
            }
        }
        Ok(targets)
    }

    pub fn stats(&self) -> UserStats {
        self.queues.iter().fold(UserStats::default(), |mut acc, e| {
            let q = e.value();
            acc += UserStats {
                queues: 1,
                length: q.len(),
                volume: q.volume(),
                memory_volume: q.memory_volume(),
                subscriptions: q.subscription_count(),
            };
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Persistence;
    use crate::core::queue::{QueueOptions, QueueStatus};

    fn user_with(queues: &[(&str, bool, bool)]) -> User {
        let user = User::new("alice", "secret", false);
        for (name, durable, exchange) in queues {
            let q = Arc::new(Queue::new(
                "alice",
                *name,
                QueueOptions {
                    durable: *durable,
                    exchange: *exchange,
                    limit: None,
                },
            ));
            q.set_status(QueueStatus::Started);
            user.insert_queue(q).unwrap();
        }
        user
    }

    #[test]
    fn queue_names_are_case_insensitive_and_unique() {
        let user = user_with(&[("Orders", false, false)]);
        assert!(user.queue("orders").is_some());
        let dup = Arc::new(Queue::new("alice", "ORDERS", QueueOptions::default()));
        assert!(matches!(
            user.insert_queue(dup),
            Err(BrokerError::QueueAlreadyExists(_))
        ));
    }

    #[test]
    fn binding_validation_checks_both_ends() {
        let user = user_with(&[("x", true, true), ("q", false, false), ("d", true, false)]);
        assert!(matches!(
            user.validate_binding("q", "d", false, None),
            Err(BrokerError::NotAnExchange(_))
        ));
        assert!(matches!(
            user.validate_binding("x", "x", false, None),
            Err(BrokerError::QueueIsExchange(_))
        ));
        assert!(matches!(
            user.validate_binding("x", "q", true, None),
            Err(BrokerError::DurableBindingRequiresDurableQueues { .. })
        ));
        assert!(matches!(
            user.validate_binding("nope", "q", false, None),
            Err(BrokerError::ExchangeNotFound(_))
        ));
        assert!(matches!(
            user.validate_binding("x", "nope", false, None),
            Err(BrokerError::QueueNotFound(_))
        ));
        assert!(user.validate_binding("x", "d", true, None).is_ok());
    }

    #[test]
    fn exchange_resolution_filters_by_pattern() {
        let user = user_with(&[("x", false, true), ("eu", false, false), ("us", false, false)]);
        for (q, p) in [("eu", "^eu\\."), ("us", "^us\\.")] {
            let b = user.validate_binding("x", q, false, Some(p)).unwrap();
            user.bindings().add(b).unwrap();
        }
        let x = user.queue("x").unwrap();

        let eu = user
            .resolve_targets(&x, &Message::new("x", "m").with_routing_key("eu.paris"))
            .unwrap();
        assert_eq!(eu.len(), 1);
        assert_eq!(eu[0].name(), "eu");

        let none = user.resolve_targets(&x, &Message::new("x", "m").with_routing_key("asia"));
        assert!(matches!(
            none,
            Err(BrokerError::ExchangeCannotRouteMessage(_))
        ));
    }

    #[test]
    fn persistent_message_needs_durable_target() {
        let user = user_with(&[("plain", false, false)]);
        let q = user.queue("plain").unwrap();
        let msg = Message::new("plain", "x").with_persistence(Persistence::MemoryAndDisk);
        assert!(matches!(
            user.resolve_targets(&q, &msg),
            Err(BrokerError::PersistentMessageInNotDurableQueue(_))
        ));
    }

    #[test]
    fn search_is_case_insensitive() {
        let user = user_with(&[("Alpha", false, false), ("beta", false, false)]);
        let found = user.search_queues(Some("^al")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(user.search_queues(None).unwrap().len(), 2);
    }

    #[test]
    fn password_hash_is_checked() {
        let user = User::new("bob", "pw", true);
        assert!(user.password_matches("pw"));
        assert!(!user.password_matches("other"));
        assert!(user.is_admin());
    }
}

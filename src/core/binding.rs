//! Exchange ↔ queue binding index.
//!
//! Every binding is stored twice, under its exchange and under its queue.
//! Both sides are updated under one narrow per-user lock so readers never see
//! a half-inserted binding, and an index node left empty is pruned.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::core::error::BrokerError;

/// Lower-cased lookup key for queue and exchange names.
#[inline]
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}

#[derive(Debug)]
pub struct Binding {
    exchange: String,
    queue: String,
    durable: bool,
    pattern: Option<Regex>,
}

impl Binding {
    /// Compiles `pattern`; `None` matches every routing key.
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        durable: bool,
        pattern: Option<&str>,
    ) -> Result<Self, BrokerError> {
        let pattern = match pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| BrokerError::InvalidPattern {
                pattern: p.to_string(),
                reason: e.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            exchange: exchange.into(),
            queue: queue.into(),
            durable,
            pattern,
        })
    }

    #[inline]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[inline]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(|p| p.as_str())
    }

    /// A missing routing key is matched as the empty string.
    pub fn matches(&self, routing_key: Option<&str>) -> bool {
        match &self.pattern {
            None => true,
            Some(re) => re.is_match(routing_key.unwrap_or("")),
        }
    }
}

#[derive(Debug, Default)]
struct BindingIndex {
    by_exchange: HashMap<String, HashMap<String, Arc<Binding>>>,
    by_queue: HashMap<String, HashMap<String, Arc<Binding>>>,
}

impl BindingIndex {
    fn detach(&mut self, exchange_key: &str, queue_key: &str) -> Option<Arc<Binding>> {
        let removed = prune_remove(&mut self.by_exchange, exchange_key, queue_key)?;
        prune_remove(&mut self.by_queue, queue_key, exchange_key);
        Some(removed)
    }
}

fn prune_remove(
    side: &mut HashMap<String, HashMap<String, Arc<Binding>>>,
    outer: &str,
    inner: &str,
) -> Option<Arc<Binding>> {
    let node = side.get_mut(outer)?;
    let removed = node.remove(inner);
    if node.is_empty() {
        side.remove(outer);
    }
    removed
}

#[derive(Debug, Default)]
pub struct BindingTable {
    index: RwLock<BindingIndex>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, binding: Binding) -> Result<Arc<Binding>, BrokerError> {
        let exchange_key = name_key(&binding.exchange);
        let queue_key = name_key(&binding.queue);
        let binding = Arc::new(binding);

        let mut index = self.index.write();
        let exists = index
            .by_exchange
            .get(&exchange_key)
            .is_some_and(|node| node.contains_key(&queue_key));
        if exists {
            return Err(BrokerError::BindingAlreadyExists {
                exchange: binding.exchange.clone(),
                queue: binding.queue.clone(),
            });
        }

        index
            .by_exchange
            .entry(exchange_key.clone())
            .or_default()
            .insert(queue_key.clone(), binding.clone());
        index
            .by_queue
            .entry(queue_key)
            .or_default()
            .insert(exchange_key, binding.clone());
        Ok(binding)
    }

    pub fn remove(&self, exchange: &str, queue: &str) -> Result<Arc<Binding>, BrokerError> {
        self.index
            .write()
            .detach(&name_key(exchange), &name_key(queue))
            .ok_or_else(|| BrokerError::BindingNotFound {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
            })
    }

    pub fn get(&self, exchange: &str, queue: &str) -> Option<Arc<Binding>> {
        self.index
            .read()
            .by_exchange
            .get(&name_key(exchange))
            .and_then(|node| node.get(&name_key(queue)))
            .cloned()
    }

    pub fn by_exchange(&self, exchange: &str) -> Vec<Arc<Binding>> {
        self.index
            .read()
            .by_exchange
            .get(&name_key(exchange))
            .map(|node| node.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn by_queue(&self, queue: &str) -> Vec<Arc<Binding>> {
        self.index
            .read()
            .by_queue
            .get(&name_key(queue))
            .map(|node| node.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_exchange_entry(&self, exchange: &str) -> bool {
        self.index.read().by_exchange.contains_key(&name_key(exchange))
    }

    pub fn has_queue_entry(&self, queue: &str) -> bool {
        self.index.read().by_queue.contains_key(&name_key(queue))
    }

    /// Removes every binding where `name` is either end.
    pub fn remove_all_for(&self, name: &str) -> Vec<Arc<Binding>> {
        let key = name_key(name);
        let mut index = self.index.write();
        let mut pairs: Vec<(String, String)> = Vec::new();
        if let Some(node) = index.by_exchange.get(&key) {
            pairs.extend(node.keys().map(|q| (key.clone(), q.clone())));
        }
        if let Some(node) = index.by_queue.get(&key) {
            pairs.extend(node.keys().map(|x| (x.clone(), key.clone())));
        }
        pairs
            .into_iter()
            .filter_map(|(x, q)| index.detach(&x, &q))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().by_exchange.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<Binding>> {
        self.index
            .read()
            .by_exchange
            .values()
            .flat_map(|node| node.values().cloned())
            .collect()
    }
}

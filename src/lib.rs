//! RelayMQ – a multi-tenant message broker with exchanges, bounded queues,
//! request/reply and cluster-aware subscriptions.
//!
//! This crate exports
//!  * `core`    – queues, bindings, routing, subscriptions and the registry
//!  * `cluster` – peer discovery, stats exchange and subscriber steering
//!  * `broker`  – command dispatch and the runtime driving background loops
//!  * `config`  – TOML-driven runtime configuration
//!
//! Transports embed [`BrokerRuntime`] and feed decoded commands to
//! [`broker::handle`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod cluster;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::{BrokerRuntime, Command, HandlerContext, Response};
pub use config::{load_config, BrokerSettings, Config};
pub use core::error::BrokerError;
pub use core::storage::StorageRegistry;

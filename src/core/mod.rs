pub mod binding;
pub mod client;
pub mod error;
pub mod memory;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod routing;
pub mod storage;
pub mod subscriber;
pub mod user;

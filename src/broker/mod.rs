//! # Broker Module
//!
//! - `command`: typed client commands and their responses.
//! - `handlers`: authorization and dispatch of commands to the registry.
//! - `engine`: the runtime owning the registry and its background loops.

pub mod command;
pub mod engine;
pub mod handlers;

pub use self::command::{BindingInfo, Command, Response, SubscribeRequest};
pub use self::engine::BrokerRuntime;
pub use self::handlers::{handle, HandlerContext};

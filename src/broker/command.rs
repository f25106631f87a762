//! Commands accepted from clients and the responses they produce.
//!
//! Decoding from the wire happens in the transport; handlers only see these
//! typed values. The `try_*` flags suppress not-found errors on get/delete
//! and conflicts on add.

use std::time::Duration;

use bytes::Bytes;

use crate::cluster::{ServerIdentity, StatsBatch};
use crate::core::binding::Binding;
use crate::core::message::MessageId;
use crate::core::queue::{QueueInfo, QueueOptions};
use crate::core::routing::SendRequest;
use crate::core::subscriber::ClusterStrategy;

#[derive(Debug, Clone)]
pub enum Command {
    AddUser {
        name: String,
        password: String,
        admin: bool,
        try_add: bool,
    },
    DeleteUser {
        name: String,
        try_delete: bool,
    },
    AddQueue {
        name: String,
        options: QueueOptions,
        try_add: bool,
    },
    DeleteQueue {
        name: String,
        try_delete: bool,
    },
    ClearQueue {
        name: String,
    },
    GetQueue {
        name: String,
        try_get: bool,
    },
    SearchQueues {
        pattern: Option<String>,
    },
    AddBinding {
        exchange: String,
        queue: String,
        durable: bool,
        pattern: Option<String>,
        try_add: bool,
    },
    DeleteBinding {
        exchange: String,
        queue: String,
        try_delete: bool,
    },
    GetBinding {
        exchange: String,
        queue: String,
        try_get: bool,
    },
    Message(SendRequest),
    ConfirmMessage {
        message_id: MessageId,
        success: bool,
        data: Option<Bytes>,
    },
    Subscribe(SubscribeRequest),
    Unsubscribe {
        queue: String,
    },
    ServerActivity {
        identity: ServerIdentity,
    },
    ServerStats {
        from: ServerIdentity,
        batch: StatsBatch,
    },
}

impl Command {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddUser { .. } => "AddUser",
            Command::DeleteUser { .. } => "DeleteUser",
            Command::AddQueue { .. } => "AddQueue",
            Command::DeleteQueue { .. } => "DeleteQueue",
            Command::ClearQueue { .. } => "ClearQueue",
            Command::GetQueue { .. } => "GetQueue",
            Command::SearchQueues { .. } => "SearchQueues",
            Command::AddBinding { .. } => "AddBinding",
            Command::DeleteBinding { .. } => "DeleteBinding",
            Command::GetBinding { .. } => "GetBinding",
            Command::Message(_) => "Message",
            Command::ConfirmMessage { .. } => "ConfirmMessage",
            Command::Subscribe(_) => "Subscribe",
            Command::Unsubscribe { .. } => "Unsubscribe",
            Command::ServerActivity { .. } => "ServerActivity",
            Command::ServerStats { .. } => "ServerStats",
        }
    }
}

/// `Subscribe` parameters; unset durations fall back to configured defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub queue: String,
    pub confirm: bool,
    pub confirm_timeout: Option<Duration>,
    pub strategy: ClusterStrategy,
    pub idle_threshold: Option<Duration>,
}

impl SubscribeRequest {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            confirm: false,
            confirm_timeout: None,
            strategy: ClusterStrategy::Wait,
            idle_threshold: None,
        }
    }

    pub fn with_confirm(mut self, timeout: Duration) -> Self {
        self.confirm = true;
        self.confirm_timeout = Some(timeout);
        self
    }

    pub fn with_strategy(mut self, strategy: ClusterStrategy, idle_threshold: Duration) -> Self {
        self.strategy = strategy;
        self.idle_threshold = Some(idle_threshold);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub exchange: String,
    pub queue: String,
    pub durable: bool,
    pub pattern: Option<String>,
}

impl From<&Binding> for BindingInfo {
    fn from(binding: &Binding) -> Self {
        Self {
            exchange: binding.exchange().to_string(),
            queue: binding.queue().to_string(),
            durable: binding.is_durable(),
            pattern: binding.pattern().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    /// `None` when a `try_get` lookup found nothing.
    Queue(Option<QueueInfo>),
    Queues(Vec<QueueInfo>),
    Binding(Option<BindingInfo>),
    Server(ServerIdentity),
    /// No immediate response: a request message answered later by a reply
    /// event.
    Deferred,
}

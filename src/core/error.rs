use std::fmt;

use thiserror::Error;

use crate::core::persistence::PersistenceError;

/// Coarse classification of a [`BrokerError`], used by handlers to apply the
/// "try" suppression convention and by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Policy,
    ResourceExhausted,
    Authorization,
    Persistence,
    Unexpected,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Policy => "policy",
            ErrorCategory::ResourceExhausted => "resource-exhausted",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Persistence => "persistence",
            ErrorCategory::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("user '{0}' not found")]
    UserNotFound(String),
    #[error("queue '{0}' not found")]
    QueueNotFound(String),
    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),
    #[error("binding '{exchange}' -> '{queue}' not found")]
    BindingNotFound { exchange: String, queue: String },
    #[error("subscription to queue '{0}' not found")]
    SubscriptionNotFound(String),

    #[error("user '{0}' already exists")]
    UserAlreadyExists(String),
    #[error("queue '{0}' already exists")]
    QueueAlreadyExists(String),
    #[error("binding '{exchange}' -> '{queue}' already exists")]
    BindingAlreadyExists { exchange: String, queue: String },
    #[error("already subscribed to queue '{0}'")]
    SubscriptionAlreadyExists(String),

    #[error("queue '{0}' is not an exchange")]
    NotAnExchange(String),
    #[error("queue '{0}' is an exchange")]
    QueueIsExchange(String),
    #[error("durable binding '{exchange}' -> '{queue}' requires both ends to be durable")]
    DurableBindingRequiresDurableQueues { exchange: String, queue: String },
    #[error("persistent message cannot be stored in non-durable queue '{0}'")]
    PersistentMessageInNotDurableQueue(String),
    #[error("exchange '{0}' cannot route message: no binding matches")]
    ExchangeCannotRouteMessage(String),
    #[error("invalid routing pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid queue definition: {0}")]
    InvalidQueue(String),
    #[error("queue '{0}' is stopped")]
    QueueStopped(String),

    #[error("queue '{0}' length limit exceeded")]
    QueueLengthLimitExceeded(String),
    #[error("queue '{0}' volume limit exceeded")]
    QueueVolumeLimitExceeded(String),

    #[error("not authenticated")]
    NotAuthenticated,
    #[error("administrator rights required")]
    NotAdministrator,
    #[error("cluster administrator rights required")]
    NotClusterAdministrator,

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("client is disconnected")]
    Disconnected,
    #[error("cluster peer error: {0}")]
    Peer(String),
    #[error("unexpected handler error")]
    UnexpectedHandlerError,
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn category(&self) -> ErrorCategory {
        use BrokerError::*;
        match self {
            UserNotFound(_)
            | QueueNotFound(_)
            | ExchangeNotFound(_)
            | BindingNotFound { .. }
            | SubscriptionNotFound(_) => ErrorCategory::NotFound,

            UserAlreadyExists(_)
            | QueueAlreadyExists(_)
            | BindingAlreadyExists { .. }
            | SubscriptionAlreadyExists(_) => ErrorCategory::Conflict,

            NotAnExchange(_)
            | QueueIsExchange(_)
            | DurableBindingRequiresDurableQueues { .. }
            | PersistentMessageInNotDurableQueue(_)
            | ExchangeCannotRouteMessage(_)
            | InvalidPattern { .. }
            | InvalidQueue(_)
            | QueueStopped(_) => ErrorCategory::Policy,

            QueueLengthLimitExceeded(_) | QueueVolumeLimitExceeded(_) => {
                ErrorCategory::ResourceExhausted
            }

            NotAuthenticated | NotAdministrator | NotClusterAdministrator => {
                ErrorCategory::Authorization
            }

            Persistence(_) => ErrorCategory::Persistence,

            Disconnected | Peer(_) | UnexpectedHandlerError | Internal(_) => {
                ErrorCategory::Unexpected
            }
        }
    }

    /// Stable numeric code surfaced next to the message.
    pub fn code(&self) -> u16 {
        use BrokerError::*;
        match self {
            UserNotFound(_) => 1001,
            QueueNotFound(_) => 1002,
            ExchangeNotFound(_) => 1003,
            BindingNotFound { .. } => 1004,
            SubscriptionNotFound(_) => 1005,
            UserAlreadyExists(_) => 1101,
            QueueAlreadyExists(_) => 1102,
            BindingAlreadyExists { .. } => 1104,
            SubscriptionAlreadyExists(_) => 1105,
            NotAnExchange(_) => 1201,
            QueueIsExchange(_) => 1202,
            DurableBindingRequiresDurableQueues { .. } => 1203,
            PersistentMessageInNotDurableQueue(_) => 1204,
            ExchangeCannotRouteMessage(_) => 1205,
            InvalidPattern { .. } => 1206,
            InvalidQueue(_) => 1207,
            QueueStopped(_) => 1208,
            QueueLengthLimitExceeded(_) => 1301,
            QueueVolumeLimitExceeded(_) => 1302,
            NotAuthenticated => 1401,
            NotAdministrator => 1402,
            NotClusterAdministrator => 1403,
            Persistence(_) => 1501,
            Disconnected => 1901,
            Peer(_) => 1902,
            UnexpectedHandlerError => 1998,
            Internal(_) => 1999,
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    #[inline]
    pub fn is_conflict(&self) -> bool {
        self.category() == ErrorCategory::Conflict
    }
}

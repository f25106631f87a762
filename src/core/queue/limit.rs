use serde::{Deserialize, Serialize};

/// What a static limit counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Maximum number of buffered messages.
    Length(u64),
    /// Maximum number of buffered payload bytes.
    Volume(u64),
}

/// Policy applied to a send that would breach a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStrategy {
    /// Block the sender until the queue drains or its confirm timeout elapses.
    #[default]
    Delay,
    /// Fail the send.
    Reject,
    /// Accept the send and drop the message.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimit {
    pub kind: LimitKind,
    pub strategy: LimitStrategy,
}

impl QueueLimit {
    pub fn length(max: u64, strategy: LimitStrategy) -> Self {
        Self {
            kind: LimitKind::Length(max),
            strategy,
        }
    }

    pub fn volume(max_bytes: u64, strategy: LimitStrategy) -> Self {
        Self {
            kind: LimitKind::Volume(max_bytes),
            strategy,
        }
    }
}

/// Which limit fired, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    None,
    Length,
    Volume,
}

impl LimitExceeded {
    #[inline]
    pub fn is_exceeded(self) -> bool {
        !matches!(self, LimitExceeded::None)
    }
}

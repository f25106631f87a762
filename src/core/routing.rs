//! Message send path.
//!
//! A send resolves its queue (through the connection's last-queue cache),
//! expands exchanges into their matching bound queues, admits every target
//! against its limits, saves durable copies and finally enqueues one copy per
//! target. Request messages carry their origin so the delivering worker can
//! route the reply back.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::core::client::{ClientContext, ServerEvent};
use crate::core::error::BrokerError;
use crate::core::message::{Message, Origin, Persistence};
use crate::core::persistence::MessageRecord;
use crate::core::queue::{LimitExceeded, LimitStrategy, Queue, Reservation};
use crate::core::storage::StorageRegistry;
use crate::core::user::User;
use crate::metrics;

/// Parameters of a `Message` command.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub queue: String,
    pub routing_key: Option<String>,
    pub persistence: Persistence,
    /// The sender expects a reply carrying `correlation_id`.
    pub request: bool,
    pub correlation_id: u64,
    pub payload: Bytes,
    /// Bounds how long a `Delay` strategy may hold the sender.
    pub confirm_timeout: Duration,
}

impl SendRequest {
    pub fn new(queue: impl Into<String>, payload: impl Into<Bytes>, confirm_timeout: Duration) -> Self {
        Self {
            queue: queue.into(),
            routing_key: None,
            persistence: Persistence::None,
            request: false,
            correlation_id: 0,
            payload: payload.into(),
            confirm_timeout,
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

    pub fn as_request(mut self, correlation_id: u64) -> Self {
        self.request = true;
        self.correlation_id = correlation_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Enqueued into every target.
    Accepted,
    /// Dropped by a `Discard` limit or a `Delay` that timed out; the sender is
    /// not told apart from success.
    Consumed,
    /// Enqueued; the response is the reply produced at delivery.
    AwaitingReply,
}

enum Admission {
    Proceed(Reservation),
    Consumed,
}

pub struct RoutingCoordinator<'a> {
    registry: &'a StorageRegistry,
}

impl<'a> RoutingCoordinator<'a> {
    pub(crate) fn new(registry: &'a StorageRegistry) -> Self {
        Self { registry }
    }

    pub async fn send(
        &self,
        ctx: &ClientContext,
        request: SendRequest,
    ) -> Result<SendOutcome, BrokerError> {
        let user = ctx.require_user()?;
        let queue = self.resolve_queue(ctx, user, &request.queue)?;

        let mut message = Message::new(queue.name(), request.payload)
            .with_persistence(request.persistence);
        message.routing_key = request.routing_key;
        if request.request {
            message = message.as_request(Origin {
                client: ctx.id().clone(),
                correlation_id: request.correlation_id,
            });
        }

        let targets = user.resolve_targets(&queue, &message)?;
        metrics::inc_published(1);

        // Room is claimed on every target before anything is saved or
        // enqueued; dropping the claims gives it back.
        let deadline = Instant::now() + request.confirm_timeout;
        let mut reservations = Vec::with_capacity(targets.len());
        for target in &targets {
            match self.admit(target, message.size, deadline).await? {
                Admission::Proceed(reservation) => reservations.push(reservation),
                Admission::Consumed => return Ok(SendOutcome::Consumed),
            }
        }

        let copies = fan_out(message, &targets);
        if request.persistence.is_persistent() {
            self.save_copies(user, &copies).await?;
        }

        let mut enqueued = 0u64;
        let mut last_error = None;
        for (reservation, mut copy) in reservations.into_iter().zip(copies) {
            copy.release_payload();
            let target = Arc::clone(reservation.queue());
            match reservation.commit(copy) {
                Ok(()) => enqueued += 1,
                Err(err) => {
                    warn!(
                        target: "relaymq::routing",
                        queue = %target.name(),
                        error = %err,
                        "target stopped during send"
                    );
                    last_error = Some(err);
                }
            }
        }
        if enqueued == 0 {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        metrics::inc_enqueued(enqueued);
        trace!(
            target: "relaymq::routing",
            queue = %queue.name(),
            targets = enqueued,
            "message routed"
        );

        Ok(if request.request {
            SendOutcome::AwaitingReply
        } else {
            SendOutcome::Accepted
        })
    }

    fn resolve_queue(
        &self,
        ctx: &ClientContext,
        user: &User,
        name: &str,
    ) -> Result<Arc<Queue>, BrokerError> {
        if let Some(queue) = ctx.cached_queue(name) {
            return Ok(queue);
        }
        let queue = user
            .queue(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        if !queue.is_started() {
            return Err(BrokerError::QueueStopped(queue.name().to_string()));
        }
        ctx.remember_queue(&queue);
        Ok(queue)
    }

    /// Applies memory pressure and the queue's limit strategy for one
    /// message of `size` bytes, claiming room for it on success.
    async fn admit(
        &self,
        target: &Arc<Queue>,
        size: u64,
        deadline: Instant,
    ) -> Result<Admission, BrokerError> {
        let memory = self.registry.memory();
        if memory.under_pressure() && target.forced_limit().is_none() {
            let cap = memory.forced_limit_for(target.len());
            if target.force_limit(cap) {
                debug!(
                    target: "relaymq::routing",
                    queue = %target.name(),
                    cap,
                    "forced length cap installed"
                );
            }
        }

        loop {
            let exceeded = match target.try_reserve(size) {
                Ok(reservation) => return Ok(Admission::Proceed(reservation)),
                Err(exceeded) => exceeded,
            };
            // A forced cap on a queue without a static limit rejects.
            let strategy = target
                .limit()
                .map(|l| l.strategy)
                .unwrap_or(LimitStrategy::Reject);
            match strategy {
                LimitStrategy::Reject => {
                    metrics::inc_rejected(1);
                    return Err(match exceeded {
                        LimitExceeded::Volume => {
                            BrokerError::QueueVolumeLimitExceeded(target.name().to_string())
                        }
                        _ => BrokerError::QueueLengthLimitExceeded(target.name().to_string()),
                    });
                }
                LimitStrategy::Discard => {
                    metrics::inc_discarded(1);
                    return Ok(Admission::Consumed);
                }
                LimitStrategy::Delay => {
                    if target.status().is_terminal() {
                        return Err(BrokerError::QueueStopped(target.name().to_string()));
                    }
                    if !target.wait_for_capacity(size, deadline).await {
                        metrics::inc_delay_timeouts(1);
                        debug!(
                            target: "relaymq::routing",
                            queue = %target.name(),
                            "delayed send timed out; message consumed"
                        );
                        return Ok(Admission::Consumed);
                    }
                }
            }
        }
    }

    /// Saves one record per target. On failure the records already written
    /// are deleted again and nothing is enqueued.
    async fn save_copies(&self, user: &User, copies: &[Message]) -> Result<(), BrokerError> {
        let persistence = self.registry.persistence();
        for (saved, copy) in copies.iter().enumerate() {
            let record = MessageRecord::from_message(copy);
            if let Err(err) = persistence
                .save_message(user.name(), &copy.queue, &record)
                .await
            {
                for done in &copies[..saved] {
                    if let Err(undo) = persistence
                        .delete_message(user.name(), &done.queue, done.id)
                        .await
                    {
                        warn!(
                            target: "relaymq::routing",
                            queue = %done.queue,
                            id = done.id,
                            error = %undo,
                            "rollback of durable copy failed"
                        );
                    }
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Re-enqueues `message` at the tail of its queue, looked up by name so a
    /// recreated queue receives it. Limits are not applied and the durable
    /// copy is not written again. Returns `false` when the message is dropped.
    pub fn redeliver(&self, user: &User, mut message: Message) -> bool {
        let Some(queue) = user.queue(&message.queue) else {
            warn!(
                target: "relaymq::routing",
                queue = %message.queue,
                id = message.id,
                "queue gone; dropping redelivery"
            );
            return false;
        };
        message.release_payload();
        match queue.enqueue(message) {
            Ok(()) => {
                metrics::inc_redelivered(1);
                true
            }
            Err(err) => {
                warn!(
                    target: "relaymq::routing",
                    queue = %queue.name(),
                    error = %err,
                    "redelivery dropped"
                );
                false
            }
        }
    }

    /// Sends the reply for a confirmed request message to its origin, if that
    /// client is still connected.
    pub fn route_reply(&self, message: &Message, data: Option<Bytes>) -> bool {
        let Some(origin) = message.origin.as_ref() else {
            return false;
        };
        let delivered = self
            .registry
            .client(&origin.client)
            .map(|client| {
                client
                    .send(ServerEvent::Reply {
                        correlation_id: origin.correlation_id,
                        queue: message.queue.clone(),
                        payload: data,
                    })
                    .is_ok()
            })
            .unwrap_or(false);
        if delivered {
            metrics::inc_replies_routed(1);
        } else {
            metrics::inc_replies_dropped(1);
            debug!(
                target: "relaymq::routing",
                client = %origin.client,
                correlation_id = origin.correlation_id,
                "requesting client gone; reply dropped"
            );
        }
        delivered
    }
}

/// One message per target: the original goes to the first target, the rest
/// are copies with their own ids.
fn fan_out(mut message: Message, targets: &[Arc<Queue>]) -> Vec<Message> {
    let mut copies = Vec::with_capacity(targets.len());
    if let Some((first, rest)) = targets.split_first() {
        copies.extend(rest.iter().map(|t| message.clone_for(t.name())));
        message.queue = first.name().to_string();
        copies.insert(0, message);
    }
    copies
}

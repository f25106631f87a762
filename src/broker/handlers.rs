//! Command dispatch.
//!
//! One static match over [`Command`]; each arm checks authorization, calls
//! into the registry and maps the result. Panics inside a handler are caught
//! and surface as `UnexpectedHandlerError`, leaving the connection usable.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error};

use crate::core::client::{ClientContext, Confirmation};
use crate::core::error::{BrokerError, ErrorCategory};
use crate::core::routing::SendOutcome;
use crate::core::storage::StorageRegistry;
use crate::core::subscriber::SubscriptionOptions;
use crate::core::user::User;

use super::command::{BindingInfo, Command, Response, SubscribeRequest};

/// What every handler receives: the connection and the broker state.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub registry: Arc<StorageRegistry>,
    pub client: Arc<ClientContext>,
}

impl HandlerContext {
    pub fn new(registry: Arc<StorageRegistry>, client: Arc<ClientContext>) -> Self {
        Self { registry, client }
    }

    fn user(&self) -> Result<&Arc<User>, BrokerError> {
        self.client.require_user()
    }

    fn admin(&self) -> Result<&Arc<User>, BrokerError> {
        let user = self.user()?;
        if !user.is_admin() {
            return Err(BrokerError::NotAdministrator);
        }
        Ok(user)
    }

    /// Peer commands need an administrator on a clustered node.
    fn cluster_admin(&self) -> Result<(), BrokerError> {
        let user = self.user()?;
        if !user.is_admin() || self.registry.cluster().is_none() {
            return Err(BrokerError::NotClusterAdministrator);
        }
        Ok(())
    }
}

pub async fn handle(ctx: &HandlerContext, command: Command) -> Result<Response, BrokerError> {
    let name = command.name();
    let result = AssertUnwindSafe(dispatch(ctx, command))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(
                target: "relaymq::handlers",
                client = %ctx.client.id(),
                command = name,
                "handler panicked"
            );
            Err(BrokerError::UnexpectedHandlerError)
        });

    if let Err(err) = &result {
        if err.category() == ErrorCategory::Unexpected {
            error!(target: "relaymq::handlers", command = name, error = %err, "command failed");
        } else {
            debug!(target: "relaymq::handlers", command = name, error = %err, "command rejected");
        }
    }
    result
}

/// Applies the "try" convention: the suppressed category becomes `fallback`.
fn suppress(
    result: Result<Response, BrokerError>,
    enabled: bool,
    category: ErrorCategory,
    fallback: Response,
) -> Result<Response, BrokerError> {
    match result {
        Err(err) if enabled && err.category() == category => Ok(fallback),
        other => other,
    }
}

async fn dispatch(ctx: &HandlerContext, command: Command) -> Result<Response, BrokerError> {
    let registry = &ctx.registry;
    match command {
        Command::AddUser {
            name,
            password,
            admin,
            try_add,
        } => {
            ctx.admin()?;
            let result = registry
                .add_user(&name, &password, admin)
                .await
                .map(|_| Response::Ok);
            suppress(result, try_add, ErrorCategory::Conflict, Response::Ok)
        }
        Command::DeleteUser { name, try_delete } => {
            ctx.admin()?;
            let result = registry.delete_user(&name).await.map(|_| Response::Ok);
            suppress(result, try_delete, ErrorCategory::NotFound, Response::Ok)
        }
        Command::AddQueue {
            name,
            options,
            try_add,
        } => {
            let user = ctx.user()?;
            let result = registry
                .add_queue(user, &name, options)
                .await
                .map(|_| Response::Ok);
            suppress(result, try_add, ErrorCategory::Conflict, Response::Ok)
        }
        Command::DeleteQueue { name, try_delete } => {
            let user = ctx.user()?;
            let result = registry.delete_queue(user, &name).await.map(|_| Response::Ok);
            suppress(result, try_delete, ErrorCategory::NotFound, Response::Ok)
        }
        Command::ClearQueue { name } => {
            let user = ctx.user()?;
            registry.clear_queue(user, &name).await.map(|_| Response::Ok)
        }
        Command::GetQueue { name, try_get } => {
            let user = ctx.user()?;
            let result = registry
                .get_queue(user, &name)
                .map(|info| Response::Queue(Some(info)));
            suppress(result, try_get, ErrorCategory::NotFound, Response::Queue(None))
        }
        Command::SearchQueues { pattern } => {
            let user = ctx.user()?;
            registry
                .search_queues(user, pattern.as_deref())
                .map(Response::Queues)
        }
        Command::AddBinding {
            exchange,
            queue,
            durable,
            pattern,
            try_add,
        } => {
            let user = ctx.user()?;
            let result = registry
                .add_binding(user, &exchange, &queue, durable, pattern.as_deref())
                .await
                .map(|_| Response::Ok);
            suppress(result, try_add, ErrorCategory::Conflict, Response::Ok)
        }
        Command::DeleteBinding {
            exchange,
            queue,
            try_delete,
        } => {
            let user = ctx.user()?;
            let result = registry
                .delete_binding(user, &exchange, &queue)
                .await
                .map(|_| Response::Ok);
            suppress(result, try_delete, ErrorCategory::NotFound, Response::Ok)
        }
        Command::GetBinding {
            exchange,
            queue,
            try_get,
        } => {
            let user = ctx.user()?;
            let result = registry
                .get_binding(user, &exchange, &queue)
                .map(|b| Response::Binding(Some(BindingInfo::from(b.as_ref()))));
            suppress(result, try_get, ErrorCategory::NotFound, Response::Binding(None))
        }
        Command::Message(request) => {
            match registry.routing().send(&ctx.client, request).await? {
                SendOutcome::Accepted | SendOutcome::Consumed => Ok(Response::Ok),
                SendOutcome::AwaitingReply => Ok(Response::Deferred),
            }
        }
        Command::ConfirmMessage {
            message_id,
            success,
            data,
        } => {
            ctx.user()?;
            let confirmation = Confirmation { success, data };
            if !ctx.client.confirm(message_id, confirmation) {
                debug!(
                    target: "relaymq::handlers",
                    client = %ctx.client.id(),
                    id = message_id,
                    "confirmation for unknown or expired delivery"
                );
            }
            Ok(Response::Ok)
        }
        Command::Subscribe(request) => {
            ctx.user()?;
            let options = subscription_options(registry, &request);
            registry
                .subscribe(&ctx.client, &request.queue, options)
                .map(|_| Response::Ok)
        }
        Command::Unsubscribe { queue } => {
            ctx.user()?;
            registry
                .unsubscribe(&ctx.client, &queue)
                .await
                .map(|_| Response::Ok)
        }
        Command::ServerActivity { identity } => {
            ctx.cluster_admin()?;
            let cluster = registry
                .cluster()
                .ok_or(BrokerError::NotClusterAdministrator)?;
            Ok(Response::Server(cluster.handle_activity(identity)))
        }
        Command::ServerStats { from, batch } => {
            ctx.cluster_admin()?;
            let cluster = registry
                .cluster()
                .ok_or(BrokerError::NotClusterAdministrator)?;
            cluster.handle_stats(&from, batch);
            Ok(Response::Ok)
        }
    }
}

fn subscription_options(registry: &StorageRegistry, request: &SubscribeRequest) -> SubscriptionOptions {
    let settings = registry.settings();
    SubscriptionOptions::new(
        request
            .confirm_timeout
            .unwrap_or(settings.default_confirm_timeout),
        request
            .idle_threshold
            .unwrap_or(settings.default_idle_threshold),
    )
    .with_confirm(request.confirm)
    .with_strategy(request.strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSettings;
    use crate::core::persistence::MemoryPersistence;
    use crate::core::queue::QueueOptions;

    async fn context(admin: bool) -> HandlerContext {
        let registry = StorageRegistry::new(
            BrokerSettings::default(),
            Arc::new(MemoryPersistence::new()),
        );
        let user = registry.add_user("alice", "pw", admin).await.unwrap();
        let (client, _rx) = registry.connect_client(Some(user));
        HandlerContext::new(registry, client)
    }

    fn add_queue(name: &str, try_add: bool) -> Command {
        Command::AddQueue {
            name: name.into(),
            options: QueueOptions::default(),
            try_add,
        }
    }

    #[tokio::test]
    async fn try_flags_suppress_conflicts_and_missing_entities() {
        let ctx = context(false).await;
        handle(&ctx, add_queue("q", false)).await.unwrap();

        let dup = handle(&ctx, add_queue("q", false)).await.unwrap_err();
        assert!(matches!(dup, BrokerError::QueueAlreadyExists(_)));
        assert_eq!(handle(&ctx, add_queue("q", true)).await.unwrap(), Response::Ok);

        let get = Command::GetQueue {
            name: "missing".into(),
            try_get: true,
        };
        assert_eq!(handle(&ctx, get).await.unwrap(), Response::Queue(None));

        let delete = Command::DeleteQueue {
            name: "missing".into(),
            try_delete: true,
        };
        assert_eq!(handle(&ctx, delete).await.unwrap(), Response::Ok);
    }

    #[tokio::test]
    async fn user_management_requires_administrator() {
        let ctx = context(false).await;
        let err = handle(
            &ctx,
            Command::AddUser {
                name: "bob".into(),
                password: "pw".into(),
                admin: false,
                try_add: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BrokerError::NotAdministrator));
    }

    #[tokio::test]
    async fn anonymous_client_is_not_authenticated() {
        let ctx = context(true).await;
        let (anonymous, _rx) = ctx.registry.connect_client(None);
        let anon = HandlerContext::new(ctx.registry.clone(), anonymous);
        let err = handle(&anon, Command::SearchQueues { pattern: None })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotAuthenticated));
    }

    #[tokio::test]
    async fn cluster_commands_need_clustered_admin() {
        let ctx = context(true).await;
        let identity = crate::cluster::ServerIdentity {
            id: crate::cluster::ServerId::generate(),
            address: "peer:1".into(),
        };
        let err = handle(&ctx, Command::ServerActivity { identity })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotClusterAdministrator));
    }
}

use anyhow::Context;
use futures_util::future::{pending, FutureExt};
use futures_util::stream::StreamExt;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::handler::{ClosureHandler, Handler};
use crate::codec;
use crate::envelope::{Envelope, IncomingEnvelope};
use crate::pool::{Manager, Object, PoolError, ResourcePool};
use crate::transport::{
    BrokerChannel, BrokerConnection, Delivery, MessageProperties, QueueOptions, TransportError,
};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Lifecycle of an [`RpcServer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Not listening.
    Stopped,
    /// Setting up a session.
    Starting,
    /// Consuming the command queue.
    Listening,
    /// The broker connection was lost: waiting before setting up a new session.
    Reconnecting,
}

/// Dispatches the requests published on a queue to the registered command [`Handler`]s and
/// publishes their results back to the callers.
///
/// # Fault tolerance
///
/// If the broker connection goes away while listening, the server discards it and starts over
/// with a fresh pooled connection after a fixed delay, forever.
/// Only a failure to set up the very first session is returned to the caller.
///
/// # Delivery guarantees
///
/// Messages are processed one at a time and acked after the reply has been published, so a
/// request is processed at least once. Requests that cannot be dispatched (undecodable body,
/// empty command, missing data) or answered (no `reply_to`) are dropped.
///
/// # How do I build an `RpcServer`?
///
/// The starting point is [`RpcServer::builder`].
pub struct RpcServer<M: Manager> {
    pool: ResourcePool<M>,
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ServerState>>,
}

impl<M: Manager> Clone for RpcServer<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            handlers: Arc::clone(&self.handlers),
            reconnect_delay: self.reconnect_delay,
            state: Arc::clone(&self.state),
        }
    }
}

/// Error returned by [`RpcServer::listen`].
#[derive(thiserror::Error, Debug)]
pub enum RpcServerError {
    #[error("Invalid server configuration: {0}")]
    Configuration(String),
    #[error("Failed to get a connection to the broker")]
    Pool(#[from] PoolError),
    #[error("Failed to set up the command queue consumer")]
    Transport(#[from] TransportError),
}

/// How a listening session came to an end.
enum SessionEnd {
    Shutdown,
    Lost(String),
}

impl<M> RpcServer<M>
where
    M: Manager,
    M::Type: BrokerConnection,
{
    /// Start building an [`RpcServer`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use carrot_rpc::pool::ResourcePool;
    /// use carrot_rpc::server::RpcServer;
    /// use carrot_rpc::transport::memory::InMemoryBroker;
    /// use serde_json::{json, Value};
    ///
    /// pub async fn serve() -> anyhow::Result<()> {
    ///     let pool = ResourcePool::builder(InMemoryBroker::new()).build()?;
    ///     let server = RpcServer::builder(pool)
    ///         .handle("ping", |_data: Value| async {
    ///             Ok::<_, anyhow::Error>(json!({"pong": true}))
    ///         })
    ///         .build();
    ///
    ///     server.listen("rpc_queue").await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn builder(pool: ResourcePool<M>) -> RpcServerBuilder<M> {
        RpcServerBuilder {
            pool,
            handlers: HashMap::new(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Whether a handler is registered for `command`.
    pub fn handles(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Consume `queue` and serve requests until the process ends.
    pub async fn listen(&self, queue: &str) -> Result<(), RpcServerError> {
        self.listen_until_shutdown(queue, pending()).await
    }

    /// Consume `queue` and serve requests until `shutdown` resolves.
    ///
    /// The request being processed when `shutdown` resolves is completed first.
    #[tracing::instrument(name = "rpc_server_listen", skip(self, shutdown))]
    pub async fn listen_until_shutdown(
        &self,
        queue: &str,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), RpcServerError> {
        if queue.is_empty() {
            return Err(RpcServerError::Configuration(
                "the queue name cannot be empty".into(),
            ));
        }

        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        self.state.send_replace(ServerState::Starting);
        let mut established = false;
        let outcome = loop {
            let reason = match self.session(queue, &mut shutdown, &mut established).await {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Ok(SessionEnd::Lost(reason)) => reason,
                Err(RpcServerError::Pool(PoolError::Closed)) => {
                    break Err(RpcServerError::Pool(PoolError::Closed))
                }
                Err(e) if !established => break Err(e),
                Err(e) => format!("{:#}", anyhow::Error::from(e)),
            };

            warn!(
                %reason,
                delay = ?self.reconnect_delay,
                "Lost the broker connection, reconnecting after a delay"
            );
            self.state.send_replace(ServerState::Reconnecting);
            tokio::select! {
                biased;
                _ = &mut shutdown => break Ok(()),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
            self.state.send_replace(ServerState::Starting);
        };

        self.state.send_replace(ServerState::Stopped);
        outcome
    }

    /// Run a single consuming session on a fresh pooled connection.
    ///
    /// `Err` means the session could not be set up.
    async fn session<F>(
        &self,
        queue: &str,
        shutdown: &mut F,
        established: &mut bool,
    ) -> Result<SessionEnd, RpcServerError>
    where
        F: Future<Output = ()> + Unpin,
    {
        let connection = tokio::select! {
            biased;
            _ = &mut *shutdown => return Ok(SessionEnd::Shutdown),
            connection = self.pool.get() => connection?,
        };
        // Dropped at the end of the session, so no listener outlives its connection.
        let mut status = connection.watch_status();
        let setup = async {
            let channel = connection.create_channel().await?;
            channel
                .declare_queue(queue, QueueOptions::command_queue())
                .await?;
            channel.set_prefetch(1).await?;
            let consumer_tag = format!("rpc-server-{}", Uuid::new_v4());
            let deliveries = channel.consume(queue, &consumer_tag).await?;
            Ok::<_, TransportError>((channel, deliveries))
        };
        let (channel, mut deliveries) = match setup.await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.pool.release(connection).await;
                return Err(e.into());
            }
        };
        *established = true;
        self.state.send_replace(ServerState::Listening);
        info!("Listening for requests");

        let end = loop {
            tokio::select! {
                biased;
                _ = &mut *shutdown => break SessionEnd::Shutdown,
                changed = status.changed() => {
                    let current = status.borrow().clone();
                    if changed.is_err() || !current.is_open() {
                        break SessionEnd::Lost(format!("connection status: {:?}", current));
                    }
                }
                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) => self.process(&channel, delivery).await,
                    Some(Err(e)) => break SessionEnd::Lost(format!("{:#}", anyhow::Error::from(e))),
                    None => break SessionEnd::Lost("the consumer was cancelled".into()),
                },
            }
        };
        drop(status);
        drop(deliveries);

        match &end {
            SessionEnd::Shutdown => {
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "Failed to close the server channel");
                }
                self.pool.release(connection).await;
            }
            SessionEnd::Lost(_) => {
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "Failed to close the server channel");
                }
                Object::discard(connection).await;
            }
        }
        Ok(end)
    }

    /// Decode a request, dispatch it, publish the reply and settle the message.
    #[tracing::instrument(
        name = "rpc_process",
        skip_all,
        fields(delivery_tag = delivery.delivery_tag, command = tracing::field::Empty)
    )]
    async fn process<C: BrokerChannel>(&self, channel: &C, delivery: Delivery) {
        let envelope = match codec::unzip::<IncomingEnvelope>(&delivery.data) {
            Ok(incoming) => incoming.into_dispatchable(),
            Err(e) => {
                warn!(error = ?e, "Failed to decode the request");
                None
            }
        };
        let Some(Envelope { command, data }) = envelope else {
            warn!("Dropping a request without a command or data");
            if let Err(e) = delivery.nack(false).await {
                error!(error = %e, "Failed to nack the request");
            }
            return;
        };
        tracing::Span::current().record("command", command.as_str());

        let result = self.dispatch(&command, data).await;
        match reply(channel, &delivery, command, result).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(error = %e, "Failed to ack the request");
                }
            }
            Err(e) => {
                error!(error = ?e, "Failed to reply, dropping the request");
                if let Err(e) = delivery.nack(false).await {
                    error!(error = %e, "Failed to nack the request");
                }
            }
        }
    }

    async fn dispatch(&self, command: &str, data: Value) -> Value {
        let Some(handler) = self.handlers.get(command) else {
            warn!("No handler registered for the command");
            return json!({ "error": format!("Unknown method: {}", command) });
        };
        match AssertUnwindSafe(handler.handle(data)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = ?e, "The handler failed");
                json!({ "error": e.to_string() })
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%message, "The handler panicked");
                json!({ "error": message })
            }
        }
    }
}

async fn reply<C: BrokerChannel>(
    channel: &C,
    delivery: &Delivery,
    command: String,
    data: Value,
) -> Result<(), anyhow::Error> {
    let reply_to = delivery
        .properties
        .reply_to
        .as_deref()
        .filter(|queue| !queue.is_empty())
        .context("The request has no reply_to queue")?;
    let body = codec::zip(&Envelope { command, data })?;
    channel
        .publish(
            reply_to,
            &body,
            MessageProperties::reply(delivery.properties.correlation_id.clone()),
        )
        .await?;
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "The handler panicked".to_owned()
    }
}

/// A builder for [`RpcServer`].
///
/// Use [`RpcServer::builder`] as entrypoint.
pub struct RpcServerBuilder<M: Manager> {
    pool: ResourcePool<M>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    reconnect_delay: Duration,
}

impl<M: Manager> RpcServerBuilder<M> {
    /// Register an async closure as the handler of `command`.
    ///
    /// Registering the same command twice replaces the first handler.
    /// An empty command is ignored, since no request can ever carry it.
    #[must_use]
    pub fn handle<F, Fut, E>(self, command: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.handle_with(command, ClosureHandler(handler))
    }

    /// Register a [`Handler`] for `command`, see [`RpcServerBuilder::handle`].
    #[must_use]
    pub fn handle_with<H: Handler>(mut self, command: impl Into<String>, handler: H) -> Self {
        let command = command.into();
        if command.is_empty() {
            warn!("Ignoring a handler registered for an empty command");
            return self;
        }
        if self
            .handlers
            .insert(command.clone(), Arc::new(handler))
            .is_some()
        {
            warn!(%command, "A handler was already registered for this command, replacing it");
        }
        self
    }

    /// Delay between losing the broker connection and trying to listen again.
    /// Defaults to 5 seconds if left unspecified.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Finalise the builder and get an instance of [`RpcServer`].
    pub fn build(self) -> RpcServer<M> {
        RpcServer {
            pool: self.pool,
            handlers: Arc::new(self.handlers),
            reconnect_delay: self.reconnect_delay,
            state: Arc::new(watch::channel(ServerState::Stopped).0),
        }
    }
}

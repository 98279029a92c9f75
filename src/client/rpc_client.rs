use futures_util::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SendRequest, DEFAULT_QUEUE};
use crate::codec::{self, CodecError};
use crate::envelope::TimeoutReply;
use crate::pool::{Manager, PoolError, ResourcePool};
use crate::transport::{
    BrokerChannel, BrokerConnection, DeliveryStream, MessageProperties, QueueOptions,
    TransportError,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// A high-level interface to call commands exposed by an [`RpcServer`](crate::server::RpcServer).
///
/// Every call gets its own channel and its own exclusive reply queue, both gone by the time
/// the call returns. Connections are borrowed from a [`ResourcePool`] and given back exactly
/// once, whatever the outcome of the call.
///
/// # How do I build an `RpcClient`?
///
/// Use [`RpcClient::new`] for the defaults, or start from [`RpcClient::builder`].
pub struct RpcClient<M: Manager> {
    pool: ResourcePool<M>,
    /// Applied to requests that do not specify a timeout.
    default_timeout: Duration,
}

impl<M: Manager> Clone for RpcClient<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            default_timeout: self.default_timeout,
        }
    }
}

/// Error returned when an RPC call made with [`RpcClient`] fails.
#[derive(thiserror::Error, Debug)]
pub enum RpcClientError {
    #[error("Invalid request: {0}")]
    Configuration(String),
    #[error("Failed to get a connection to the broker")]
    Pool(#[from] PoolError),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{}", .0.message)]
    Timeout(TimeoutReply),
    #[error("The reply queue was closed before a reply arrived")]
    ReplyStreamClosed,
}

impl<M> RpcClient<M>
where
    M: Manager,
    M::Type: BrokerConnection,
{
    /// An `RpcClient` with a 15 seconds default timeout.
    pub fn new(pool: ResourcePool<M>) -> Self {
        Self::builder(pool).build()
    }

    /// Start building an [`RpcClient`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use carrot_rpc::client::RpcClient;
    /// use carrot_rpc::pool::ResourcePool;
    /// use carrot_rpc::transport::memory::InMemoryBroker;
    ///
    /// pub fn get_client() -> anyhow::Result<RpcClient<InMemoryBroker>> {
    ///     let pool = ResourcePool::builder(InMemoryBroker::new())
    ///         .max_size(2)
    ///         .build()?;
    ///
    ///     Ok(RpcClient::builder(pool)
    ///         .default_timeout(std::time::Duration::from_secs(3))
    ///         .build())
    /// }
    /// ```
    pub fn builder(pool: ResourcePool<M>) -> RpcClientBuilder<M> {
        RpcClientBuilder {
            pool,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Send a request and wait for its reply.
    ///
    /// It returns the `data` field of the reply envelope, i.e. whatever the remote handler
    /// returned (handler failures come back as `{"error": <message>}`).
    /// If no reply arrives in time it fails with [`RpcClientError::Timeout`].
    #[tracing::instrument(
        name = "rpc_send",
        skip_all,
        fields(command = %request.command(), queue = tracing::field::Empty)
    )]
    pub async fn send(&self, request: SendRequest) -> Result<Value, RpcClientError> {
        let SendRequest {
            to,
            message,
            timeout,
        } = request;
        let queue = match to {
            Some(queue) if !queue.is_empty() => queue,
            _ => DEFAULT_QUEUE.to_owned(),
        };
        tracing::Span::current().record("queue", queue.as_str());

        let timeout = timeout.unwrap_or(self.default_timeout);
        if timeout.is_zero() {
            return Err(RpcClientError::Configuration(
                "the timeout must be greater than zero".into(),
            ));
        }
        let payload = codec::zip(&message)?;

        let connection = self.pool.get().await?;
        let outcome = match connection.create_channel().await {
            Ok(channel) => {
                let outcome = exchange(&channel, &queue, &payload, timeout).await;
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "Failed to close the RPC client channel");
                }
                outcome
            }
            Err(e) => Err(e.into()),
        };
        self.pool.release(connection).await;
        outcome
    }

    /// Call `command` with a typed payload and deserialize the reply into `Resp`.
    pub async fn call<Req, Resp>(
        &self,
        queue: &str,
        command: &str,
        data: &Req,
    ) -> Result<Resp, RpcClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = serde_json::to_value(data).map_err(|e| CodecError::Compression(e.into()))?;
        let reply = self.send(SendRequest::new(command, data).to(queue)).await?;
        serde_json::from_value(reply)
            .map_err(|e| RpcClientError::Codec(CodecError::Decompression(e.into())))
    }

    pub fn pool(&self) -> &ResourcePool<M> {
        &self.pool
    }
}

/// A builder for [`RpcClient`].
///
/// Use [`RpcClient::builder`] as entrypoint.
pub struct RpcClientBuilder<M: Manager> {
    pool: ResourcePool<M>,
    default_timeout: Duration,
}

impl<M: Manager> RpcClientBuilder<M> {
    /// Timeout applied to requests that do not specify one.
    /// Defaults to 15 seconds if left unspecified.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Finalise the builder and get an instance of [`RpcClient`].
    pub fn build(self) -> RpcClient<M> {
        RpcClient {
            pool: self.pool,
            default_timeout: self.default_timeout,
        }
    }
}

/// Publish the request and wait for the matching reply, or for the timeout to elapse.
async fn exchange<C: BrokerChannel>(
    channel: &C,
    queue: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<Value, RpcClientError> {
    let reply_queue = channel
        .declare_queue("", QueueOptions::reply_queue())
        .await?;
    let consumer_tag = format!("rpc-client-{}", Uuid::new_v4());
    let mut replies = channel.consume(&reply_queue, &consumer_tag).await?;

    let correlation_id = Uuid::new_v4().to_string();
    channel
        .publish(
            queue,
            payload,
            MessageProperties::request(reply_queue, correlation_id.clone()),
        )
        .await?;

    match tokio::time::timeout(timeout, wait_for_reply(&mut replies, &correlation_id)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(?timeout, "No reply received before the timeout");
            if let Err(e) = channel.cancel(&consumer_tag).await {
                debug!(error = %e, "Failed to cancel the reply consumer");
            }
            Err(RpcClientError::Timeout(TimeoutReply::default()))
        }
    }
}

async fn wait_for_reply(
    replies: &mut DeliveryStream,
    correlation_id: &str,
) -> Result<Value, RpcClientError> {
    while let Some(delivery) = replies.next().await {
        let delivery = delivery?;
        if delivery.properties.correlation_id.as_deref() != Some(correlation_id) {
            debug!(
                delivery_tag = delivery.delivery_tag,
                "Ignoring a reply that belongs to another call"
            );
            delivery.ack().await?;
            continue;
        }

        return match codec::unzip::<Value>(&delivery.data) {
            Ok(body) => {
                delivery.ack().await?;
                Ok(reply_data(body))
            }
            Err(e) => {
                delivery.nack(false).await?;
                Err(e.into())
            }
        };
    }
    Err(RpcClientError::ReplyStreamClosed)
}

/// The `data` field of a reply envelope. Other bodies are returned untouched.
fn reply_data(body: Value) -> Value {
    match body {
        Value::Object(mut envelope)
            if envelope.contains_key("command") && envelope.contains_key("data") =>
        {
            envelope.remove("data").unwrap_or_default()
        }
        other => other,
    }
}

//! The broker seam used by [`RpcClient`] and [`RpcServer`].
//!
//! [`BrokerConnection`] and [`BrokerChannel`] describe the handful of AMQP operations the RPC
//! protocol needs: declaring queues, publishing to a queue through the default exchange,
//! consuming, acking/nacking and closing.
//!
//! Two implementations ship with the crate:
//! - [`AmqpConnection`](crate::amqp::AmqpConnection), backed by [`lapin`];
//! - [`memory::InMemoryBroker`], an in-process broker for tests and local development.
//!
//! [`RpcClient`]: crate::client::RpcClient
//! [`RpcServer`]: crate::server::RpcServer
use futures_util::stream::BoxStream;
use std::fmt;
use tokio::sync::watch;

pub mod memory;

/// Transport error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct TransportError(#[from] anyhow::Error);

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}

impl TransportError {
    pub(crate) fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(anyhow::Error::msg(message))
    }
}

/// Lifecycle of a broker connection, as observed through [`BrokerConnection::watch_status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    /// The connection was lost or errored out. The payload describes the cause.
    Failed(String),
    /// The connection was closed on purpose.
    Closed,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// The transport-level properties the RPC protocol relies on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// The queue the receiver should publish its reply to.
    pub reply_to: Option<String>,
    /// Opaque token pairing a request with its reply.
    pub correlation_id: Option<String>,
}

impl MessageProperties {
    /// Properties of an outbound request.
    pub fn request(reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Properties of a reply to a request carrying `correlation_id`.
    pub fn reply(correlation_id: Option<String>) -> Self {
        Self {
            reply_to: None,
            correlation_id,
        }
    }
}

/// Flags used when declaring a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A per-call reply queue: owned by the declaring channel and deleted with it.
    pub fn reply_queue() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// A shared command queue, consumed by every server instance of a service.
    pub fn command_queue() -> Self {
        Self {
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Settles a [`Delivery`] with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message pushed by the broker to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub properties: MessageProperties,
    /// The payload of the message in binary format.
    pub data: Vec<u8>,
    pub(crate) acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        properties: MessageProperties,
        data: Vec<u8>,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            delivery_tag,
            properties,
            data,
            acker,
        }
    }

    /// Acknowledge the message: the broker forgets about it.
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the message, optionally asking the broker to requeue it.
    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("properties", &self.properties)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Messages pushed to a consumer. The stream ends when the consumer is cancelled or its
/// channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// A connection to a broker. Channels are multiplexed over it.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel, TransportError>;

    /// Current status of the connection.
    fn status(&self) -> ConnectionStatus;

    /// Subscribe to status changes.
    ///
    /// Dropping the receiver detaches the listener.
    fn watch_status(&self) -> watch::Receiver<ConnectionStatus>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel opened on a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare a queue and return its name.
    ///
    /// An empty `name` asks the broker to generate one.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
        -> Result<String, TransportError>;

    /// Maximum number of unacknowledged deliveries this channel may hold.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Publish `payload` to `queue` through the default exchange.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError>;

    /// Start consuming `queue`. Deliveries must be acked explicitly.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

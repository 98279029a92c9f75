//! [`lapin`]-backed implementation of the broker seam.
use std::fmt;
use std::sync::Arc;

use amq_protocol_types::FieldTable;
use futures_util::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use tokio::sync::watch;
use tracing::warn;

use crate::transport::{
    Acknowledge, BrokerChannel, BrokerConnection, ConnectionStatus, Delivery, DeliveryStream,
    MessageProperties, QueueOptions, TransportError,
};

// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// An AMQP connection, established by a [`ConnectionFactory`](super::ConnectionFactory).
pub struct AmqpConnection {
    inner: lapin::Connection,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl AmqpConnection {
    pub(crate) fn new(inner: lapin::Connection) -> Self {
        let status = Arc::new(watch::channel(ConnectionStatus::Open).0);
        let on_error_status = Arc::clone(&status);
        // Register a callback to log connection errors.
        inner.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            on_error_status.send_replace(ConnectionStatus::Failed(e.to_string()));
        });
        Self { inner, status }
    }

    /// The underlying [`lapin::Connection`].
    pub fn inner(&self) -> &lapin::Connection {
        &self.inner
    }
}

impl fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("status", &self.status())
            .finish()
    }
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<AmqpChannel, TransportError> {
        Ok(AmqpChannel {
            inner: self.inner.create_channel().await?,
        })
    }

    fn status(&self) -> ConnectionStatus {
        let reported = self.status.borrow().clone();
        if reported.is_open() && !self.inner.status().connected() {
            return ConnectionStatus::Failed("The connection is no longer connected".into());
        }
        reported
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "Bye").await?;
        }
        self.status.send_if_modified(|status| {
            if status.is_open() {
                *status = ConnectionStatus::Closed;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// An AMQP channel.
pub struct AmqpChannel {
    inner: lapin::Channel,
}

impl AmqpChannel {
    /// The underlying [`lapin::Channel`].
    pub fn inner(&self) -> &lapin::Channel {
        &self.inner
    }
}

impl fmt::Debug for AmqpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpChannel")
            .field("id", &self.inner.id())
            .finish()
    }
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        Ok(self
            .inner
            .basic_qos(count, BasicQosOptions::default())
            .await?)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties.into(),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(TransportError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        Ok(self
            .inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "Bye").await?;
        }
        Ok(())
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        Ok(self.0.ack(BasicAckOptions::default()).await?)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        Ok(self
            .0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?)
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery::new(
            delivery.delivery_tag,
            MessageProperties::from(&delivery.properties),
            delivery.data,
            Box::new(LapinAcker(delivery.acker)),
        )
    }
}

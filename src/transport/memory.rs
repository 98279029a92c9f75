//! An in-process broker.
//!
//! [`InMemoryBroker`] implements the subset of AMQP 0.9.1 semantics the RPC protocol relies on:
//! the default exchange, exclusive and auto-delete queues, server-named queues, round-robin
//! delivery to consumers, per-channel prefetch, acks and nacks (with or without requeue),
//! requeueing of unacknowledged messages when a channel goes away.
//!
//! It also exposes a few inspection and fault-injection helpers, which makes it handy to test
//! code built on top of [`RpcClient`](crate::client::RpcClient) and
//! [`RpcServer`](crate::server::RpcServer) without a running RabbitMQ.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use super::{
    Acknowledge, BrokerChannel, BrokerConnection, ConnectionStatus, Delivery, DeliveryStream,
    MessageProperties, QueueOptions, TransportError,
};
use crate::pool::Manager;

/// A broker living in the memory of the current process.
///
/// Clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryBroker")
            .field("queues", &state.queues.len())
            .field("open_connections", &state.connections.len())
            .field("open_channels", &state.channels.len())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new_cyclic(|me| Mutex::new(BrokerState::new(me.clone()))),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Open a new connection.
    ///
    /// Fails if the broker was made unreachable with [`InMemoryBroker::set_reachable`].
    pub async fn connect(&self) -> Result<MemoryConnection, TransportError> {
        let mut state = self.state();
        if !state.reachable {
            return Err(TransportError::msg("Connection refused: the broker is unreachable"));
        }
        let id = state.next_id();
        let (sender, status) = watch::channel(ConnectionStatus::Open);
        state.connections.insert(id, sender);
        state.connections_opened += 1;
        Ok(MemoryConnection {
            id,
            broker: self.clone(),
            status,
        })
    }

    /// Whether new connections can be opened. Existing connections are not affected.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Drop every open connection, as a network failure would.
    ///
    /// Status watchers observe [`ConnectionStatus::Failed`], consumer streams end and
    /// unacknowledged messages are requeued.
    pub fn fail_connections(&self, reason: &str) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, ConnectionStatus::Failed(reason.to_owned()));
        }
    }

    /// Publish a message to `queue` through the default exchange, without a connection.
    ///
    /// Returns `false` if the message could not be routed.
    pub fn publish(&self, queue: &str, payload: Vec<u8>, properties: MessageProperties) -> bool {
        self.state().publish(
            queue,
            Message {
                properties,
                data: payload,
            },
        )
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `queue` to be delivered.
    pub fn message_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages delivered to a consumer and not settled yet, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.state().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Connections opened since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    /// Connections closed (or failed) since the broker was created.
    pub fn connections_closed(&self) -> usize {
        self.state().connections_closed
    }
}

#[async_trait::async_trait]
impl Manager for InMemoryBroker {
    type Type = MemoryConnection;

    async fn create(&self) -> Result<MemoryConnection, anyhow::Error> {
        Ok(self.connect().await?)
    }

    async fn destroy(&self, connection: MemoryConnection) -> Result<(), anyhow::Error> {
        Ok(connection.close().await?)
    }

    fn is_broken(&self, connection: &MemoryConnection) -> bool {
        !connection.status().is_open()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BrokerState {
    me: Weak<Mutex<BrokerState>>,
    reachable: bool,
    ids: u64,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, Channel>,
    connections: HashMap<u64, watch::Sender<ConnectionStatus>>,
    connections_opened: usize,
    connections_closed: usize,
}

struct Queue {
    messages: VecDeque<Message>,
    /// Round-robin order.
    consumers: VecDeque<ConsumerKey>,
    exclusive_owner: Option<u64>,
    auto_delete: bool,
}

#[derive(Clone, PartialEq, Eq)]
struct ConsumerKey {
    channel: u64,
    tag: String,
}

#[derive(Clone)]
struct Message {
    properties: MessageProperties,
    data: Vec<u8>,
}

struct Channel {
    connection: u64,
    /// 0 means unlimited.
    prefetch: u16,
    delivery_tags: u64,
    unacked: BTreeMap<u64, (String, Message)>,
    consumers: HashMap<String, Consumer>,
}

impl Channel {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

struct Consumer {
    queue: String,
    sender: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

impl BrokerState {
    fn new(me: Weak<Mutex<BrokerState>>) -> Self {
        Self {
            me,
            reachable: true,
            ids: 0,
            queues: HashMap::new(),
            channels: HashMap::new(),
            connections: HashMap::new(),
            connections_opened: 0,
            connections_closed: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.ids += 1;
        self.ids
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut Channel, TransportError> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| TransportError::msg("The channel is closed"))
    }

    fn open_channel(&mut self, connection: u64) -> Result<u64, TransportError> {
        if !self.connections.contains_key(&connection) {
            return Err(TransportError::msg("The connection is not open"));
        }
        let id = self.next_id();
        self.channels.insert(
            id,
            Channel {
                connection,
                prefetch: 0,
                delivery_tags: 0,
                unacked: BTreeMap::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn check_access(&self, queue: &Queue, name: &str, connection: u64) -> Result<(), TransportError> {
        match queue.exclusive_owner {
            Some(owner) if owner != connection => Err(TransportError::msg(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                name
            ))),
            _ => Ok(()),
        }
    }

    fn declare_queue(
        &mut self,
        channel: u64,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        let connection = self.channel_mut(channel)?.connection;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_owned()
        };
        match self.queues.get(&name) {
            Some(queue) => self.check_access(queue, &name, connection)?,
            None => {
                self.queues.insert(
                    name.clone(),
                    Queue {
                        messages: VecDeque::new(),
                        consumers: VecDeque::new(),
                        exclusive_owner: options.exclusive.then_some(connection),
                        auto_delete: options.auto_delete,
                    },
                );
            }
        }
        Ok(name)
    }

    fn publish(&mut self, queue: &str, message: Message) -> bool {
        match self.queues.get_mut(queue) {
            Some(q) => q.messages.push_back(message),
            None => {
                debug!(queue, "Dropping a message published to a queue that does not exist");
                return false;
            }
        }
        self.dispatch(queue);
        true
    }

    fn consume(
        &mut self,
        channel: u64,
        queue: &str,
        tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let connection = self.channel_mut(channel)?.connection;
        let q = self.queues.get(queue).ok_or_else(|| {
            TransportError::msg(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        self.check_access(q, queue, connection)?;

        let tag = if tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            tag.to_owned()
        };
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let ch = self.channel_mut(channel)?;
        if ch.consumers.contains_key(&tag) {
            return Err(TransportError::msg(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                tag
            )));
        }
        ch.consumers.insert(
            tag.clone(),
            Consumer {
                queue: queue.to_owned(),
                sender,
            },
        );
        if let Some(q) = self.queues.get_mut(queue) {
            q.consumers.push_back(ConsumerKey { channel, tag });
        }
        self.dispatch(queue);

        Ok(stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed())
    }

    fn cancel(&mut self, channel: u64, tag: &str) -> Result<(), TransportError> {
        if let Some(consumer) = self.channel_mut(channel)?.consumers.remove(tag) {
            self.detach_consumer(&consumer.queue, channel, tag);
        }
        Ok(())
    }

    fn detach_consumer(&mut self, queue: &str, channel: u64, tag: &str) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.consumers.retain(|c| !(c.channel == channel && c.tag == tag));
            if q.auto_delete && q.consumers.is_empty() {
                self.queues.remove(queue);
            }
        }
    }

    fn set_prefetch(&mut self, channel: u64, count: u16) -> Result<(), TransportError> {
        self.channel_mut(channel)?.prefetch = count;
        self.dispatch_all();
        Ok(())
    }

    fn settle(&mut self, channel: u64, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let (queue, message) = self
            .channel_mut(channel)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| {
                TransportError::msg(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                ))
            })?;
        if requeue {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_front(message);
            }
        }
        self.dispatch_all();
        Ok(())
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        for (tag, consumer) in channel.consumers {
            self.detach_consumer(&consumer.queue, id, &tag);
        }
        // Newest first, so that requeued messages keep their original order.
        for (_, (queue, message)) in channel.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_front(message);
            }
        }
        self.dispatch_all();
    }

    fn close_connection(&mut self, id: u64, status: ConnectionStatus) {
        let Some(sender) = self.connections.remove(&id) else {
            return;
        };
        self.connections_closed += 1;
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        self.queues.retain(|_, q| q.exclusive_owner != Some(id));
        sender.send_replace(status);
    }

    fn dispatch_all(&mut self) {
        let queues: Vec<String> = self.queues.keys().cloned().collect();
        for queue in queues {
            self.dispatch(&queue);
        }
    }

    /// Push ready messages of `queue` to its consumers, round-robin, as long as their channels
    /// have prefetch capacity left.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.messages.is_empty() {
                return;
            }

            let mut target = None;
            for _ in 0..q.consumers.len() {
                if let Some(candidate) = q.consumers.pop_front() {
                    let ready = self
                        .channels
                        .get(&candidate.channel)
                        .map_or(false, Channel::has_capacity);
                    q.consumers.push_back(candidate.clone());
                    if ready {
                        target = Some(candidate);
                        break;
                    }
                }
            }
            let Some(target) = target else {
                return;
            };
            let Some(message) = q.messages.pop_front() else {
                return;
            };

            let me = self.me.clone();
            let Some(channel) = self.channels.get_mut(&target.channel) else {
                return;
            };
            channel.delivery_tags += 1;
            let delivery_tag = channel.delivery_tags;
            let delivery = Delivery::new(
                delivery_tag,
                message.properties.clone(),
                message.data.clone(),
                Box::new(MemoryAcker {
                    broker: me,
                    channel: target.channel,
                    delivery_tag,
                }),
            );
            let delivered = channel
                .consumers
                .get(&target.tag)
                .map_or(false, |c| c.sender.send(Ok(delivery)).is_ok());

            if delivered {
                channel.unacked.insert(delivery_tag, (queue.to_owned(), message));
            } else {
                // The consumer stream was dropped without cancelling.
                channel.consumers.remove(&target.tag);
                if let Some(q) = self.queues.get_mut(queue) {
                    q.messages.push_front(message);
                    q.consumers.retain(|c| c != &target);
                }
            }
        }
    }
}

struct MemoryAcker {
    broker: Weak<Mutex<BrokerState>>,
    channel: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<(), TransportError> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| TransportError::msg("The broker is gone"))?;
        let mut state = lock(&broker);
        state.settle(self.channel, self.delivery_tag, requeue)
    }
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(requeue)
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
    status: watch::Receiver<ConnectionStatus>,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, TransportError> {
        let id = self.broker.state().open_channel(self.id)?;
        Ok(MemoryChannel {
            id,
            broker: self.broker.clone(),
        })
    }

    fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker
            .state()
            .close_connection(self.id, ConnectionStatus::Closed);
        Ok(())
    }
}

/// A channel opened on a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        self.broker.state().declare_queue(self.id, name, options)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.broker.state().set_prefetch(self.id, count)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.channel_mut(self.id)?;
        state.publish(
            queue,
            Message {
                properties,
                data: payload.to_vec(),
            },
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        self.broker.state().consume(self.id, queue, consumer_tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.broker.state().cancel(self.id, consumer_tag)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state().close_channel(self.id);
        Ok(())
    }
}

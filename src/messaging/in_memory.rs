//! In-process broker implementing the transport traits.
//!
//! Follows the AMQP 0.9.1 semantics the adapter relies on: per-channel
//! delivery tags starting at 1, prefetch-bounded push to consumers,
//! unacknowledged deliveries returned to the head of their queue when the
//! channel closes, dead-lettering through the default exchange, and
//! precondition failures that close the channel. Faults can be injected and
//! every primitive call is counted.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use super::connection::ConnectionConfig;
use super::error::TransportError;
use super::queue::{ArgumentValue, DEAD_LETTER_EXCHANGE, DEAD_LETTER_ROUTING_KEY, QueueArguments};
use super::transport::{BrokerChannel, BrokerConnection, DeliveryStream, RawDelivery, Transport};

struct Ready {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    arguments: QueueArguments,
    ready: VecDeque<Ready>,
}

struct Unacked {
    queue: String,
    body: Vec<u8>,
}

struct ConsumerState {
    queue: String,
    buffer: VecDeque<RawDelivery>,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consumers: BTreeMap<String, ConsumerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    connections: HashSet<u64>,
    channels: BTreeMap<u64, ChannelState>,
    next_id: u64,

    refuse: bool,
    failing_connects: u32,
    failing_channels: u32,
    failing_declares: HashSet<String>,
    failing_publishes: bool,
    failing_acks: bool,
    failing_nacks: bool,

    connect_attempts: u32,
    declare_attempts: Vec<String>,
    publish_count: usize,
    ack_count: usize,
    nack_count: usize,
    last_heartbeat: Option<Option<u16>>,
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_connection(&mut self) -> u64 {
        let id = self.allocate_id();
        self.connections.insert(id);
        id
    }

    fn open_channel(&mut self, connection: u64) -> (u64, u16) {
        let key = self.allocate_id();
        let id = self
            .channels
            .values()
            .filter(|c| c.connection == connection)
            .count() as u16
            + 1;
        self.channels.insert(
            key,
            ChannelState {
                connection,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                consumers: BTreeMap::new(),
            },
        );
        (key, id)
    }

    fn channel(&mut self, key: u64) -> Result<&mut ChannelState, TransportError> {
        match self.channels.get_mut(&key) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    fn close_channel(&mut self, key: u64) {
        let Some(channel) = self.channels.get_mut(&key) else {
            return;
        };
        channel.open = false;
        channel.consumers.clear();
        let unacked = std::mem::take(&mut channel.unacked);

        for (_, message) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&message.queue) {
                queue.ready.push_front(Ready {
                    body: message.body,
                    redelivered: true,
                });
            }
        }
    }

    fn close_connection(&mut self, connection: u64) {
        self.connections.remove(&connection);
        let keys: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection && c.open)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            self.close_channel(key);
        }
    }

    /// Messages published to an unknown queue are dropped, as the default
    /// exchange does for unroutable messages.
    fn enqueue(&mut self, queue: &str, body: Vec<u8>) {
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.ready.push_back(Ready {
                body,
                redelivered: false,
            });
        }
    }

    fn dead_letter(&mut self, queue: &str, body: Vec<u8>) {
        let Some(state) = self.queues.get(queue) else {
            return;
        };
        if state.arguments.get(DEAD_LETTER_EXCHANGE) != Some(&ArgumentValue::Text(String::new())) {
            return;
        }
        let target = match state.arguments.get(DEAD_LETTER_ROUTING_KEY) {
            Some(ArgumentValue::Text(routing_key)) => routing_key.clone(),
            _ => queue.to_string(),
        };
        self.enqueue(&target, body);
    }

    fn take_unacked(&mut self, key: u64, delivery_tag: u64) -> Result<Unacked, TransportError> {
        let channel = self.channel(key)?;
        match channel.unacked.remove(&delivery_tag) {
            Some(message) => Ok(message),
            None => {
                self.close_channel(key);
                Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
    }

    /// Pushes ready messages to consumers until each channel's prefetch is reached.
    fn dispatch(&mut self) {
        let queues = &mut self.queues;
        for channel in self.channels.values_mut().filter(|c| c.open) {
            for consumer in channel.consumers.values_mut() {
                let Some(queue) = queues.get_mut(&consumer.queue) else {
                    continue;
                };
                while channel.prefetch == 0 || channel.unacked.len() < channel.prefetch as usize {
                    let Some(ready) = queue.ready.pop_front() else {
                        break;
                    };
                    channel.next_tag += 1;
                    let delivery_tag = channel.next_tag;
                    channel.unacked.insert(
                        delivery_tag,
                        Unacked {
                            queue: consumer.queue.clone(),
                            body: ready.body.clone(),
                        },
                    );
                    consumer.buffer.push_back(RawDelivery {
                        delivery_tag,
                        routing_key: consumer.queue.clone(),
                        redelivered: ready.redelivered,
                        data: ready.body,
                    });
                }
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let result = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            state.dispatch();
            result
        };
        self.notify.notify_waiters();
        result
    }

    /// Opens a connection and channel directly, bypassing injected faults.
    pub async fn open_channel(&self) -> Arc<dyn BrokerChannel> {
        let (key, id) = self.mutate(|state| {
            let connection = state.open_connection();
            state.open_channel(connection)
        });
        Arc::new(InMemoryChannel {
            broker: self.clone(),
            key,
            id,
        })
    }

    pub fn create_queue(&self, name: &str) {
        self.mutate(|state| {
            state.queues.entry(name.to_string()).or_default();
        });
    }

    /// Appends a message as if published by another client.
    pub fn push(&self, queue: &str, body: &[u8]) {
        self.mutate(|state| state.enqueue(queue, body.to_vec()));
    }

    pub fn refuse_connections(&self) {
        self.state.lock().refuse = true;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    pub fn fail_next_channels(&self, count: u32) {
        self.state.lock().failing_channels = count;
    }

    pub fn fail_declare_of(&self, queue: &str) {
        self.state.lock().failing_declares.insert(queue.to_string());
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().failing_publishes = fail;
    }

    pub fn fail_acks(&self, fail: bool) {
        self.state.lock().failing_acks = fail;
    }

    pub fn fail_nacks(&self, fail: bool) {
        self.state.lock().failing_nacks = fail;
    }

    /// Closes every open channel, as a broker-side channel error would.
    pub fn close_channels(&self) {
        self.mutate(|state| {
            let keys: Vec<u64> = state.channels.keys().copied().collect();
            for key in keys {
                state.close_channel(key);
            }
        });
    }

    /// Drops every connection, as a broker restart would.
    pub fn drop_connections(&self) {
        self.mutate(|state| {
            let connections: Vec<u64> = state.connections.iter().copied().collect();
            for connection in connections {
                state.close_connection(connection);
            }
        });
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Ready (not yet delivered) message bodies, head first.
    pub fn queue_contents(&self, name: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|q| q.ready.iter().map(|r| r.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn consumer_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .filter(|c| c.open)
            .map(|c| c.consumers.len())
            .sum()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn declare_attempts(&self) -> Vec<String> {
        self.state.lock().declare_attempts.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.state.lock().publish_count
    }

    pub fn ack_count(&self) -> usize {
        self.state.lock().ack_count
    }

    pub fn nack_count(&self) -> usize {
        self.state.lock().nack_count
    }

    /// The heartbeat requested by the most recent connection attempt.
    pub fn last_heartbeat(&self) -> Option<Option<u16>> {
        self.state.lock().last_heartbeat
    }

    async fn next_delivery(&self, key: u64, consumer_tag: &str) -> Option<RawDelivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                let channel = state.channels.get_mut(&key).filter(|c| c.open)?;
                let consumer = channel.consumers.get_mut(consumer_tag)?;
                if let Some(delivery) = consumer.buffer.pop_front() {
                    return Some(delivery);
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        state.last_heartbeat = Some(config.heartbeat());

        if state.refuse {
            return Err(TransportError::Refused(format!(
                "{}: Connection refused",
                config.endpoint()
            )));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Refused(format!(
                "{}: broker is starting",
                config.endpoint()
            )));
        }

        let id = state.open_connection();
        Ok(Box::new(InMemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let (key, id) = {
            let mut state = self.broker.state.lock();
            if !state.connections.contains(&self.id) {
                return Err(TransportError::ConnectionClosed);
            }
            if state.failing_channels > 0 {
                state.failing_channels -= 1;
                return Err(TransportError::Protocol("channel.open refused".to_string()));
            }
            state.open_channel(self.id)
        };

        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            key,
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker.state.lock().connections.contains(&self.id)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.mutate(|state| -> Result<(), TransportError> {
            if !state.connections.contains(&self.id) {
                return Err(TransportError::ConnectionClosed);
            }
            state.close_connection(self.id);
            Ok(())
        })
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    key: u64,
    id: u16,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker
            .state
            .lock()
            .channels
            .get(&self.key)
            .is_some_and(|c| c.open)
    }

    async fn queue_declare(
        &self,
        queue: &str,
        arguments: &QueueArguments,
    ) -> Result<(), TransportError> {
        self.broker.mutate(|state| -> Result<(), TransportError> {
            state.channel(self.key)?;
            state.declare_attempts.push(queue.to_string());

            if state.failing_declares.contains(queue) {
                return Err(TransportError::Protocol(format!(
                    "declare of '{}' failed",
                    queue
                )));
            }

            match state.queues.get(queue) {
                Some(existing) if existing.arguments != *arguments => {
                    state.close_channel(self.key);
                    Err(TransportError::Protocol(format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        queue
                    )))
                }
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(
                        queue.to_string(),
                        QueueState {
                            arguments: arguments.clone(),
                            ready: VecDeque::new(),
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.broker.mutate(|state| -> Result<(), TransportError> {
            state.channel(self.key)?.prefetch = prefetch_count;
            Ok(())
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        self.broker.mutate(|state| -> Result<(), TransportError> {
            state.channel(self.key)?;
            if !state.queues.contains_key(queue) {
                state.close_channel(self.key);
                return Err(TransportError::Protocol(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            }

            let channel = state.channel(self.key)?;
            if channel.consumers.contains_key(consumer_tag) {
                return Err(TransportError::Protocol(format!(
                    "NOT_ALLOWED - consumer tag '{}' in use",
                    consumer_tag
                )));
            }
            channel.consumers.insert(
                consumer_tag.to_string(),
                ConsumerState {
                    queue: queue.to_string(),
                    buffer: VecDeque::new(),
                },
            );
            Ok(())
        })?;

        let broker = self.broker.clone();
        let key = self.key;
        let consumer_tag = consumer_tag.to_string();
        Ok(
            futures::stream::unfold((broker, key, consumer_tag), |(broker, key, tag)| async move {
                let delivery = broker.next_delivery(key, &tag).await?;
                Some((Ok(delivery), (broker, key, tag)))
            })
            .boxed(),
        )
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.broker.mutate(|state| -> Result<(), TransportError> {
            state.channel(self.key)?.consumers.remove(consumer_tag);
            Ok(())
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.broker.mutate(|state| -> Result<(), TransportError> {
            state.channel(self.key)?;
            if state.failing_acks {
                return Err(TransportError::Protocol("basic.ack failed".to_string()));
            }
            state.take_unacked(self.key, delivery_tag)?;
            state.ack_count += 1;
            Ok(())
        })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.broker.mutate(|state| -> Result<(), TransportError> {
            state.channel(self.key)?;
            if state.failing_nacks {
                return Err(TransportError::Protocol("basic.nack failed".to_string()));
            }
            let message = state.take_unacked(self.key, delivery_tag)?;
            state.nack_count += 1;

            if requeue {
                if let Some(queue) = state.queues.get_mut(&message.queue) {
                    queue.ready.push_front(Ready {
                        body: message.body,
                        redelivered: true,
                    });
                }
            } else {
                state.dead_letter(&message.queue, message.body);
            }
            Ok(())
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), TransportError> {
        self.broker.mutate(|state| -> Result<(), TransportError> {
            state.channel(self.key)?;
            if !exchange.is_empty() {
                return Err(TransportError::Protocol(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }
            if state.failing_publishes {
                return Err(TransportError::Protocol("basic.publish failed".to_string()));
            }
            state.publish_count += 1;
            state.enqueue(routing_key, body.to_vec());
            Ok(())
        })
    }
}

//! The narrow set of broker primitives the adapter is built on.
//!
//! [`super::amqp`] implements these over `lapin`; `super::in_memory`
//! implements them in-process for tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::connection::ConnectionConfig;
use super::error::TransportError;
use super::queue::QueueArguments;

/// A delivery as handed over by the transport, before the adapter wraps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    fn is_connected(&self) -> bool;

    /// Closing the connection closes every channel derived from it.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn queue_declare(
        &self,
        queue: &str,
        arguments: &QueueArguments,
    ) -> Result<(), TransportError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Publish without waiting for a broker confirmation.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), TransportError>;
}

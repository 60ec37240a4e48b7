use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::connection::{ConnectionConfig, Connector, RetryPolicy};
use super::consumer::{ConsumeOptions, Consumer};
use super::delivery::{DeliveryController, DeliveryHandle};
use super::error::{
    AckError, ConnectionError, ConsumeError, DeclarationError, PublishError, RequeueError,
};
use super::handler::MessageHandler;
use super::queue::{QueueArguments, QueueRegistrar};
use super::transport::{BrokerChannel, BrokerConnection, Transport};
use crate::metrics::Metrics;

/// One connection, its single channel, and the operations built on them.
pub struct BrokerAdapter {
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    deliveries: DeliveryController,
    closed: Arc<AtomicBool>,
    consuming: AtomicBool,
    metrics: Arc<Metrics>,
}

/// Clears the adapter's consuming flag when the loop ends or is dropped.
struct ConsumingGuard<'a>(&'a AtomicBool);

impl Drop for ConsumingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for BrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAdapter")
            .field("channel_id", &self.channel.id())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl BrokerAdapter {
    pub(crate) fn new(
        connection: Box<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let deliveries =
            DeliveryController::new(channel.clone(), Uuid::new_v4(), closed.clone(), metrics.clone());

        Self {
            connection,
            channel,
            deliveries,
            closed,
            consuming: AtomicBool::new(false),
            metrics,
        }
    }

    pub async fn connect(
        transport: &dyn Transport,
        config: &ConnectionConfig,
        retry: &RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConnectionError> {
        Connector::new(transport, metrics).connect(config, retry).await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected() && self.channel.is_open()
    }

    pub fn channel_id(&self) -> u16 {
        self.channel.id()
    }

    /// Shared with handlers; clones stay bound to this adapter's channel.
    pub fn deliveries(&self) -> &DeliveryController {
        &self.deliveries
    }

    pub async fn declare_queues<I, S>(
        &self,
        names: I,
        arguments: Option<&QueueArguments>,
    ) -> Result<(), DeclarationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        QueueRegistrar::new(self.channel.as_ref())
            .declare_queues(names, arguments)
            .await
    }

    pub async fn consume(
        &self,
        prefetch_count: u16,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: Arc<Notify>,
    ) -> Result<(), ConsumeError> {
        self.consume_with(queue, handler, shutdown, ConsumeOptions::new(prefetch_count))
            .await
    }

    /// Only one consumption loop may run per adapter; a second concurrent
    /// call fails with [`ConsumeError::AlreadyConsuming`].
    pub async fn consume_with(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: Arc<Notify>,
        options: ConsumeOptions,
    ) -> Result<(), ConsumeError> {
        if self
            .consuming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(queue, "Consumer already running on this adapter");
            return Err(ConsumeError::AlreadyConsuming);
        }
        let _guard = ConsumingGuard(&self.consuming);

        Consumer::new(
            self.channel.clone(),
            self.deliveries.clone(),
            queue.to_string(),
            options,
            handler,
            shutdown,
            self.metrics.clone(),
        )
        .start()
        .await
    }

    pub async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), AckError> {
        self.deliveries.acknowledge(handle).await
    }

    pub async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), PublishError> {
        self.deliveries.publish(queue, body).await
    }

    pub async fn reject_and_requeue(
        &self,
        handle: &DeliveryHandle,
        body: &[u8],
    ) -> Result<(), RequeueError> {
        self.deliveries.reject_and_requeue(handle, body).await
    }

    /// Closes the connection and with it the channel. Unacknowledged
    /// deliveries return to their queues on the broker side.
    pub async fn close(self) -> Result<(), ConnectionError> {
        let channel_id = self.channel.id();
        info!(channel_id, "Shutting down RabbitMQ connection");
        self.closed.store(true, Ordering::Release);

        self.connection.close().await.map_err(|e| {
            error!(error = %e, "Failed to close RabbitMQ connection gracefully");
            ConnectionError::ShutdownFailed(e)
        })?;

        info!(channel_id, "RabbitMQ connection closed successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::connection::Credentials;
    use crate::messaging::delivery::Message;
    use crate::messaging::error::TransportError;
    use crate::messaging::handler::HandlerError;
    use crate::messaging::in_memory::InMemoryBroker;
    use async_trait::async_trait;

    async fn connect(broker: &InMemoryBroker) -> BrokerAdapter {
        let config = ConnectionConfig::new("localhost", 5672, Credentials::new("guest", "guest"))
            .with_heartbeat(Some(30));
        BrokerAdapter::connect(broker, &config, &RetryPolicy::default(), Metrics::new().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let adapter = connect(&broker).await;
        adapter.declare_queues(["jobs", "other"], None).await.unwrap();

        adapter.publish("jobs", b"hello").await.unwrap();

        assert_eq!(broker.queue_contents("jobs"), vec![b"hello".to_vec()]);
        assert!(broker.queue_contents("other").is_empty());
        assert_eq!(broker.last_heartbeat(), Some(Some(30)));
    }

    #[tokio::test]
    async fn test_handles_from_another_adapter_are_foreign() {
        let broker = InMemoryBroker::new();
        let first = connect(&broker).await;
        let second = connect(&broker).await;
        first.declare_queues(["jobs"], None).await.unwrap();
        broker.push("jobs", b"payload");
        let handle = DeliveryHandle::new(1, "jobs", first.deliveries().session());

        let err = second.acknowledge(&handle).await.unwrap_err();

        assert!(matches!(err, AckError::ForeignHandle { .. }));
    }

    #[tokio::test]
    async fn test_cloned_controller_fails_after_close() {
        let broker = InMemoryBroker::new();
        let adapter = connect(&broker).await;
        adapter.declare_queues(["jobs"], None).await.unwrap();
        let deliveries = adapter.deliveries().clone();

        adapter.close().await.unwrap();
        let err = deliveries.publish("jobs", b"late").await.unwrap_err();

        assert_eq!(err.source, TransportError::ConnectionClosed);
        assert_eq!(broker.open_connections(), 0);
    }

    struct AckAll;

    #[async_trait]
    impl MessageHandler for AckAll {
        async fn handle(
            &self,
            message: &Message,
            deliveries: &DeliveryController,
        ) -> Result<(), HandlerError> {
            deliveries
                .acknowledge(message.handle())
                .await
                .map_err(|e| HandlerError::Transient(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_second_concurrent_consume_is_refused() {
        let broker = InMemoryBroker::new();
        let adapter = connect(&broker).await;
        adapter.declare_queues(["jobs"], None).await.unwrap();
        let shutdown = Arc::new(Notify::new());

        let first = adapter.consume(1, "jobs", Arc::new(AckAll), shutdown.clone());
        let second = async {
            tokio::task::yield_now().await;
            let result = adapter
                .consume(1, "jobs", Arc::new(AckAll), Arc::new(Notify::new()))
                .await;
            shutdown.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        first.unwrap();
        assert!(matches!(second, Err(ConsumeError::AlreadyConsuming)));
        assert_eq!(broker.consumer_count(), 0);

        // The slot frees up once the first loop has returned.
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();
        adapter
            .consume(1, "jobs", Arc::new(AckAll), shutdown)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_declare_on_closed_channel_reports_queue() {
        let broker = InMemoryBroker::new();
        let adapter = connect(&broker).await;
        broker.close_channels();

        let err = adapter.declare_queues(["jobs"], None).await.unwrap_err();

        assert_eq!(err.queue, "jobs");
        assert_eq!(err.source, TransportError::ChannelClosed);
        assert!(!adapter.is_connected());
    }
}

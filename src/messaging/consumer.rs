use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::delivery::{DeliveryController, Message};
use super::error::ConsumeError;
use super::handler::MessageHandler;
use super::transport::{BrokerChannel, DeliveryStream, RawDelivery};
use crate::metrics::Metrics;

/// What the consumer does with a delivery the handler left unresolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    /// Nack without requeue; the broker drops or dead-letters the message.
    #[default]
    Reject,
    /// Nack with requeue; the broker redelivers it near the head of the queue.
    Requeue,
    /// Leave it unacknowledged and stop consuming.
    Abort,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub prefetch_count: u16,
    pub consumer_tag: Option<String>,
    pub unresolved: UnresolvedPolicy,
}

impl ConsumeOptions {
    pub fn new(prefetch_count: u16) -> Self {
        Self {
            prefetch_count,
            consumer_tag: None,
            unresolved: UnresolvedPolicy::default(),
        }
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    pub fn with_unresolved_policy(mut self, policy: UnresolvedPolicy) -> Self {
        self.unresolved = policy;
        self
    }
}

pub struct Consumer {
    channel: Arc<dyn BrokerChannel>,
    deliveries: DeliveryController,
    queue_name: String,
    consumer_tag: String,
    prefetch_count: u16,
    unresolved: UnresolvedPolicy,
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<Notify>,
    metrics: Arc<Metrics>,
}

impl Consumer {
    pub(crate) fn new(
        channel: Arc<dyn BrokerChannel>,
        deliveries: DeliveryController,
        queue_name: String,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
        shutdown: Arc<Notify>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let consumer_tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("{}-{}", queue_name, Uuid::new_v4()));

        Self {
            channel,
            deliveries,
            queue_name,
            consumer_tag,
            prefetch_count: options.prefetch_count,
            unresolved: options.unresolved,
            handler,
            shutdown,
            metrics,
        }
    }

    /// Runs until `shutdown` is notified (returns `Ok`) or the channel fails.
    ///
    /// Handlers run one at a time; the shutdown signal is only observed
    /// between deliveries.
    pub async fn start(self) -> Result<(), ConsumeError> {
        if self.prefetch_count == 0 {
            return Err(ConsumeError::InvalidPrefetch);
        }

        info!(prefetch_count = self.prefetch_count, "Configuring channel QoS");
        self.channel
            .basic_qos(self.prefetch_count)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to configure channel QoS");
                ConsumeError::Qos(e)
            })?;

        info!(
            queue = %self.queue_name,
            consumer_tag = %self.consumer_tag,
            "Starting RabbitMQ consumer"
        );

        let stream = self
            .channel
            .basic_consume(&self.queue_name, &self.consumer_tag)
            .await
            .map_err(|e| {
                error!(error = %e, queue = %self.queue_name, "Failed to start consumer");
                ConsumeError::Subscribe {
                    queue: self.queue_name.clone(),
                    source: e,
                }
            })?;

        info!(
            queue = %self.queue_name,
            consumer_tag = %self.consumer_tag,
            channel_id = self.channel.id(),
            "Consumer started successfully"
        );

        self.metrics.active_consumers.inc();
        let result = self.run(stream).await;
        self.metrics.active_consumers.dec();

        match &result {
            Ok(()) => info!(consumer_tag = %self.consumer_tag, "Consumer stopped"),
            Err(e) => error!(consumer_tag = %self.consumer_tag, error = %e, "Consumer failed"),
        }
        result
    }

    async fn run(&self, mut stream: DeliveryStream) -> Result<(), ConsumeError> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(
                        consumer_tag = %self.consumer_tag,
                        "Shutdown signal received, stopping consumer"
                    );
                    if let Err(e) = self.channel.basic_cancel(&self.consumer_tag).await {
                        warn!(error = %e, consumer_tag = %self.consumer_tag, "Failed to cancel consumer");
                    }
                    return Ok(());
                }

                delivery = stream.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.process_message(delivery).await?,
                        Some(Err(e)) => {
                            error!(error = %e, "Error receiving message from RabbitMQ");
                            return Err(ConsumeError::Stream(e));
                        }
                        None => {
                            warn!(queue = %self.queue_name, "Consumer stream ended");
                            return Err(ConsumeError::StreamEnded {
                                queue: self.queue_name.clone(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn process_message(&self, delivery: RawDelivery) -> Result<(), ConsumeError> {
        let message = Message::from_delivery(delivery, &self.queue_name, self.deliveries.session());
        let delivery_tag = message.handle().delivery_tag();

        self.metrics
            .messages_delivered_total
            .with_label_values(&[&self.queue_name])
            .inc();

        debug!(
            delivery_tag,
            routing_key = message.routing_key(),
            redelivered = message.redelivered(),
            payload_size = message.body().len(),
            "Processing message"
        );

        let start = std::time::Instant::now();
        let outcome = self.handler.handle(&message, &self.deliveries).await;
        let duration = start.elapsed().as_secs_f64();

        let status = match &outcome {
            Ok(()) => "success",
            Err(e) => {
                self.metrics
                    .handler_failures_total
                    .with_label_values(&[&self.queue_name, e.error_type()])
                    .inc();
                e.error_type()
            }
        };
        self.metrics
            .message_processing_duration_seconds
            .with_label_values(&[&self.queue_name, status])
            .observe(duration);

        if message.handle().is_resolved() {
            match outcome {
                Ok(()) => debug!(delivery_tag, duration_ms = duration * 1000.0, "Message processed"),
                Err(e) => warn!(delivery_tag, error = %e, "Handler failed after resolving delivery"),
            }
            return Ok(());
        }

        match &outcome {
            Ok(()) => error!(delivery_tag, policy = ?self.unresolved, "Handler returned without resolving delivery"),
            Err(e) => warn!(delivery_tag, error = %e, policy = ?self.unresolved, "Handler failed without resolving delivery"),
        }

        let requeue = match self.unresolved {
            UnresolvedPolicy::Reject => false,
            UnresolvedPolicy::Requeue => true,
            UnresolvedPolicy::Abort => {
                return Err(ConsumeError::UnresolvedDelivery {
                    queue: self.queue_name.clone(),
                    delivery_tag,
                });
            }
        };

        // An unsettled delivery holds its prefetch slot, so the loop cannot go on.
        self.deliveries
            .nack(message.handle(), requeue)
            .await
            .map_err(|e| {
                error!(error = %e, delivery_tag, "Failed to nack unresolved delivery");
                ConsumeError::Resolve {
                    queue: self.queue_name.clone(),
                    source: e,
                }
            })
    }
}

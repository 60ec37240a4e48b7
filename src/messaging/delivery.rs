use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{AckError, PublishError, RequeueError, TransportError};
use super::transport::{BrokerChannel, RawDelivery};
use crate::metrics::Metrics;

/// Correlates a delivery with the channel and queue it arrived from.
///
/// A handle must be resolved exactly once: by [`DeliveryController::acknowledge`],
/// [`DeliveryController::reject_and_requeue`] or [`DeliveryController::nack`].
#[derive(Debug)]
pub struct DeliveryHandle {
    delivery_tag: u64,
    queue: String,
    session: Uuid,
    resolved: AtomicBool,
}

impl DeliveryHandle {
    pub(crate) fn new(delivery_tag: u64, queue: impl Into<String>, session: Uuid) -> Self {
        Self {
            delivery_tag,
            queue: queue.into(),
            session,
            resolved: AtomicBool::new(false),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        self.resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.resolved.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct Message {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
    handle: DeliveryHandle,
}

impl Message {
    pub(crate) fn from_delivery(delivery: RawDelivery, queue: &str, session: Uuid) -> Self {
        Self {
            handle: DeliveryHandle::new(delivery.delivery_tag, queue, session),
            body: delivery.data,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn handle(&self) -> &DeliveryHandle {
        &self.handle
    }
}

/// Ack, publish and requeue operations bound to one adapter's channel.
#[derive(Clone)]
pub struct DeliveryController {
    channel: Arc<dyn BrokerChannel>,
    session: Uuid,
    closed: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl DeliveryController {
    pub(crate) fn new(
        channel: Arc<dyn BrokerChannel>,
        session: Uuid,
        closed: Arc<AtomicBool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            channel,
            session,
            closed,
            metrics,
        }
    }

    pub(crate) fn session(&self) -> Uuid {
        self.session
    }

    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.channel.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    fn check_origin(&self, handle: &DeliveryHandle) -> Result<(), AckError> {
        if handle.session != self.session {
            return Err(AckError::ForeignHandle {
                delivery_tag: handle.delivery_tag,
            });
        }
        Ok(())
    }

    /// Removes the delivery from the queue permanently.
    pub async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), AckError> {
        self.resolve(handle, "ack", |channel, tag| async move {
            channel.basic_ack(tag).await
        })
        .await?;

        self.metrics
            .messages_acked_total
            .with_label_values(&[handle.queue()])
            .inc();
        debug!(delivery_tag = handle.delivery_tag, queue = %handle.queue, "Message acknowledged");
        Ok(())
    }

    /// Broker-native negative acknowledgment. With `requeue` the broker puts
    /// the message back near the head of the queue; without it the message is
    /// discarded or dead-lettered.
    pub async fn nack(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), AckError> {
        self.resolve(handle, "nack", |channel, tag| async move {
            channel.basic_nack(tag, requeue).await
        })
        .await?;

        self.metrics
            .messages_rejected_total
            .with_label_values(&[handle.queue()])
            .inc();
        info!(delivery_tag = handle.delivery_tag, queue = %handle.queue, requeue, "Message negatively acknowledged");
        Ok(())
    }

    async fn resolve<F, Fut>(
        &self,
        handle: &DeliveryHandle,
        operation: &'static str,
        send: F,
    ) -> Result<(), AckError>
    where
        F: FnOnce(Arc<dyn BrokerChannel>, u64) -> Fut,
        Fut: std::future::Future<Output = Result<(), TransportError>>,
    {
        let delivery_tag = handle.delivery_tag;
        self.check_origin(handle)?;
        self.ensure_live()
            .map_err(|source| AckError::Transport { delivery_tag, source })?;

        if !handle.claim() {
            warn!(delivery_tag, operation, "Delivery already resolved");
            return Err(AckError::AlreadyResolved { delivery_tag });
        }

        if let Err(source) = send(self.channel.clone(), delivery_tag).await {
            handle.release();
            error!(error = %source, delivery_tag, operation, "Failed to resolve delivery");
            return Err(AckError::Transport { delivery_tag, source });
        }

        Ok(())
    }

    /// Fire-and-forget publish to the default exchange, routed by queue name.
    pub async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), PublishError> {
        let publish = async {
            self.ensure_live()?;
            self.channel.basic_publish("", queue, body).await
        };

        publish.await.map_err(|source| {
            error!(error = %source, queue = %queue, "Failed to publish message");
            PublishError {
                queue: queue.to_string(),
                source,
            }
        })?;

        self.metrics
            .messages_published_total
            .with_label_values(&[queue])
            .inc();
        debug!(queue = %queue, payload_size = body.len(), "Message published");
        Ok(())
    }

    /// Republishes `body` at the tail of the handle's queue, then acknowledges
    /// the original delivery.
    ///
    /// The two steps are not atomic. If the publish fails the original is left
    /// unacknowledged. If the publish succeeds and the ack fails, both the new
    /// copy and the original survive and the message is processed twice.
    pub async fn reject_and_requeue(
        &self,
        handle: &DeliveryHandle,
        body: &[u8],
    ) -> Result<(), RequeueError> {
        self.check_origin(handle)?;
        if handle.is_resolved() {
            return Err(AckError::AlreadyResolved {
                delivery_tag: handle.delivery_tag,
            }
            .into());
        }

        self.publish(&handle.queue, body).await?;

        if let Err(e) = self.acknowledge(handle).await {
            warn!(
                error = %e,
                delivery_tag = handle.delivery_tag,
                queue = %handle.queue,
                "Requeued copy published but original ack failed, message is duplicated"
            );
            return Err(e.into());
        }

        self.metrics
            .messages_requeued_total
            .with_label_values(&[handle.queue()])
            .inc();
        info!(delivery_tag = handle.delivery_tag, queue = %handle.queue, "Message requeued to tail");
        Ok(())
    }
}

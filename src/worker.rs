use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::messaging::{DeliveryController, HandlerError, Message, MessageHandler};

pub const MAX_RETRIES: u32 = 3;

/// Acks valid JSON events and requeues simulated transient failures to the
/// tail up to [`MAX_RETRIES`] times. Anything else is left unresolved so the
/// consumer dead-letters it.
#[derive(Default)]
pub struct EventHandler {
    retries: Mutex<HashMap<Vec<u8>, u32>>,
}

impl EventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one more retry for `body`, or forgets it once the budget is spent.
    fn next_retry(&self, body: &[u8]) -> Option<u32> {
        let mut retries = self.retries.lock();
        let count = retries.entry(body.to_vec()).or_insert(0);
        *count += 1;
        if *count > MAX_RETRIES {
            retries.remove(body);
            return None;
        }
        Some(*count)
    }
}

#[async_trait]
impl MessageHandler for EventHandler {
    async fn handle(
        &self,
        message: &Message,
        deliveries: &DeliveryController,
    ) -> Result<(), HandlerError> {
        let payload = String::from_utf8_lossy(message.body());

        info!(
            routing_key = message.routing_key(),
            redelivered = message.redelivered(),
            payload_preview = %payload.chars().take(100).collect::<String>(),
            "Handling message"
        );

        if payload.contains("\"fail\":\"transient\"") {
            let Some(retry_count) = self.next_retry(message.body()) else {
                warn!(max_retries = MAX_RETRIES, "Max retries exceeded, sending to DLQ");
                return Err(HandlerError::Permanent(format!(
                    "Transient failure persisted after {} retries",
                    MAX_RETRIES
                )));
            };

            deliveries
                .reject_and_requeue(message.handle(), message.body())
                .await
                .map_err(|e| HandlerError::Transient(e.to_string()))?;
            warn!(retry_count, max_retries = MAX_RETRIES, "Transient failure, message requeued");
            return Ok(());
        }

        let json: serde_json::Value = serde_json::from_str(&payload)
            .map_err(|e| HandlerError::Permanent(format!("Invalid JSON payload: {}", e)))?;
        if json.get("eventType").is_none() {
            return Err(HandlerError::Permanent(
                "Missing required field: eventType".to_string(),
            ));
        }

        deliveries
            .acknowledge(message.handle())
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{
        BrokerAdapter, ConnectionConfig, Credentials, InMemoryBroker, QueueArguments, RetryPolicy,
    };
    use crate::metrics::Metrics;
    use std::sync::Arc;
    use tokio::sync::Notify;

    async fn worker_queues(broker: &InMemoryBroker) -> (BrokerAdapter, Arc<Metrics>) {
        let metrics = Metrics::new().unwrap();
        let config = ConnectionConfig::new("localhost", 5672, Credentials::new("guest", "guest"));
        let adapter =
            BrokerAdapter::connect(broker, &config, &RetryPolicy::default(), metrics.clone())
                .await
                .unwrap();
        adapter
            .declare_queues(["events.dlq"], Some(&QueueArguments::new().durable(true)))
            .await
            .unwrap();
        let args = QueueArguments::new()
            .durable(true)
            .dead_letter_exchange("")
            .dead_letter_routing_key("events.dlq");
        adapter.declare_queues(["events"], Some(&args)).await.unwrap();
        (adapter, metrics)
    }

    async fn consume_until_dead_lettered(broker: &InMemoryBroker, adapter: &BrokerAdapter) {
        let shutdown = Arc::new(Notify::new());
        let consume = adapter.consume(1, "events", Arc::new(EventHandler::new()), shutdown.clone());
        let wait = async {
            while broker.queue_contents("events.dlq").is_empty() {
                tokio::task::yield_now().await;
            }
            shutdown.notify_one();
        };
        let (result, ()) = tokio::join!(consume, wait);
        result.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_dead_lettered() {
        let broker = InMemoryBroker::new();
        let (adapter, metrics) = worker_queues(&broker).await;
        let payload = br#"{"eventType":"job","fail":"transient"}"#;
        broker.push("events", payload);

        consume_until_dead_lettered(&broker, &adapter).await;

        assert_eq!(broker.publish_count(), MAX_RETRIES as usize);
        assert_eq!(broker.ack_count(), MAX_RETRIES as usize);
        assert_eq!(broker.nack_count(), 1);
        assert_eq!(broker.queue_contents("events.dlq"), vec![payload.to_vec()]);
        assert!(broker.queue_contents("events").is_empty());
        assert_eq!(
            metrics
                .handler_failures_total
                .with_label_values(&["events", "permanent"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics
                .handler_failures_total
                .with_label_values(&["events", "transient"])
                .get(),
            0.0
        );
    }

    #[tokio::test]
    async fn test_valid_events_are_acked_and_invalid_ones_dead_lettered() {
        let broker = InMemoryBroker::new();
        let (adapter, _metrics) = worker_queues(&broker).await;
        broker.push("events", br#"{"eventType":"job"}"#);
        broker.push("events", b"not json");

        consume_until_dead_lettered(&broker, &adapter).await;

        assert_eq!(broker.ack_count(), 1);
        assert_eq!(broker.nack_count(), 1);
        assert_eq!(broker.queue_contents("events.dlq"), vec![b"not json".to_vec()]);
    }

    #[test]
    fn test_retry_budget_resets_after_exhaustion() {
        let handler = EventHandler::new();
        for expected in 1..=MAX_RETRIES {
            assert_eq!(handler.next_retry(b"payload"), Some(expected));
        }
        assert_eq!(handler.next_retry(b"payload"), None);
        assert_eq!(handler.next_retry(b"payload"), Some(1));
    }
}

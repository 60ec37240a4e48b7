use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub connection_attempts_total: Counter,
    pub connection_failures_total: Counter,
    pub messages_delivered_total: CounterVec,
    pub messages_acked_total: CounterVec,
    pub messages_rejected_total: CounterVec,
    pub messages_requeued_total: CounterVec,
    pub messages_published_total: CounterVec,
    pub handler_failures_total: CounterVec,
    pub message_processing_duration_seconds: HistogramVec,
    pub active_consumers: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let connection_attempts_total = Counter::new(
            "adapter_connection_attempts_total",
            "Total number of broker connection attempts",
        )?;

        let connection_failures_total = Counter::new(
            "adapter_connection_failures_total",
            "Total number of failed broker connection attempts",
        )?;

        let messages_delivered_total = CounterVec::new(
            Opts::new(
                "adapter_messages_delivered_total",
                "Total number of deliveries dispatched to the handler",
            ),
            &["queue"],
        )?;

        let messages_acked_total = CounterVec::new(
            Opts::new(
                "adapter_messages_acked_total",
                "Total number of deliveries acknowledged",
            ),
            &["queue"],
        )?;

        let messages_rejected_total = CounterVec::new(
            Opts::new(
                "adapter_messages_rejected_total",
                "Total number of deliveries negatively acknowledged",
            ),
            &["queue"],
        )?;

        let messages_requeued_total = CounterVec::new(
            Opts::new(
                "adapter_messages_requeued_total",
                "Total number of deliveries republished to the tail of their queue",
            ),
            &["queue"],
        )?;

        let messages_published_total = CounterVec::new(
            Opts::new(
                "adapter_messages_published_total",
                "Total number of messages published",
            ),
            &["queue"],
        )?;

        let handler_failures_total = CounterVec::new(
            Opts::new(
                "adapter_handler_failures_total",
                "Total number of handler invocations that returned an error",
            ),
            &["queue", "error_type"],
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "adapter_message_processing_duration_seconds",
                "Time taken by the handler to process a message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue", "status"],
        )?;

        let active_consumers = Gauge::new(
            "adapter_active_consumers",
            "Number of active consumer loops",
        )?;

        registry.register(Box::new(connection_attempts_total.clone()))?;
        registry.register(Box::new(connection_failures_total.clone()))?;
        registry.register(Box::new(messages_delivered_total.clone()))?;
        registry.register(Box::new(messages_acked_total.clone()))?;
        registry.register(Box::new(messages_rejected_total.clone()))?;
        registry.register(Box::new(messages_requeued_total.clone()))?;
        registry.register(Box::new(messages_published_total.clone()))?;
        registry.register(Box::new(handler_failures_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;

        Ok(Arc::new(Self {
            connection_attempts_total,
            connection_failures_total,
            messages_delivered_total,
            messages_acked_total,
            messages_rejected_total,
            messages_requeued_total,
            messages_published_total,
            handler_failures_total,
            message_processing_duration_seconds,
            active_consumers,
            registry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_exposes_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics
            .messages_acked_total
            .with_label_values(&["jobs"])
            .inc();

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.contains(&"adapter_messages_acked_total".to_string()));
        assert!(names.contains(&"adapter_connection_attempts_total".to_string()));
    }
}

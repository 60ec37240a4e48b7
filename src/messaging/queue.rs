use std::collections::BTreeMap;
use tracing::{error, info};

use super::error::DeclarationError;
use super::transport::BrokerChannel;

pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const MESSAGE_TTL: &str = "x-message-ttl";
pub const MAX_LENGTH: &str = "x-max-length";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

/// Queue-level settings applied at declaration time.
///
/// Two declarations of the same queue are equivalent only when both the
/// `durable` flag and every argument match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub durable: bool,
    arguments: BTreeMap<String, ArgumentValue>,
}

impl QueueArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: ArgumentValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn dead_letter_exchange(self, exchange: impl Into<String>) -> Self {
        self.with(DEAD_LETTER_EXCHANGE, ArgumentValue::Text(exchange.into()))
    }

    pub fn dead_letter_routing_key(self, routing_key: impl Into<String>) -> Self {
        self.with(DEAD_LETTER_ROUTING_KEY, ArgumentValue::Text(routing_key.into()))
    }

    pub fn message_ttl_ms(self, ttl_ms: i64) -> Self {
        self.with(MESSAGE_TTL, ArgumentValue::Int(ttl_ms))
    }

    pub fn max_length(self, max_length: i64) -> Self {
        self.with(MAX_LENGTH, ArgumentValue::Int(max_length))
    }

    pub fn get(&self, key: &str) -> Option<&ArgumentValue> {
        self.arguments.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgumentValue)> {
        self.arguments.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }
}

pub struct QueueRegistrar<'a> {
    channel: &'a dyn BrokerChannel,
}

impl<'a> QueueRegistrar<'a> {
    pub fn new(channel: &'a dyn BrokerChannel) -> Self {
        Self { channel }
    }

    /// Declares each queue in order, stopping at the first failure.
    pub async fn declare_queues<I, S>(
        &self,
        names: I,
        arguments: Option<&QueueArguments>,
    ) -> Result<(), DeclarationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let default_arguments = QueueArguments::default();
        let arguments = arguments.unwrap_or(&default_arguments);

        for name in names {
            self.declare_queue(name.as_ref(), arguments).await?;
        }

        Ok(())
    }

    pub async fn declare_queue(
        &self,
        name: &str,
        arguments: &QueueArguments,
    ) -> Result<(), DeclarationError> {
        self.channel
            .queue_declare(name, arguments)
            .await
            .map_err(|e| {
                error!(error = %e, queue = %name, "Queue declaration failed");
                DeclarationError {
                    queue: name.to_string(),
                    source: e,
                }
            })?;

        info!(
            queue = %name,
            durable = arguments.durable,
            arguments = arguments.arguments.len(),
            channel_id = self.channel.id(),
            "Queue declared"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::error::TransportError;
    use crate::messaging::in_memory::InMemoryBroker;

    #[tokio::test]
    async fn test_declaration_stops_at_first_failure() {
        let broker = InMemoryBroker::new();
        broker.fail_declare_of("b");
        let channel = broker.open_channel().await;

        let err = QueueRegistrar::new(channel.as_ref())
            .declare_queues(["a", "b", "c"], None)
            .await
            .unwrap_err();

        assert_eq!(err.queue, "b");
        assert_eq!(broker.declare_attempts(), vec!["a", "b"]);
        assert!(broker.has_queue("a"));
        assert!(!broker.has_queue("b"));
        assert!(!broker.has_queue("c"));
    }

    #[tokio::test]
    async fn test_redeclaration_is_idempotent() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await;
        let registrar = QueueRegistrar::new(channel.as_ref());
        let args = QueueArguments::new().durable(true).message_ttl_ms(5000);

        registrar.declare_queues(["jobs"], Some(&args)).await.unwrap();
        registrar.declare_queues(["jobs"], Some(&args)).await.unwrap();

        assert_eq!(broker.declare_attempts(), vec!["jobs", "jobs"]);
    }

    #[tokio::test]
    async fn test_conflicting_redeclaration_fails() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await;
        let registrar = QueueRegistrar::new(channel.as_ref());

        registrar
            .declare_queue("jobs", &QueueArguments::new().durable(true))
            .await
            .unwrap();

        let err = registrar
            .declare_queue("jobs", &QueueArguments::new().dead_letter_exchange(""))
            .await
            .unwrap_err();

        assert_eq!(err.queue, "jobs");
        assert!(matches!(err.source, TransportError::Protocol(_)));
    }

    #[test]
    fn test_argument_builders() {
        let args = QueueArguments::new()
            .dead_letter_exchange("")
            .dead_letter_routing_key("jobs.dlq")
            .max_length(100);

        assert_eq!(
            args.get(DEAD_LETTER_ROUTING_KEY),
            Some(&ArgumentValue::Text("jobs.dlq".to_string()))
        );
        assert_eq!(args.get(MAX_LENGTH), Some(&ArgumentValue::Int(100)));
        assert!(!args.durable);
        assert_eq!(args.iter().count(), 3);
    }
}

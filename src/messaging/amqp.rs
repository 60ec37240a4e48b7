use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{error, info};

use super::connection::ConnectionConfig;
use super::error::TransportError;
use super::queue::{ArgumentValue, QueueArguments};
use super::transport::{BrokerChannel, BrokerConnection, DeliveryStream, RawDelivery, Transport};

/// [`Transport`] backed by a real broker through `lapin`.
#[derive(Clone, Default)]
pub struct AmqpTransport {
    properties: ConnectionProperties,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

fn uri(config: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.credentials().username.clone(),
                password: config.credentials().password.clone(),
            },
            host: config.host().to_string(),
            port: config.port(),
        },
        vhost: config.vhost().to_string(),
        query: AMQPQueryString {
            heartbeat: config.heartbeat(),
            ..Default::default()
        },
    }
}

fn field_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments.iter() {
        let value = match value {
            ArgumentValue::Text(s) => AMQPValue::LongString(s.clone().into()),
            ArgumentValue::Int(n) => AMQPValue::LongLongInt(*n),
            ArgumentValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(key.into(), value);
    }
    table
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let connection = Connection::connect_uri(uri(config), self.properties.clone())
            .await
            .map_err(|e| {
                error!(error = %e, endpoint = %config.endpoint(), "Failed to connect to RabbitMQ");
                match TransportError::from(e) {
                    TransportError::Io(reason) => TransportError::Refused(reason),
                    other => other,
                }
            })?;

        Ok(Box::new(AmqpConnection { connection }))
    }
}

pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        info!("Creating RabbitMQ channel");
        let channel = self.connection.create_channel().await?;
        info!(channel_id = channel.id(), "Channel created successfully");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn queue_declare(
        &self,
        queue: &str,
        arguments: &QueueArguments,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: arguments.durable,
                    ..Default::default()
                },
                field_table(arguments),
            )
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| RawDelivery {
                        delivery_tag: d.delivery_tag,
                        routing_key: d.routing_key.as_str().to_string(),
                        redelivered: d.redelivered,
                        data: d.data,
                    })
                    .map_err(TransportError::from)
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), TransportError> {
        // Without confirm mode the confirmation resolves immediately.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::connection::Credentials;
    use crate::messaging::queue::{DEAD_LETTER_EXCHANGE, MESSAGE_TTL};
    use lapin::types::ShortString;

    #[test]
    fn test_uri_carries_heartbeat_only_when_set() {
        let config = ConnectionConfig::new("broker", 5673, Credentials::new("user", "pass"))
            .with_vhost("jobs");

        let negotiated = uri(&config);
        assert_eq!(negotiated.authority.host, "broker");
        assert_eq!(negotiated.authority.port, 5673);
        assert_eq!(negotiated.authority.userinfo.username, "user");
        assert_eq!(negotiated.vhost, "jobs");
        assert_eq!(negotiated.query.heartbeat, None);

        let disabled = uri(&config.with_heartbeat(Some(0)));
        assert_eq!(disabled.query.heartbeat, Some(0));
    }

    #[test]
    fn test_field_table_conversion() {
        let args = QueueArguments::new()
            .dead_letter_exchange("")
            .message_ttl_ms(5000);

        let table = field_table(&args);
        let inner = table.inner();

        assert_eq!(
            inner.get(&ShortString::from(DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString("".into()))
        );
        assert_eq!(inner.get(&ShortString::from(MESSAGE_TTL)), Some(&AMQPValue::LongLongInt(5000)));
    }
}

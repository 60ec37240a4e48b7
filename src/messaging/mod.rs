pub mod adapter;
pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod handler;
#[cfg(any(test, feature = "testing"))]
pub mod in_memory;
pub mod queue;
pub mod transport;

pub use adapter::BrokerAdapter;
pub use amqp::AmqpTransport;
pub use connection::{ConnectionConfig, Connector, Credentials, RetryPolicy};
pub use consumer::{ConsumeOptions, Consumer, UnresolvedPolicy};
pub use delivery::{DeliveryController, DeliveryHandle, Message};
pub use error::{
    AckError, ConnectionError, ConsumeError, DeclarationError, PublishError, RequeueError,
    TransportError,
};
pub use handler::{HandlerError, MessageHandler};
#[cfg(any(test, feature = "testing"))]
pub use in_memory::InMemoryBroker;
pub use queue::{ArgumentValue, QueueArguments, QueueRegistrar};
pub use transport::{BrokerChannel, BrokerConnection, DeliveryStream, RawDelivery, Transport};

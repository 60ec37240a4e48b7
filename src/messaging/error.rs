/// Failure reported by a transport primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Broker protocol error: {0}")]
    Protocol(String),
}

impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::InvalidChannelState(_) => TransportError::ChannelClosed,
            lapin::Error::InvalidConnectionState(_) => TransportError::ConnectionClosed,
            lapin::Error::IOError(io) => TransportError::Io(io.to_string()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to RabbitMQ after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Failed to shutdown connection gracefully: {0}")]
    ShutdownFailed(#[source] TransportError),
}

impl ConnectionError {
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. } => Some(*attempts),
            Self::ShutdownFailed(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to declare queue '{queue}': {source}")]
pub struct DeclarationError {
    pub queue: String,
    #[source]
    pub source: TransportError,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("Prefetch count must be greater than zero")]
    InvalidPrefetch,

    #[error("Failed to configure channel QoS: {0}")]
    Qos(#[source] TransportError),

    #[error("Failed to start consumer on queue '{queue}': {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("Error receiving message from RabbitMQ: {0}")]
    Stream(#[source] TransportError),

    #[error("Consumer stream on queue '{queue}' ended without a shutdown request")]
    StreamEnded { queue: String },

    #[error("Handler returned without resolving delivery {delivery_tag} from queue '{queue}'")]
    UnresolvedDelivery { queue: String, delivery_tag: u64 },

    #[error("Failed to settle unresolved delivery from queue '{queue}': {source}")]
    Resolve {
        queue: String,
        #[source]
        source: AckError,
    },

    #[error("A consumer is already running on this channel")]
    AlreadyConsuming,
}

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("Delivery {delivery_tag} belongs to another channel")]
    ForeignHandle { delivery_tag: u64 },

    #[error("Delivery {delivery_tag} was already resolved")]
    AlreadyResolved { delivery_tag: u64 },

    #[error("Failed to resolve delivery {delivery_tag}: {source}")]
    Transport {
        delivery_tag: u64,
        #[source]
        source: TransportError,
    },
}

impl AckError {
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to publish to queue '{queue}': {source}")]
pub struct PublishError {
    pub queue: String,
    #[source]
    pub source: TransportError,
}

/// Failure of the two-step publish-then-ack requeue.
///
/// `Ack` after a successful publish means the message now exists twice: the
/// new tail copy and the unacknowledged original, which the broker redelivers
/// once the channel drops.
#[derive(Debug, thiserror::Error)]
pub enum RequeueError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Ack(#[from] AckError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_io_errors_are_not_reported_as_refusals() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = TransportError::from(lapin::Error::IOError(Arc::new(reset)));

        assert!(matches!(err, TransportError::Io(ref msg) if msg.contains("reset by peer")));
        assert!(!err.to_string().contains("refused"));
    }
}

use async_trait::async_trait;

use super::delivery::{DeliveryController, Message};

/// Processes one delivery at a time.
///
/// Before returning, an implementation must resolve `message.handle()`
/// through exactly one of `deliveries.acknowledge`,
/// `deliveries.reject_and_requeue` or `deliveries.nack`. A handle left
/// unresolved is handled by the consumer's [`super::consumer::UnresolvedPolicy`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &Message,
        deliveries: &DeliveryController,
    ) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Transient error (will retry): {0}")]
    Transient(String),

    #[error("Permanent error (will not retry): {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}

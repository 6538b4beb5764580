use std::fmt;

use thiserror::Error;

/// Failure reported by the queue while settling a delivery.
#[derive(Debug, Error)]
#[error("failed to settle delivery: {0}")]
pub struct AckError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

/// One message handed over by the queue, with the obligation to settle it.
///
/// Both terminal operations take the delivery by value, so a delivery can be
/// settled at most once. Dropping it unsettled leaves redelivery to the queue.
pub trait Delivery {
    fn payload(&self) -> &[u8];

    /// Removes the message from the queue.
    async fn ack(self) -> Result<(), AckError>;

    /// Rejects the message; with `requeue` the queue delivers it again.
    async fn nack(self, requeue: bool) -> Result<(), AckError>;
}

/// How the dispatcher resolves a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

impl Settlement {
    pub async fn apply<D: Delivery>(self, delivery: D) -> Result<(), AckError> {
        match self {
            Settlement::Ack => delivery.ack().await,
            Settlement::Nack { requeue } => delivery.nack(requeue).await,
        }
    }
}

impl fmt::Display for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Settlement::Ack => write!(f, "ack"),
            Settlement::Nack { requeue: true } => write!(f, "nack+requeue"),
            Settlement::Nack { requeue: false } => write!(f, "nack"),
        }
    }
}

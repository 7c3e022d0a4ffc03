use thiserror::Error;

use super::delivery::DeliveryOutcome;

/// Reasons why an event could not be delivered to a subscriber.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DeliveryError {
    /// Delivery might succeed if attempted again.
    #[error("Retryable delivery failure: {0}")]
    Retryable(String),

    /// Delivery will never succeed: retrying is pointless.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn outcome(&self) -> DeliveryOutcome {
        match self {
            DeliveryError::Retryable(_) => DeliveryOutcome::Retryable,
            DeliveryError::Permanent(_) => DeliveryOutcome::Permanent,
        }
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

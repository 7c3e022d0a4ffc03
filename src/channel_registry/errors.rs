use thiserror::Error;

/// Reasons why a desired state can't be applied to the [`super::ChannelRegistry`].
#[derive(Error, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// Subscription identifier is not usable as part of a Consumer Group identifier.
    #[error("Subscription identifier '{0}' is not valid")]
    InvalidSubscriptionId(String),

    /// Subscription was given for a channel, but declares a different one.
    #[error("Subscription '{id}' declares channel '{declared}', but was given for '{given}'")]
    ChannelMismatch { id: String, declared: String, given: String },

    /// Same subscription identifier appears more than once.
    #[error("Subscription '{0}' is duplicated")]
    DuplicateSubscription(String),

    /// Subscription identifier is already used by a subscription of another channel.
    #[error("Subscription '{id}' already belongs to channel '{owner}'")]
    SubscriptionConflict { id: String, owner: String },

    /// The desired state source could not be read or parsed.
    #[error("Invalid desired state: {0}")]
    InvalidDesiredState(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

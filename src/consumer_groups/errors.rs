use thiserror::Error;

/// Failures of a consumer group session.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SessionError {
    /// Brokers could not be reached, or the session lost its connection.
    ///
    /// Transient: the session is restarted with backoff.
    #[error("Connection failure: {0}")]
    Connection(String),

    /// Brokers rejected the credentials (or the permissions) of the session.
    ///
    /// Terminal for the consumer group, until a new broker configuration is active.
    #[error("Authentication failure: {0}")]
    Auth(String),

    /// Processed offsets could not be committed.
    #[error("Offset commit failure: {0}")]
    Commit(String),
}

impl SessionError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SessionError::Auth(_))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

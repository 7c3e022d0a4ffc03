use thiserror::Error;

/// Reasons why a settings candidate can't become a [`super::BrokerConfig`].
///
/// Every variant that concerns a single option carries the option name, exactly as it
/// appears in the settings (e.g. `Producer.RequiredAcks`).
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// One of the settings blobs is not a valid YAML document.
    #[error("Settings '{key}' are not valid YAML: {reason}")]
    MalformedSettings { key: &'static str, reason: String },

    /// A required option is missing (or empty).
    #[error("Missing required setting '{field}'")]
    MissingField { field: &'static str },

    /// An option is present, but its value is not acceptable.
    #[error("Invalid setting '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ConfigError {
    /// Name of the offending option, if the error concerns a single option.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ConfigError::MalformedSettings { .. } => None,
            ConfigError::MissingField { field } | ConfigError::InvalidField { field, .. } => {
                Some(field)
            },
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

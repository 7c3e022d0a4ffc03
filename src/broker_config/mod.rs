// Inner modules
mod config;
mod errors;
mod settings;

// Exports
pub use config::BrokerConfig;
pub use errors::ConfigResult;
pub use settings::{parse_broker_config, RawSettings, EVENTING_KAFKA_SETTINGS_KEY, SARAMA_SETTINGS_KEY};

#[cfg(test)]
pub(crate) use config::test::make_config;
#[cfg(test)]
pub(crate) use settings::test as settings_fixtures;

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_yaml::Value;

use super::config::{
    BrokerConfig, DispatcherSettings, RequiredAcks, SaslConfig, SaslMechanism, TlsConfig,
};
use super::errors::{ConfigError, ConfigResult};
use crate::dispatcher::RetryPolicy;

/// Key of the settings blob with the Kafka client options.
pub const SARAMA_SETTINGS_KEY: &str = "sarama";

/// Key of the settings blob with the broker list and the dispatcher options.
pub const EVENTING_KAFKA_SETTINGS_KEY: &str = "eventing-kafka";

const PEM_PREFIX: &str = "-----BEGIN";

/// Raw settings, as delivered by the settings source: blobs of YAML, indexed by key.
///
/// Recognized keys are [`SARAMA_SETTINGS_KEY`] and [`EVENTING_KAFKA_SETTINGS_KEY`]:
/// any other key is ignored.
pub type RawSettings = BTreeMap<String, String>;

/// Options recognized in the settings.
///
/// Each option lives at a dotted path, inside one of the settings blobs.
/// Anything in the settings that is not listed here is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    Brokers,
    TlsEnable,
    TlsCaCert,
    TlsCert,
    TlsKey,
    SaslEnable,
    SaslMechanism,
    SaslUser,
    SaslPassword,
    ClientId,
    Version,
    AdminTimeout,
    NetKeepAlive,
    MetadataRefreshFrequency,
    ConsumerOffsetsAutoCommitInterval,
    ConsumerOffsetsRetention,
    ProducerIdempotent,
    ProducerRequiredAcks,
    DispatcherReplicas,
    DispatcherRetryInitialIntervalMillis,
    DispatcherRetryTimeMillis,
    DispatcherRetryExponentialBackoff,
}

impl Setting {
    /// Dotted path of the option, within its settings blob.
    pub const fn path(&self) -> &'static str {
        match self {
            Setting::Brokers => "kafka.brokers",
            Setting::TlsEnable => "Net.TLS.Enable",
            Setting::TlsCaCert => "Net.TLS.CACert",
            Setting::TlsCert => "Net.TLS.Cert",
            Setting::TlsKey => "Net.TLS.Key",
            Setting::SaslEnable => "Net.SASL.Enable",
            Setting::SaslMechanism => "Net.SASL.Mechanism",
            Setting::SaslUser => "Net.SASL.User",
            Setting::SaslPassword => "Net.SASL.Password",
            Setting::ClientId => "ClientID",
            Setting::Version => "Version",
            Setting::AdminTimeout => "Admin.Timeout",
            Setting::NetKeepAlive => "Net.KeepAlive",
            Setting::MetadataRefreshFrequency => "Metadata.RefreshFrequency",
            Setting::ConsumerOffsetsAutoCommitInterval => "Consumer.Offsets.AutoCommit.Interval",
            Setting::ConsumerOffsetsRetention => "Consumer.Offsets.Retention",
            Setting::ProducerIdempotent => "Producer.Idempotent",
            Setting::ProducerRequiredAcks => "Producer.RequiredAcks",
            Setting::DispatcherReplicas => "dispatcher.replicas",
            Setting::DispatcherRetryInitialIntervalMillis => "dispatcher.retryInitialIntervalMillis",
            Setting::DispatcherRetryTimeMillis => "dispatcher.retryTimeMillis",
            Setting::DispatcherRetryExponentialBackoff => "dispatcher.retryExponentialBackoff",
        }
    }

    /// Key of the settings blob the option lives in.
    pub const fn source(&self) -> &'static str {
        match self {
            Setting::Brokers
            | Setting::DispatcherReplicas
            | Setting::DispatcherRetryInitialIntervalMillis
            | Setting::DispatcherRetryTimeMillis
            | Setting::DispatcherRetryExponentialBackoff => EVENTING_KAFKA_SETTINGS_KEY,
            _ => SARAMA_SETTINGS_KEY,
        }
    }
}

/// Defaults of the options that are not required.
mod defaults {
    use std::time::Duration;

    pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);
    pub const NET_KEEP_ALIVE: Duration = Duration::from_secs(30);
    pub const METADATA_REFRESH_FREQUENCY: Duration = Duration::from_secs(300);
    pub const CONSUMER_OFFSETS_AUTO_COMMIT_INTERVAL: Duration = Duration::from_secs(5);
    pub const CONSUMER_OFFSETS_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
    pub const PRODUCER_REQUIRED_ACKS: i64 = -1;
    pub const DISPATCHER_REPLICAS: i64 = 1;
    pub const DISPATCHER_RETRY_INITIAL_INTERVAL_MILLIS: i64 = 500;
    pub const DISPATCHER_RETRY_TIME_MILLIS: i64 = 300_000;
}

fn broker_address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\[[0-9A-Fa-f:.]+\]|[A-Za-z0-9][A-Za-z0-9._-]*):([0-9]{1,5})$")
            .unwrap_or_else(|e| panic!("Invalid broker address regex: {e}"))
    })
}

fn kafka_version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+(\.[0-9]+)?$")
            .unwrap_or_else(|e| panic!("Invalid kafka version regex: {e}"))
    })
}

/// The parsed settings blobs, from which each [`Setting`] is looked up.
struct SettingsTree {
    sarama: Value,
    eventing_kafka: Value,
}

impl SettingsTree {
    fn parse(raw: &RawSettings) -> ConfigResult<Self> {
        Ok(Self {
            sarama: parse_blob(raw, SARAMA_SETTINGS_KEY)?,
            eventing_kafka: parse_blob(raw, EVENTING_KAFKA_SETTINGS_KEY)?,
        })
    }

    /// Finds the value of a [`Setting`], if present (`null` counts as absent).
    fn lookup(&self, setting: Setting) -> Option<&Value> {
        let root = match setting.source() {
            SARAMA_SETTINGS_KEY => &self.sarama,
            _ => &self.eventing_kafka,
        };

        setting
            .path()
            .split('.')
            .try_fold(root, |node, segment| node.get(segment))
            .filter(|v| !v.is_null())
    }

    fn string(&self, setting: Setting) -> ConfigResult<Option<String>> {
        match self.lookup(setting) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(invalid(setting, format!("expected a string, found {other:?}"))),
        }
    }

    fn bool(&self, setting: Setting) -> ConfigResult<Option<bool>> {
        match self.lookup(setting) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(invalid(setting, format!("expected a boolean, found '{s}'"))),
            },
            Some(other) => Err(invalid(setting, format!("expected a boolean, found {other:?}"))),
        }
    }

    fn integer(&self, setting: Setting) -> ConfigResult<Option<i64>> {
        match self.lookup(setting) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| invalid(setting, format!("expected an integer, found '{n}'"))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|e| invalid(setting, format!("expected an integer, found '{s}': {e}"))),
            Some(other) => Err(invalid(setting, format!("expected an integer, found {other:?}"))),
        }
    }

    fn non_negative(&self, setting: Setting, default: i64) -> ConfigResult<u64> {
        let value = self.integer(setting)?.unwrap_or(default);
        u64::try_from(value).map_err(|_| invalid(setting, format!("must not be negative, found {value}")))
    }

    /// Durations are expressed in nanoseconds.
    fn duration_nanos(&self, setting: Setting, default: Duration) -> ConfigResult<Duration> {
        match self.integer(setting)? {
            None => Ok(default),
            Some(nanos) => u64::try_from(nanos)
                .map(Duration::from_nanos)
                .map_err(|_| invalid(setting, format!("duration must not be negative, found {nanos}ns"))),
        }
    }

    fn duration_millis(&self, setting: Setting, default: i64) -> ConfigResult<Duration> {
        self.non_negative(setting, default).map(Duration::from_millis)
    }

    /// Either a YAML sequence, or a comma separated string.
    fn string_list(&self, setting: Setting) -> ConfigResult<Vec<String>> {
        let items = match self.lookup(setting) {
            None => Vec::new(),
            Some(Value::String(s)) => s.split(',').map(|s| s.trim().to_string()).collect(),
            Some(Value::Sequence(seq)) => seq
                .iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s.trim().to_string()),
                    other => Err(invalid(setting, format!("expected a string, found {other:?}"))),
                })
                .collect::<ConfigResult<Vec<String>>>()?,
            Some(other) => {
                return Err(invalid(setting, format!("expected a list, found {other:?}")));
            },
        };

        Ok(items.into_iter().filter(|s| !s.is_empty()).collect())
    }
}

fn parse_blob(raw: &RawSettings, key: &'static str) -> ConfigResult<Value> {
    match raw.get(key) {
        None => Ok(Value::Null),
        Some(blob) if blob.trim().is_empty() => Ok(Value::Null),
        Some(blob) => match serde_yaml::from_str::<Value>(blob) {
            Ok(v @ (Value::Mapping(_) | Value::Null)) => Ok(v),
            Ok(other) => Err(ConfigError::MalformedSettings {
                key,
                reason: format!("expected a mapping at the top level, found {other:?}"),
            }),
            Err(e) => Err(ConfigError::MalformedSettings {
                key,
                reason: e.to_string(),
            }),
        },
    }
}

fn invalid(setting: Setting, reason: String) -> ConfigError {
    ConfigError::InvalidField {
        field: setting.path(),
        reason,
    }
}

fn missing(setting: Setting) -> ConfigError {
    ConfigError::MissingField {
        field: setting.path(),
    }
}

fn parse_broker_addresses(tree: &SettingsTree) -> ConfigResult<Vec<String>> {
    let addresses = tree.string_list(Setting::Brokers)?;
    if addresses.is_empty() {
        return Err(missing(Setting::Brokers));
    }

    for address in &addresses {
        let port_ok = broker_address_regex()
            .captures(address)
            .and_then(|c| c.get(2))
            .is_some_and(|p| p.as_str().parse::<u16>().is_ok_and(|p| p > 0));
        if !port_ok {
            return Err(invalid(Setting::Brokers, format!("'{address}' is not a valid HOST:PORT")));
        }
    }

    Ok(addresses)
}

fn parse_pem(tree: &SettingsTree, setting: Setting) -> ConfigResult<Option<String>> {
    match tree.string(setting)? {
        Some(pem) if !pem.starts_with(PEM_PREFIX) => {
            Err(invalid(setting, "expected PEM encoded material".to_string()))
        },
        other => Ok(other),
    }
}

fn parse_tls(tree: &SettingsTree) -> ConfigResult<Option<TlsConfig>> {
    if !tree.bool(Setting::TlsEnable)?.unwrap_or(false) {
        return Ok(None);
    }

    let tls = TlsConfig {
        enabled: true,
        ca_cert: parse_pem(tree, Setting::TlsCaCert)?,
        cert: parse_pem(tree, Setting::TlsCert)?,
        key: parse_pem(tree, Setting::TlsKey)?,
    };

    // Client certificate and key only make sense together
    match (&tls.cert, &tls.key) {
        (Some(_), None) => Err(missing(Setting::TlsKey)),
        (None, Some(_)) => Err(missing(Setting::TlsCert)),
        _ => Ok(Some(tls)),
    }
}

fn parse_sasl(tree: &SettingsTree) -> ConfigResult<Option<SaslConfig>> {
    if !tree.bool(Setting::SaslEnable)?.unwrap_or(false) {
        return Ok(None);
    }

    let mechanism = match tree.string(Setting::SaslMechanism)? {
        None => SaslMechanism::Plain,
        Some(m) => SaslMechanism::from_wire(&m).ok_or_else(|| {
            invalid(
                Setting::SaslMechanism,
                format!("'{m}' is not one of PLAIN, SCRAM-SHA-256, SCRAM-SHA-512"),
            )
        })?,
    };

    Ok(Some(SaslConfig {
        mechanism,
        user: tree.string(Setting::SaslUser)?.ok_or_else(|| missing(Setting::SaslUser))?,
        password: tree.string(Setting::SaslPassword)?.ok_or_else(|| missing(Setting::SaslPassword))?,
    }))
}

fn parse_dispatcher(tree: &SettingsTree) -> ConfigResult<DispatcherSettings> {
    let replicas = tree.non_negative(Setting::DispatcherReplicas, defaults::DISPATCHER_REPLICAS)?;
    let replicas = u32::try_from(replicas)
        .map_err(|_| invalid(Setting::DispatcherReplicas, format!("{replicas} is too large")))?;

    let initial_interval = tree.duration_millis(
        Setting::DispatcherRetryInitialIntervalMillis,
        defaults::DISPATCHER_RETRY_INITIAL_INTERVAL_MILLIS,
    )?;
    if initial_interval.is_zero() {
        return Err(invalid(
            Setting::DispatcherRetryInitialIntervalMillis,
            "must be greater than zero".to_string(),
        ));
    }

    Ok(DispatcherSettings {
        replicas,
        retry: RetryPolicy {
            initial_interval,
            max_total_retry_time: tree.duration_millis(
                Setting::DispatcherRetryTimeMillis,
                defaults::DISPATCHER_RETRY_TIME_MILLIS,
            )?,
            exponential_backoff: tree
                .bool(Setting::DispatcherRetryExponentialBackoff)?
                .unwrap_or(true),
        },
    })
}

/// Parse and validate [`RawSettings`] into a [`BrokerConfig`] candidate.
///
/// The returned candidate has `version` set to `0`: it's up to the caller to
/// assign it a version, once it decides to accept it.
///
/// Validation fails, naming the offending option, when:
///
/// * a blob is not valid YAML
/// * a required option (`kafka.brokers`, SASL credentials when SASL is enabled) is missing
/// * a value has the wrong type, is negative where it can't be, or is out of range
/// * a client TLS certificate is given without its key (or vice versa), or is not PEM
/// * `Producer.Idempotent` is enabled, but `Producer.RequiredAcks` is not `WaitForAll` (`-1`)
pub fn parse_broker_config(raw: &RawSettings) -> ConfigResult<BrokerConfig> {
    let tree = SettingsTree::parse(raw)?;

    let kafka_version = tree.string(Setting::Version)?;
    if let Some(v) = &kafka_version {
        if !kafka_version_regex().is_match(v) {
            return Err(invalid(Setting::Version, format!("'{v}' is not a valid Kafka version")));
        }
    }

    let acks_value =
        tree.integer(Setting::ProducerRequiredAcks)?.unwrap_or(defaults::PRODUCER_REQUIRED_ACKS);
    let producer_required_acks = RequiredAcks::from_wire(acks_value).ok_or_else(|| {
        invalid(
            Setting::ProducerRequiredAcks,
            format!("{acks_value} is not one of 0 (NoResponse), 1 (WaitForLocal), -1 (WaitForAll)"),
        )
    })?;
    let producer_idempotent = tree.bool(Setting::ProducerIdempotent)?.unwrap_or(false);
    if producer_idempotent && producer_required_acks != RequiredAcks::WaitForAll {
        return Err(invalid(
            Setting::ProducerRequiredAcks,
            format!(
                "must be -1 (WaitForAll) when {} is enabled, found {acks_value}",
                Setting::ProducerIdempotent.path()
            ),
        ));
    }

    Ok(BrokerConfig {
        version: 0,
        broker_addresses: parse_broker_addresses(&tree)?,
        tls: parse_tls(&tree)?,
        sasl: parse_sasl(&tree)?,
        client_id: tree
            .string(Setting::ClientId)?
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
        kafka_version,
        admin_timeout: tree.duration_nanos(Setting::AdminTimeout, defaults::ADMIN_TIMEOUT)?,
        net_keep_alive: tree.duration_nanos(Setting::NetKeepAlive, defaults::NET_KEEP_ALIVE)?,
        metadata_refresh_interval: tree
            .duration_nanos(Setting::MetadataRefreshFrequency, defaults::METADATA_REFRESH_FREQUENCY)?,
        consumer_offsets_auto_commit_interval: tree.duration_nanos(
            Setting::ConsumerOffsetsAutoCommitInterval,
            defaults::CONSUMER_OFFSETS_AUTO_COMMIT_INTERVAL,
        )?,
        consumer_offsets_retention: tree
            .duration_nanos(Setting::ConsumerOffsetsRetention, defaults::CONSUMER_OFFSETS_RETENTION)?,
        producer_idempotent,
        producer_required_acks,
        dispatcher: parse_dispatcher(&tree)?,
    })
}

use std::fmt;
use std::time::Duration;

use rdkafka::ClientConfig;

use crate::dispatcher::RetryPolicy;

/// Acknowledgements the producer requires from the brokers, before considering a write done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequiredAcks {
    /// `0`: don't wait for any acknowledgement
    NoResponse,
    /// `1`: wait for the partition leader only
    WaitForLocal,
    /// `-1`: wait for all the in-sync replicas
    WaitForAll,
}

impl RequiredAcks {
    /// Parse the numeric value used in the settings.
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(RequiredAcks::NoResponse),
            1 => Some(RequiredAcks::WaitForLocal),
            -1 => Some(RequiredAcks::WaitForAll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(SaslMechanism::Plain),
            "SCRAM-SHA-256" => Some(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Some(SaslMechanism::ScramSha512),
            _ => None,
        }
    }

    /// Value of the `sasl.mechanism` Kafka client configuration.
    pub fn as_kafka_mechanism(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// TLS material, all PEM encoded.
///
/// When none is provided, the system trust store is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for SaslConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslConfig")
            .field("mechanism", &self.mechanism)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings that concern the dispatcher itself, rather than the Kafka clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatcherSettings {
    /// Desired replicas of the dispatcher (informational: scaling is up to the control plane)
    pub replicas: u32,

    /// Retry policy of subscriptions that don't define their own
    pub retry: RetryPolicy,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            replicas: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// Immutable, validated and versioned snapshot of the Kafka connection parameters.
///
/// Instances are never mutated once published: when settings change, a whole new
/// [`BrokerConfig`] with a greater `version` replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerConfig {
    /// Monotonically increasing: assigned by the `ConfigWatcher` when the config is accepted
    pub version: u64,

    /// Bootstrap brokers, as `HOST:PORT`, in the order they were given
    pub broker_addresses: Vec<String>,
    pub tls: Option<TlsConfig>,
    pub sasl: Option<SaslConfig>,
    pub client_id: String,

    /// Kafka protocol version of the brokers, if known (e.g. `2.3.0`)
    pub kafka_version: Option<String>,

    pub admin_timeout: Duration,
    pub net_keep_alive: Duration,
    pub metadata_refresh_interval: Duration,
    pub consumer_offsets_auto_commit_interval: Duration,
    pub consumer_offsets_retention: Duration,
    pub producer_idempotent: bool,
    pub producer_required_acks: RequiredAcks,

    pub dispatcher: DispatcherSettings,
}

impl BrokerConfig {
    /// `true` if `other` carries the same settings as `self`, regardless of `version`.
    pub fn same_settings(&self, other: &BrokerConfig) -> bool {
        BrokerConfig {
            version: other.version,
            ..self.clone()
        } == *other
    }

    /// `true` if moving from `self` to `other` requires consumers to reconnect.
    ///
    /// Only [`DispatcherSettings`] can change without a reconnect: the dispatcher reads
    /// the latest retry policy at every event.
    pub fn requires_reconnect(&self, other: &BrokerConfig) -> bool {
        !BrokerConfig {
            version: other.version,
            dispatcher: other.dispatcher.clone(),
            ..self.clone()
        }
        .same_settings(other)
    }

    /// Kafka `security.protocol` implied by the TLS and SASL settings.
    pub fn security_protocol(&self) -> &'static str {
        let tls = self.tls.as_ref().is_some_and(|t| t.enabled);
        match (tls, self.sasl.is_some()) {
            (false, false) => "plaintext",
            (true, false) => "ssl",
            (false, true) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        }
    }

    /// Build the Kafka client configuration for a consumer of the given Consumer Group.
    ///
    /// Offsets are stored explicitly, only once an event has been handled,
    /// and auto-committed every `consumer_offsets_auto_commit_interval`.
    /// A group that never committed starts from the earliest available offset.
    ///
    /// # Arguments
    ///
    /// * `group_id` - Consumer Group identifier (`group.id`)
    pub fn consumer_client_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.broker_addresses.join(","))
            .set("client.id", self.client_id.clone())
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set(
                "auto.commit.interval.ms",
                self.consumer_offsets_auto_commit_interval.as_millis().to_string(),
            )
            .set(
                "topic.metadata.refresh.interval.ms",
                self.metadata_refresh_interval.as_millis().to_string(),
            )
            .set("socket.keepalive.enable", (!self.net_keep_alive.is_zero()).to_string())
            .set("security.protocol", self.security_protocol());

        if let Some(version) = &self.kafka_version {
            config.set("broker.version.fallback", version.clone());
        }

        if let Some(tls) = self.tls.as_ref().filter(|t| t.enabled) {
            if let Some(ca) = &tls.ca_cert {
                config.set("ssl.ca.pem", ca.clone());
            }
            if let Some(cert) = &tls.cert {
                config.set("ssl.certificate.pem", cert.clone());
            }
            if let Some(key) = &tls.key {
                config.set("ssl.key.pem", key.clone());
            }
        }

        if let Some(sasl) = &self.sasl {
            config
                .set("sasl.mechanism", sasl.mechanism.as_kafka_mechanism())
                .set("sasl.username", sasl.user.clone())
                .set("sasl.password", sasl.password.clone());
        }

        config
    }
}

impl fmt::Display for BrokerConfig {
    /// One-line summary, safe to log (no credentials).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} brokers=[{}] client.id={} security={} sasl.user={} idempotent={} acks={:?} retry={:?}",
            self.version,
            self.broker_addresses.join(","),
            self.client_id,
            self.security_protocol(),
            self.sasl.as_ref().map(|s| s.user.as_str()).unwrap_or("-"),
            self.producer_idempotent,
            self.producer_required_acks,
            self.dispatcher.retry,
        )
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::time::Duration;

    use super::{BrokerConfig, DispatcherSettings, RequiredAcks, SaslConfig, SaslMechanism, TlsConfig};
    use crate::dispatcher::RetryPolicy;

    pub(crate) fn make_config(version: u64, user: &str) -> BrokerConfig {
        BrokerConfig {
            version,
            broker_addresses: vec!["kafka-1:9092".to_string(), "kafka-2:9092".to_string()],
            tls: Some(TlsConfig {
                enabled: true,
                ..Default::default()
            }),
            sasl: Some(SaslConfig {
                mechanism: SaslMechanism::Plain,
                user: user.to_string(),
                password: format!("{user}-password"),
            }),
            client_id: "kdispatch".to_string(),
            kafka_version: Some("2.3.0".to_string()),
            admin_timeout: Duration::from_secs(10),
            net_keep_alive: Duration::from_secs(30),
            metadata_refresh_interval: Duration::from_secs(300),
            consumer_offsets_auto_commit_interval: Duration::from_secs(5),
            consumer_offsets_retention: Duration::from_secs(604_800),
            producer_idempotent: false,
            producer_required_acks: RequiredAcks::WaitForAll,
            dispatcher: DispatcherSettings::default(),
        }
    }

    #[test]
    fn should_render_consumer_client_config() {
        let config = make_config(3, "alice");
        let cc = config.consumer_client_config("kafka.sub-1");

        assert_eq!(cc.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(cc.get("group.id"), Some("kafka.sub-1"));
        assert_eq!(cc.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(cc.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(cc.get("sasl.username"), Some("alice"));
        assert_eq!(cc.get("sasl.password"), Some("alice-password"));
        assert_eq!(cc.get("auto.commit.interval.ms"), Some("5000"));
        assert_eq!(cc.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(cc.get("topic.metadata.refresh.interval.ms"), Some("300000"));
        assert_eq!(cc.get("socket.keepalive.enable"), Some("true"));
        assert_eq!(cc.get("broker.version.fallback"), Some("2.3.0"));
        assert_eq!(cc.get("ssl.ca.pem"), None);
    }

    #[test]
    fn should_tell_when_reconnect_is_required() {
        let a = make_config(1, "alice");

        let mut same_but_newer = a.clone();
        same_but_newer.version = 2;
        assert!(a.same_settings(&same_but_newer));
        assert!(!a.requires_reconnect(&same_but_newer));

        let mut retry_changed = same_but_newer.clone();
        retry_changed.dispatcher.retry = RetryPolicy {
            initial_interval: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert!(!a.same_settings(&retry_changed));
        assert!(!a.requires_reconnect(&retry_changed));

        let b = make_config(3, "bob");
        assert!(a.requires_reconnect(&b));
    }

    #[test]
    fn should_not_leak_password() {
        let config = make_config(1, "alice");

        assert!(!format!("{config:?}").contains("alice-password"));
        assert!(!format!("{config}").contains("alice-password"));
        assert!(format!("{config}").contains("sasl.user=alice"));
    }
}

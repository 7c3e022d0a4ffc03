use std::time::Duration;

/// Default prefix of the Kafka Topics backing channels.
///
/// A channel `NAMESPACE/NAME` is backed by the topic `PREFIX.NAMESPACE.NAME`.
pub(crate) const DEFAULT_TOPIC_PREFIX: &str = "knative-messaging-kafka";

/// Prefix of the Consumer Group (`group.id`) used by each subscription.
///
/// The group identifier is derived from the subscription identifier only,
/// so that restarts rejoin the same group and resume from its committed offsets.
pub(crate) const CONSUMER_GROUP_ID_PREFIX: &str = "kafka.";

pub(crate) const DEFAULT_SETTINGS_DIR: &str = "/etc/config-kafka";
pub(crate) const DEFAULT_SETTINGS_POLL_INTERVAL_SECS: &str = "5";
pub(crate) const DEFAULT_SUBSCRIPTIONS_POLL_INTERVAL_SECS: &str = "5";

pub(crate) const DEFAULT_HTTP_HOST: &str = "0.0.0.0";
pub(crate) const DEFAULT_HTTP_PORT: &str = "8081";

/// Timeout applied to each HTTP delivery to a subscriber (or dead-letter sink).
///
/// Shorter than [`SESSION_STOP_TIMEOUT`]: a stopping session can always finish its in-flight delivery.
pub(crate) const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Restart policy for consumer group sessions that fail to start or crash.
pub(crate) const RESTART_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub(crate) const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(60);
pub(crate) const RESTART_MAX_ATTEMPTS: u32 = 8;

/// Consecutive connection failures after which a warning is surfaced.
pub(crate) const CONNECTION_FAILURES_WARN_THRESHOLD: u32 = 3;

/// How long a stopping session may take to finish its in-flight delivery,
/// before the delivery is interrupted and the session closed.
pub(crate) const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a rolling restart waits for a replacement session to leave `Starting`.
pub(crate) const SESSION_START_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

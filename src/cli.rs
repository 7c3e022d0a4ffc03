use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use tokio::time::Duration;

use crate::constants::{
    DEFAULT_HTTP_HOST, DEFAULT_HTTP_PORT, DEFAULT_SETTINGS_DIR, DEFAULT_SETTINGS_POLL_INTERVAL_SECS,
    DEFAULT_SUBSCRIPTIONS_POLL_INTERVAL_SECS, DEFAULT_TOPIC_PREFIX,
};

/// Command Line Interface, defined via the declarative,
/// `derive` based functionality of the `clap` crate.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("logging_flags")
        .required(false)
        .multiple(false)
        .args(["verbose", "quiet"]),
))]
pub struct Cli {
    // -------------------------------------------------------------------------- Broker settings
    /// Directory where the broker settings are mounted.
    ///
    /// It's expected to contain the files 'sarama' and 'eventing-kafka', one per key of the
    /// settings config map. Changes are picked up while running.
    #[arg(
        long = "settings-dir",
        value_name = "DIR",
        env = "KDISPATCH_SETTINGS_DIR",
        default_value = DEFAULT_SETTINGS_DIR,
        verbatim_doc_comment
    )]
    pub settings_dir: PathBuf,

    /// How often to check the settings directory for changes, in seconds.
    #[arg(
        long = "settings-poll-interval",
        value_name = "SECS",
        default_value = DEFAULT_SETTINGS_POLL_INTERVAL_SECS,
        value_parser = secs_clap_value_parser
    )]
    pub settings_poll_interval: Duration,

    /// Additional configuration of the Kafka consumers (format: 'CONF_KEY:CONF_VAL').
    ///
    /// Applied on top of what is derived from the broker settings.
    /// To set multiple configurations keys, use this argument multiple times.
    /// See: https://github.com/edenhill/librdkafka/blob/master/CONFIGURATION.md.
    #[arg(
        long = "kafka-conf",
        value_name = "CONF_KEY:CONF_VAL",
        value_parser = kv_clap_value_parser,
        verbatim_doc_comment
    )]
    pub kafka_config: Vec<KVPair>,

    // ---------------------------------------------------------------------------- Subscriptions
    /// YAML file declaring the channels and their subscriptions.
    ///
    /// Changes are picked up while running: channels missing from the file lose all their
    /// subscriptions.
    #[arg(
        long = "subscriptions-file",
        value_name = "FILE",
        env = "KDISPATCH_SUBSCRIPTIONS_FILE",
        verbatim_doc_comment
    )]
    pub subscriptions_file: PathBuf,

    /// How often to check the subscriptions file for changes, in seconds.
    #[arg(
        long = "subscriptions-poll-interval",
        value_name = "SECS",
        default_value = DEFAULT_SUBSCRIPTIONS_POLL_INTERVAL_SECS,
        value_parser = secs_clap_value_parser
    )]
    pub subscriptions_poll_interval: Duration,

    /// Prefix of the Kafka Topics backing channels.
    ///
    /// Channel 'NAMESPACE/NAME' is backed by Topic 'PREFIX.NAMESPACE.NAME'.
    #[arg(long = "topic-prefix", value_name = "PREFIX", default_value = DEFAULT_TOPIC_PREFIX, verbatim_doc_comment)]
    pub topic_prefix: String,

    /// Identifier of this dispatcher, used to label its metrics.
    #[arg(long = "client-id", value_name = "CLIENT_ID", default_value = env!("CARGO_PKG_NAME"))]
    pub client_id: String,

    // ------------------------------------------------------------------------------------- HTTP
    /// Host address to listen on for HTTP requests.
    ///
    /// Supports both IPv4 and IPv6 addresses.
    #[arg(long, default_value = DEFAULT_HTTP_HOST, verbatim_doc_comment)]
    pub host: IpAddr,

    /// Port to listen on for HTTP requests.
    #[arg(long, default_value = DEFAULT_HTTP_PORT, verbatim_doc_comment)]
    pub port: u16,

    /// Verbose logging.
    ///
    /// * none    = 'WARN'
    /// * '-v'    = 'INFO'
    /// * '-vv'   = 'DEBUG'
    /// * '-vvv'  = 'TRACE'
    ///
    /// Alternatively, set environment variable 'KDISPATCH_LOG=(ERROR|WARN|INFO|DEBUG|TRACE|OFF)'.
    #[arg(short, long, action = clap::ArgAction::Count, verbatim_doc_comment)]
    pub verbose: u8,

    /// Quiet logging.
    ///
    /// * none    = 'WARN'
    /// * '-q'    = 'ERROR'
    /// * '-qq'   = 'OFF'
    ///
    /// Alternatively, set environment variable 'KDISPATCH_LOG=(ERROR|WARN|INFO|DEBUG|TRACE|OFF)'.
    #[arg(short, long, action = clap::ArgAction::Count, verbatim_doc_comment)]
    pub quiet: u8,
}

impl Cli {
    pub fn parse_and_validate() -> Self {
        Self::parse()
    }

    pub fn verbosity_level(&self) -> i8 {
        self.verbose as i8 - self.quiet as i8
    }

    pub fn listen_on(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }
}

/// A simple (key,value) pair of `String`s, useful to be parsed from arguments via [`kv_clap_value_parser`].
pub type KVPair = (String, String);

/// To be used as [`clap::value_parser`] function to create [`KVPair`] values.
fn kv_clap_value_parser(kv: &str) -> Result<KVPair, String> {
    let (k, v) = match kv.split_once(':') {
        None => {
            return Err("Should have 'K:V' format".to_string());
        },
        Some((k, v)) => (k, v),
    };

    Ok((k.to_string(), v.to_string()))
}

fn secs_clap_value_parser(secs_str: &str) -> Result<Duration, String> {
    let secs = secs_str.parse::<u64>().map_err(|e| format!("Unable to parse {secs_str}: {e}"))?;

    if secs == 0 {
        return Err("Interval should be at least 1 second".to_string());
    }

    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod test {
    use clap::Parser;
    use tokio::time::Duration;

    use super::Cli;

    #[test]
    fn should_parse_arguments() {
        let cli = Cli::try_parse_from([
            "kdispatch",
            "--subscriptions-file",
            "/etc/kdispatch/subscriptions.yaml",
            "--settings-poll-interval",
            "10",
            "--kafka-conf",
            "fetch.wait.max.ms:100",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.settings_dir.to_str(), Some("/etc/config-kafka"));
        assert_eq!(cli.settings_poll_interval, Duration::from_secs(10));
        assert_eq!(cli.subscriptions_poll_interval, Duration::from_secs(5));
        assert_eq!(cli.kafka_config, vec![("fetch.wait.max.ms".to_string(), "100".to_string())]);
        assert_eq!(cli.topic_prefix, "knative-messaging-kafka");
        assert_eq!(cli.verbosity_level(), 2);
        assert_eq!(cli.listen_on().port(), 8081);
    }

    #[test]
    fn should_reject_invalid_arguments() {
        let base = ["kdispatch", "--subscriptions-file", "s.yaml"];

        assert!(Cli::try_parse_from(base.iter().chain(&["--settings-poll-interval", "0"])).is_err());
        assert!(Cli::try_parse_from(base.iter().chain(&["--kafka-conf", "no-separator"])).is_err());
        assert!(Cli::try_parse_from(base.iter().chain(&["-v", "-q"])).is_err());
        assert!(Cli::try_parse_from(["kdispatch"]).is_err());
    }
}

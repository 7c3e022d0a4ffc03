use env_logger::Builder;
use log::LevelFilter;

/// Environment variable that, if set, overrides the verbosity given on the command line.
///
/// Accepts the usual `env_logger` filter syntax, e.g. `KDISPATCH_LOG=kdispatch::dispatcher=debug`.
const LOG_ENV_VAR: &str = "KDISPATCH_LOG";

pub fn init(verbosity_level: i8) {
    let default_level = match verbosity_level {
        i8::MIN..=-2 => LevelFilter::Off,
        -1 => LevelFilter::Error,
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        3..=i8::MAX => LevelFilter::Trace,
    };

    Builder::new().filter_level(default_level).parse_env(LOG_ENV_VAR).init();
}

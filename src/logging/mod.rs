//! Logging setup.
//!
//! Everything in the crate logs through `tracing`. [`setup`] installs
//! the global subscriber: a compact stdout layer showing source file,
//! line and thread, filtered to this crate at the configured level.
//! `SIMRUN_LOG` replaces that filter with `EnvFilter` directives, e.g.
//! `SIMRUN_LOG=simrun::chunk=debug,simrun=info`.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::ConfigurationError;
use crate::errors::EngineError;

/// Environment variable overriding the log filter.
pub const LOG_ENV: &str = "SIMRUN_LOG";

fn setup_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Setup {
        what: "logging",
        message: err.to_string(),
    }
}

pub(crate) fn get_log_level(level: &str) -> Result<LevelFilter, ConfigurationError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        level => Err(ConfigurationError::InvalidSetting {
            key: "log_level",
            reason: format!("wrong log level: {level}"),
        }),
    }
}

fn log_layer() -> impl Layer<Registry> + Send + Sync {
    tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID and name an event was recorded on
        .with_thread_ids(true)
        .with_thread_names(true)
}

/// Install the global subscriber. Can only be called once per
/// process.
pub fn setup(log_level: &str) -> Result<(), EngineError> {
    let level = get_log_level(log_level)?;
    let res = match std::env::var(LOG_ENV) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives)
                .map_err(|err| setup_err(format!("bad {LOG_ENV} {directives:?}: {err}")))?;
            Registry::default()
                .with(log_layer().with_filter(filter))
                .try_init()
        }
        Err(_) => Registry::default()
            .with(log_layer().with_filter(Targets::new().with_target("simrun", level)))
            .try_init(),
    };
    res.map_err(setup_err)
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level("DEBUG").unwrap(), LevelFilter::DEBUG);
    assert_eq!(get_log_level("warn").unwrap(), LevelFilter::WARN);
    assert!(matches!(
        get_log_level("chatty"),
        Err(ConfigurationError::InvalidSetting { key: "log_level", .. })
    ));
}

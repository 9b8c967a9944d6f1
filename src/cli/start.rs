use crate::cli::{
    actions::Action,
    commands::{self, logging},
    dispatch,
    telemetry::{self, LogFormat, Settings},
};
use anyhow::Result;
use clap::ArgMatches;

/// Map verbosity count to tracing level
const fn get_verbosity_level(verbosity: u8) -> Option<tracing::Level> {
    match verbosity {
        0 => None,
        1 => Some(tracing::Level::WARN),
        2 => Some(tracing::Level::INFO),
        3 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

/// Parse arguments, initialize telemetry and return the action to run.
///
/// # Errors
///
/// Returns an error if telemetry initialization or action dispatch fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    telemetry::init(&telemetry_settings(&matches))?;

    dispatch::handler(&matches)
}

fn telemetry_settings(matches: &ArgMatches) -> Settings {
    let defaults = Settings::default();
    Settings {
        level: get_verbosity_level(
            matches
                .get_one::<u8>(logging::ARG_VERBOSITY)
                .copied()
                .unwrap_or(0),
        ),
        format: matches
            .get_one::<LogFormat>(logging::ARG_LOG_FORMAT)
            .copied()
            .unwrap_or(defaults.format),
        deployment: matches
            .get_one::<String>(logging::ARG_DEPLOYMENT)
            .cloned()
            .unwrap_or(defaults.deployment),
    }
}

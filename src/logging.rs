//! Tracing initialisation.
//!
//! Library code only emits `tracing` events; binaries call [`init`] once.
//! Events go to stderr, leaving stdout to reports.
//! `RUST_LOG` wins over the configured level so a single run can be made
//! more verbose without touching the config file.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;
use crate::error::{ImError, ImResult};

/// Install the global subscriber.
///
/// Fails if the filter directive is invalid or a subscriber is already set.
pub fn init(settings: &LoggingSettings) -> ImResult<()> {
    let filter = build_filter(settings)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if settings.json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.with_target(false).try_init()
    };
    result.map_err(|e| ImError::Configuration(format!("failed to initialise logging: {e}")))
}

fn build_filter(settings: &LoggingSettings) -> ImResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level).map_err(|e| {
            ImError::Configuration(format!("invalid log level '{}': {e}", settings.level))
        }),
    }
}

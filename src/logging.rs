//! Logging initialization.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. The configured level is the
/// default filter; a `RUST_LOG` environment variable wins over it.
///
/// The format match is exhaustive over [`LogFormat`]; unknown formats
/// were already rejected at config parse time.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let base = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Pretty => base.with(fmt::layer()).init(),
        LogFormat::Compact => base.with(fmt::layer().compact()).init(),
        LogFormat::Json => base.with(fmt::layer().json()).init(),
    }
}

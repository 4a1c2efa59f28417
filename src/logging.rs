//! Tracing subscriber setup

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogConfig, LogFormat};
use crate::error::{Error, Result};

/// Install the global subscriber.
///
/// Without an explicit `filter` directive, crate targets log at `level` and
/// everything else at `warn`.
pub fn init(config: &LogConfig) -> Result<()> {
    let level = LevelFilter::from_str(&config.level).map_err(|_| {
        Error::invalid_config("logging.init", format!("unknown log level '{}'", config.level))
    })?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false);
    let fmt_layer = match config.format {
        LogFormat::Compact => fmt_layer.compact().boxed(),
        LogFormat::Json => fmt_layer.json().flatten_event(true).boxed(),
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    let result = match &config.filter {
        Some(directives) => {
            let filter = EnvFilter::try_new(directives).map_err(|e| {
                Error::invalid_config("logging.init", format!("invalid log filter: {e}"))
            })?;
            registry.with(filter).try_init()
        }
        None => {
            let filter = filter::Targets::new()
                .with_default(LevelFilter::WARN)
                .with_targets(vec![("wameter", level), ("wameter_server", level)]);
            registry.with(filter).try_init()
        }
    };

    result.map_err(|e| Error::internal("logging.init", "subscriber already installed").with_source(e))
}

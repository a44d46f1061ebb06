//! Structured logging.
//!
//! The core only emits `tracing` events. Embedding simulators either
//! install their own subscriber or call [`init_logging`]. Log output always
//! goes to stderr because stdout carries reports written to destination `1`.

pub mod config;

pub use config::{LogConfig, LogFormat, ENV_LOG_FORMAT, ENV_LOG_LEVEL, ENV_LOG_TRIGGERS};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Target of the `[trigger] Now starting/stopping report` events.
pub const TRIGGER_TARGET: &str = "simtel::trigger";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer(config: &LogConfig) -> BoxedLayer {
    match (config.format, config.timestamps) {
        (LogFormat::Jsonl, _) => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed(),
        (LogFormat::Human, true) => fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .boxed(),
        (LogFormat::Human, false) => fmt::layer()
            .without_time()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .boxed(),
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, overrides the
/// configured filter.
///
/// Returns false if a global subscriber already exists.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));
    tracing_subscriber::registry()
        .with(output_layer(config))
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_existing_subscriber() {
        let config = LogConfig::default().with_timestamps(false);
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }
}

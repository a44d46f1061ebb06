//! Logging configuration resolved from the environment.
//!
//! - `SIMTEL_LOG`: level for the telemetry core (`trace` .. `off`)
//! - `SIMTEL_LOG_FORMAT`: `human` or `jsonl`
//! - `SIMTEL_LOG_TRIGGERS`: `0` silences trigger transition lines
//!
//! A full `RUST_LOG` directive, when set, replaces the generated filter.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::filter::LevelFilter;

pub const ENV_LOG_LEVEL: &str = "SIMTEL_LOG";
pub const ENV_LOG_FORMAT: &str = "SIMTEL_LOG_FORMAT";
pub const ENV_LOG_TRIGGERS: &str = "SIMTEL_LOG_TRIGGERS";

/// Output encoding of log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per line.
    Jsonl,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Human => "human",
            LogFormat::Jsonl => "jsonl",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "text" => Ok(LogFormat::Human),
            "jsonl" | "json" => Ok(LogFormat::Jsonl),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Where and how much the telemetry core logs.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Level for everything under `st_core`, `st_config` and `st_telemetry`.
    pub level: LevelFilter,
    /// Emit `[trigger] Now starting/stopping report ...` lines.
    pub trigger_events: bool,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Human,
            level: LevelFilter::WARN,
            trigger_events: true,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Defaults overridden by whichever `SIMTEL_LOG*` variables are set.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(level) = lookup(ENV_LOG_LEVEL).and_then(|v| v.trim().parse().ok()) {
            config.level = level;
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT).and_then(|v| v.parse().ok()) {
            config.format = format;
        }
        if let Some(flag) = lookup(ENV_LOG_TRIGGERS) {
            config.trigger_events = !matches!(flag.trim(), "0" | "false" | "off");
        }
        config
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn with_trigger_events(mut self, enabled: bool) -> Self {
        self.trigger_events = enabled;
        self
    }

    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    /// `EnvFilter` directive for this configuration.
    ///
    /// Trigger transitions are info events; they stay visible at the default
    /// warn level unless disabled.
    pub fn filter_directive(&self) -> String {
        let trigger = if self.trigger_events {
            self.level.max(LevelFilter::INFO)
        } else {
            LevelFilter::OFF
        };
        let level = self.level.to_string().to_ascii_lowercase();
        format!(
            "st_core={level},st_config={level},st_telemetry={level},{target}={trigger}",
            level = level,
            target = super::TRIGGER_TARGET,
            trigger = trigger.to_string().to_ascii_lowercase()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Jsonl);
        assert_eq!(" human ".parse::<LogFormat>().unwrap(), LogFormat::Human);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_environment_overrides_defaults() {
        let config = LogConfig::from_lookup(lookup(&[
            (ENV_LOG_LEVEL, "debug"),
            (ENV_LOG_FORMAT, "jsonl"),
            (ENV_LOG_TRIGGERS, "0"),
        ]));
        assert_eq!(config.level, LevelFilter::DEBUG);
        assert_eq!(config.format, LogFormat::Jsonl);
        assert!(!config.trigger_events);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = LogConfig::from_lookup(lookup(&[(ENV_LOG_LEVEL, "loud"), (ENV_LOG_FORMAT, "xml")]));
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn test_trigger_target_at_least_info() {
        let directive = LogConfig::default().filter_directive();
        assert!(directive.starts_with("st_core=warn,"));
        assert!(directive.ends_with("simtel::trigger=info"));

        let quiet = LogConfig::default().with_trigger_events(false).filter_directive();
        assert!(quiet.ends_with("simtel::trigger=off"));

        let verbose = LogConfig::default().with_level(LevelFilter::TRACE).filter_directive();
        assert!(verbose.ends_with("simtel::trigger=trace"));
    }
}

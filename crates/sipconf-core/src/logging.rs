//! Tracing subscriber for processes that run sipconf cores
//!
//! The engine only emits `tracing` events; installing a subscriber is left
//! to the embedding binary or test bed. `RUST_LOG` takes precedence over
//! the configured level and directives.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{self, TestWriter};
use tracing_subscriber::EnvFilter;

use crate::errors::{ConferenceError, Result};

/// Output encoding of log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default verbosity for every target
    pub level: Level,
    pub format: LogFormat,
    /// Per-target overrides such as `sipconf_core::event_package=trace`
    pub directives: Vec<String>,
    /// Write through the libtest capture so output shows only for failed tests
    pub capture_for_tests: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            directives: Vec::new(),
            capture_for_tests: false,
        }
    }
}

impl LoggingConfig {
    /// Settings used by test beds: debug output, captured per test
    pub fn for_tests() -> Self {
        Self {
            level: Level::DEBUG,
            capture_for_tests: true,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Same as [`Self::with_level`] for a level read from text
    pub fn with_level_name(self, name: &str) -> Result<Self> {
        Ok(self.with_level(parse_log_level(name)?))
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Filter expression built from the level and the directives
    pub fn filter_spec(&self) -> String {
        std::iter::once(self.level.to_string().to_lowercase())
            .chain(self.directives.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(self.filter_spec())
            .map_err(|e| ConferenceError::config(format!("invalid log filter '{}': {}", self.filter_spec(), e)))
    }
}

/// Install the global subscriber.
///
/// Only the first call installs anything; later calls (one per test, for
/// test beds) still validate the configuration and return `Ok`.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = config.filter()?;
    let writer = if config.capture_for_tests {
        BoxMakeWriter::new(TestWriter::new())
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = fmt::Subscriber::builder().with_env_filter(filter).with_writer(writer);
    let installed = match config.format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };
    if installed {
        tracing::debug!(filter = %config.filter_spec(), format = ?config.format, "subscriber installed");
    }
    Ok(())
}

/// Parse a level name (`trace` .. `error`, any case)
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| ConferenceError::config(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_filter_spec() {
        let config = LoggingConfig::default()
            .with_level_name("warn")
            .unwrap()
            .with_directive("sipconf_core::event_package=trace");
        assert_eq!(config.filter_spec(), "warn,sipconf_core::event_package=trace");
        assert!(!config.capture_for_tests);
        assert!(LoggingConfig::for_tests().capture_for_tests);
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let config = LoggingConfig::default().with_directive("sipconf_core=loudest");
        assert!(EnvFilter::try_new(config.filter_spec()).is_err());
    }

    #[test]
    fn test_setup_twice_is_ok() {
        assert!(setup_logging(LoggingConfig::for_tests()).is_ok());
        assert!(setup_logging(LoggingConfig::for_tests().with_format(LogFormat::Json)).is_ok());
    }
}

//! Structured logging setup.
//!
//! Every Tessera component emits `tracing` events: `info!` for provider and
//! session lifecycle, `debug!` for planning and per-node dispatch, `warn!` for
//! degraded capabilities such as an unusable native module. This module wires
//! those events to a `tracing-subscriber` registry.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{CoreError, Result};

/// Verbosity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-buffer detail.
    Trace,
    /// Planning and dispatch detail.
    Debug,
    /// Lifecycle events.
    Info,
    /// Degraded behavior.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    fn as_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Subscriber configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset.
    pub level: LogLevel,
    /// Include thread ids (useful with provider worker threads).
    pub with_thread_ids: bool,
    /// Include file and line.
    pub with_source_location: bool,
    /// Log span enter/close events.
    pub with_span_events: bool,
    /// Emit JSON lines instead of human-readable text.
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_thread_ids: false,
            with_source_location: false,
            with_span_events: false,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Toggle thread ids.
    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.with_thread_ids = enable;
        self
    }

    /// Toggle file/line output.
    pub fn with_source_location(mut self, enable: bool) -> Self {
        self.with_source_location = enable;
        self
    }

    /// Toggle span events.
    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.with_span_events = enable;
        self
    }

    /// Toggle JSON output.
    pub fn with_json_format(mut self, enable: bool) -> Self {
        self.json_format = enable;
        self
    }

    /// Verbose text output with thread ids and span events.
    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            with_thread_ids: true,
            with_source_location: true,
            with_span_events: true,
            json_format: false,
        }
    }

    /// Info-level JSON output for log aggregation.
    pub fn production() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: true,
            ..Self::default()
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_level().as_str()))
    }
}

/// Install the global subscriber.
///
/// Fails with [`CoreError::InvalidArgument`] if a global subscriber is
/// already installed.
///
/// ```no_run
/// use tessera_core::logging::{init_logging, LoggingConfig};
///
/// init_logging(&LoggingConfig::development())?;
/// # Ok::<(), tessera_core::CoreError>(())
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let installed = if config.json_format {
        let layer = fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_current_span(true)
            .with_thread_ids(config.with_thread_ids)
            .with_file(config.with_source_location)
            .with_line_number(config.with_source_location);
        tracing_subscriber::registry()
            .with(config.env_filter())
            .with(layer)
            .try_init()
    } else {
        let layer = fmt::layer()
            .with_span_events(span_events)
            .with_thread_ids(config.with_thread_ids)
            .with_file(config.with_source_location)
            .with_line_number(config.with_source_location);
        tracing_subscriber::registry()
            .with(config.env_filter())
            .with(layer)
            .try_init()
    };

    installed.map_err(|e| CoreError::invalid_argument(format!("logging already initialized: {e}")))
}

/// Install the subscriber for tests, ignoring an existing one.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("tessera=debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let dev = LoggingConfig::development();
        assert_eq!(dev.level, LogLevel::Debug);
        assert!(dev.with_span_events);
        assert!(!dev.json_format);

        let prod = LoggingConfig::production();
        assert_eq!(prod.level, LogLevel::Info);
        assert!(prod.json_format);
        assert!(!prod.with_thread_ids);
    }

    #[test]
    fn test_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Trace)
            .with_thread_ids(true)
            .with_json_format(true);
        assert_eq!(config.level, LogLevel::Trace);
        assert!(config.with_thread_ids);
        assert!(config.json_format);
    }

    #[test]
    fn test_config_from_json() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"level": "warn", "json_format": true}"#).unwrap();
        assert_eq!(config.level, LogLevel::Warn);
        assert!(config.json_format);
        assert!(!config.with_span_events);

        let unknown = serde_json::from_str::<LoggingConfig>(r#"{"colour": true}"#);
        assert!(unknown.is_err());
    }
}

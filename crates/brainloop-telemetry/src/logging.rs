//! Logging configuration and subscriber setup.

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use crate::error::{TelemetryError, TelemetryResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable format for interactive use.
    Pretty,
    /// Single-line, human-readable format.
    Compact,
    /// Newline-delimited JSON, for production log collection.
    Json,
}

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error. Used by the daemon binary, since stdout carries the
    /// JSON-RPC protocol stream.
    Stderr,
    /// A file at the given path, opened in append mode.
    File(PathBuf),
}

/// Builder for the worker's logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    level: String,
    format: LogFormat,
    target: LogTarget,
    directives: Vec<String>,
}

impl LogConfig {
    /// Start a config with the given base level (`"trace"`, `"debug"`,
    /// `"info"`, `"warn"`, `"error"`, or a full `EnvFilter` expression).
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::Compact,
            target: LogTarget::Stderr,
            directives: Vec::new(),
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the output target.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Add an extra `EnvFilter` directive, e.g. `"brainloop_commands=trace"`.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn build_filter(&self) -> TelemetryResult<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| TelemetryError::ConfigError(e.to_string()))?;
        for directive in &self.directives {
            let parsed = directive
                .parse()
                .map_err(|_| TelemetryError::ConfigError(format!("invalid directive: {directive}")))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install the global tracing subscriber described by `config`.
///
/// # Errors
///
/// Returns a [`TelemetryError`] if the filter is malformed, the target file
/// cannot be opened, or a global subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.build_filter()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match (&config.target, config.format) {
        (LogTarget::Stdout, LogFormat::Json) => builder.json().with_writer(std::io::stdout).try_init(),
        (LogTarget::Stdout, LogFormat::Pretty) => builder.pretty().with_writer(std::io::stdout).try_init(),
        (LogTarget::Stdout, LogFormat::Compact) => builder.compact().with_writer(std::io::stdout).try_init(),
        (LogTarget::Stderr, LogFormat::Json) => builder.json().with_writer(std::io::stderr).try_init(),
        (LogTarget::Stderr, LogFormat::Pretty) => builder.pretty().with_writer(std::io::stderr).try_init(),
        (LogTarget::Stderr, LogFormat::Compact) => builder.compact().with_writer(std::io::stderr).try_init(),
        (LogTarget::File(path), format) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            match format {
                LogFormat::Json => builder.json().with_writer(file).try_init(),
                LogFormat::Pretty => builder.pretty().with_writer(file).try_init(),
                LogFormat::Compact => builder.compact().with_writer(file).try_init(),
            }
        }
    };

    result.map_err(|e| TelemetryError::InitError(e.to_string()))
}

/// Install logging with sensible defaults for an interactive terminal
/// (`info` level, compact format, stderr).
///
/// # Errors
///
/// Returns a [`TelemetryError`] under the same conditions as
/// [`setup_logging`].
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_directives() {
        let config = LogConfig::new("info")
            .with_format(LogFormat::Json)
            .with_directive("brainloop_commands=trace")
            .with_directive("brainloop_executor=debug");
        assert_eq!(config.directives.len(), 2);
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn build_filter_rejects_malformed_directive() {
        let config = LogConfig::new("info").with_directive("not a directive!!");
        assert!(config.build_filter().is_err());
    }
}

//! Logging setup for binaries and tests embedding the agent
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application, which can use [`setup_logging`].
//!
//! Transaction events carry the handle as a field (`id = i3`, `o7`), so a
//! single transaction can be followed with a filter such as
//! `RUST_LOG=siptx_transaction_core=trace`.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Baseline level for every target
    pub level: Level,
    /// Extra `EnvFilter` directives, e.g. `siptx_sip_resolver=debug`
    pub directives: Vec<String>,
    /// One JSON object per line instead of the human readable format
    pub json: bool,
    /// Source file and line of each event
    pub file_info: bool,
    /// Span enter/exit events
    pub log_spans: bool,
    /// Reported once when the subscriber is installed
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            directives: Vec::new(),
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "siptx".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Add a filter directive such as `siptx_transaction_core=trace`
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());
        for directive in &self.directives {
            let parsed = directive
                .parse()
                .map_err(|e| Error::Config(format!("log directive {}: {}", directive, e)))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install a global subscriber. Fails if one is already installed.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = config.filter()?;
    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let mut builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events);
    if config.file_info {
        builder = builder.with_file(true).with_line_number(true);
    }

    let installed = if config.json {
        builder.with_writer(std::io::stdout).json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Config(format!("logging: {}", e)))?;

    tracing::debug!(app = %config.app_name, "logging initialised");
    Ok(())
}

/// Level from a name like `debug` or `WARN`
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::Config(format!("Invalid log level: {}", level)))
}

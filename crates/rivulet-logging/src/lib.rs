//! Structured logging setup for Rivulet
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines for log aggregation (default)
//! - **Pretty Console**: Human-readable output for development
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//! - **Per-target levels**: Turn up one crate without drowning in the rest
//!
//! # Quick Start
//!
//! ```ignore
//! use rivulet_logging::{LogConfig, RivuletSubscriberBuilder};
//!
//! // Development mode with pretty human-readable output
//! let _guard = RivuletSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//! ```

pub mod config;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors from subscriber setup
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Log file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Global subscriber already set: {0}")]
    AlreadySet(#[from] TryInitError),
}

/// Builder for configuring and initializing the Rivulet logging subscriber
///
/// By default, console output uses JSONL format. Use
/// `LogConfig::development()` for human-readable output.
#[derive(Debug, Default)]
pub struct RivuletSubscriberBuilder {
    config: LogConfig,
}

impl RivuletSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Send console output to stderr, leaving stdout to the program
    pub fn with_stderr(mut self) -> Self {
        self.config.console.stderr = true;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Install the subscriber globally.
    ///
    /// The returned guard flushes the file writer when dropped; keep it
    /// alive for the life of the program when file output is on.
    pub fn init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.directives())
                .map_err(|e| LoggingError::Filter(e.to_string()))?,
        };

        let jsonl = &self.config.jsonl;
        let console = &self.config.console;

        let (file_layer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = create_file_writer(file_config)?;
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(jsonl.include_spans)
                    .flatten_event(jsonl.flatten_events)
                    .with_file(jsonl.include_location)
                    .with_line_number(jsonl.include_location)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        // Pretty and JSONL console layers have different types; at most one
        // of them is `Some`
        let pretty_console = (console.enabled && console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
                .with_writer(console_writer(console.stderr))
        });
        let jsonl_console = (console.enabled && !console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
                .with_writer(console_writer(console.stderr))
        });

        Registry::default()
            .with(env_filter)
            .with(pretty_console)
            .with(jsonl_console)
            .with(file_layer)
            .try_init()?;

        Ok(guard)
    }
}

fn console_writer(stderr: bool) -> BoxMakeWriter {
    if stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    }
}

/// Open the writer for file output.
///
/// `Never` truncates a single `<prefix>.log`; the rotating strategies
/// append to dated files.
fn create_file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)?;
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            let path = config.directory.join(format!("{}.log", config.prefix));
            return Ok(tracing_appender::non_blocking(File::create(path)?));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };
    let appender = RollingFileAppender::new(rotation, &config.directory, &config.prefix);
    Ok(tracing_appender::non_blocking(appender))
}

/// Development logging (verbose, pretty console output)
pub fn init_development() -> Result<Option<WorkerGuard>, LoggingError> {
    RivuletSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Testing logging (warnings only); a no-op if a subscriber is already set
pub fn init_testing() {
    let _ = RivuletSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}

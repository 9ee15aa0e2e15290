//! Logging setup for meshwright scenario runs
//!
//! Every binary in the workspace (the scenario runner and the reference peer)
//! and the integration tests initialise `tracing` through this crate so that
//! output looks the same everywhere.
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines for machine-readable run logs (default)
//! - **Pretty Output**: Human-readable console output for interactive runs
//! - **Run Logs**: Optional file copy of every run via tracing-appender
//! - **RUST_LOG**: Environment filter overrides the configured default level
//!
//! # Quick Start
//!
//! ```ignore
//! use meshwright_logging::{MeshSubscriberBuilder, LogConfig};
//!
//! // JSONL to console
//! MeshSubscriberBuilder::new().init();
//!
//! // Pretty output while debugging a scenario
//! MeshSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init();
//! ```

pub mod config;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, fmt::writer::BoxMakeWriter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Errors raised while installing the global subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log file: {0}")]
    LogFile(#[from] std::io::Error),

    #[error("Global subscriber already set: {0}")]
    AlreadySet(#[from] tracing_subscriber::util::TryInitError),
}

/// Builder for configuring and initializing the meshwright logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output.
pub struct MeshSubscriberBuilder {
    config: LogConfig,
}

impl MeshSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
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

    /// Send console output to stderr instead of stdout
    pub fn with_stderr(mut self, stderr: bool) -> Self {
        self.config.console.stderr = stderr;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Install the subscriber globally
    ///
    /// The returned guard flushes the file writer on drop and must be kept
    /// alive for the whole run when file output is enabled.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.default_level));

        let (file_writer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = create_file_writer(file_config)?;
                (Some(writer), Some(guard))
            }
            None => (None, None),
        };

        let console = &self.config.console;
        let jsonl = &self.config.jsonl;

        let pretty_layer = (console.enabled && console.pretty).then(|| {
            fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
                .with_writer(console_writer(console.stderr))
        });

        let json_layer = (console.enabled && !console.pretty).then(|| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
                .with_writer(console_writer(console.stderr))
        });

        let file_layer = file_writer.map(|writer| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
                .with_writer(writer)
        });

        Registry::default()
            .with(env_filter)
            .with(pretty_layer)
            .with(json_layer)
            .with(file_layer)
            .try_init()?;

        Ok(guard)
    }

    /// Install the subscriber globally, reporting failures on stderr
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: logging not initialized: {}", e);
                None
            }
        }
    }
}

impl Default for MeshSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn console_writer(stderr: bool) -> BoxMakeWriter {
    if stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    }
}

fn create_file_writer(file_config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&file_config.directory)?;
    let pair = match file_config.rotation {
        RotationStrategy::Never => {
            let path = file_config
                .directory
                .join(format!("{}.log", file_config.prefix));
            tracing_appender::non_blocking(File::create(path)?)
        }
        RotationStrategy::Daily => tracing_appender::non_blocking(RollingFileAppender::new(
            Rotation::DAILY,
            &file_config.directory,
            &file_config.prefix,
        )),
        RotationStrategy::Hourly => tracing_appender::non_blocking(RollingFileAppender::new(
            Rotation::HOURLY,
            &file_config.directory,
            &file_config.prefix,
        )),
    };
    Ok(pair)
}

/// Initialize logging for testing (minimal output)
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_testing() {
    let _ = MeshSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}

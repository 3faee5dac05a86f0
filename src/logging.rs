//! Log plumbing for tool output and process diagnostics.
//!
//! Two separate channels exist:
//! - [`LogSink`] carries the wrapped tool's own output for one run. The server
//!   streams it back to the client, direct mode prints it.
//! - `tracing` carries the exec server's diagnostics. Client and direct modes
//!   log to stderr; the detached server logs to a file next to its shadow cache.

use std::io::Write;
use std::path::Path;

use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the tracing filter directive.
pub const LOG_FILTER_ENV: &str = "EXEC_SERVER_LOG";

/// File name of the server log under `<targetDir>/.shadow/logs/`.
pub const SERVER_LOG_FILE: &str = "exec-server.log";

/// Severity of a tool log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map the integer level used by the C log hook.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            i32::MIN..=0 => LogLevel::Info,
            1 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// One line of tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub text: String,
}

impl LogLine {
    pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// Destination for the output of a single run.
///
/// Implementations must tolerate being called after the consumer went away;
/// delivery is best-effort.
pub trait LogSink: Send + Sync {
    fn log(&self, line: LogLine);

    fn info(&self, text: &str) {
        self.log(LogLine::new(LogLevel::Info, text));
    }

    fn error(&self, text: &str) {
        self.log(LogLine::new(LogLevel::Error, text));
    }
}

/// Prints tool output on the local console. Errors go to stderr in red.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn log(&self, line: LogLine) {
        match line.level {
            LogLevel::Info => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", line.text);
            }
            LogLevel::Warn => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{}", line.text.yellow());
            }
            LogLevel::Error => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{}", line.text.red());
            }
        }
    }
}

/// Forwards tool output into `tracing`. Used where no console is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, line: LogLine) {
        match line.level {
            LogLevel::Info => tracing::info!(target: "tool", "{}", line.text),
            LogLevel::Warn => tracing::warn!(target: "tool", "{}", line.text),
            LogLevel::Error => tracing::error!(target: "tool", "{}", line.text),
        }
    }
}

fn filter_or(default: &str) -> EnvFilter {
    match dotenvy::var(LOG_FILTER_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(default)),
        Err(_) => EnvFilter::new(default),
    }
}

/// Install the stderr subscriber used by client and direct modes.
pub fn init_console() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("warn"))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Install the file subscriber used by the detached server.
///
/// The returned guard flushes the background writer on drop and must be kept
/// alive for the lifetime of the server.
pub fn init_server(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(SERVER_LOG_FILE)
        .build(log_dir)
        .map_err(std::io::Error::other)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("info"))
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(guard)
}

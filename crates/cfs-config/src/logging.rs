//! Structured logging utilities for CFS components.
//!
//! Every macro attaches a `component` field so one log file can be split per
//! subsystem.
//!
//! # Usage
//!
//! ```ignore
//! use cfs_config::logging::*;
//!
//! log_recorder_warn!("Collector unreachable", dropped = 12);
//! log_collector_info!("Connection accepted", pid = 1234);
//! ```

use std::io;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const INTERPOSER: &'static str = "INTERPOSER";
    pub const CLASSIFIER: &'static str = "CLASSIFIER";
    pub const RECORDER: &'static str = "RECORDER";
    pub const COLLECTOR: &'static str = "COLLECTOR";
    pub const REGRESS: &'static str = "REGRESS";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map a `CFS_DEBUG` value onto a level: 0 warn, 1 debug, 2+ trace.
    pub fn from_debug_level(level: u8) -> Self {
        match level {
            0 => LogLevel::Warn,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === INTERPOSER logging macros ===

#[macro_export]
macro_rules! log_interposer_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = $crate::logging::Component::INTERPOSER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_interposer_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = $crate::logging::Component::INTERPOSER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_interposer_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::INTERPOSER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_interposer_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::INTERPOSER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_interposer_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = $crate::logging::Component::INTERPOSER, $($key = $value,)* $msg)
    };
}

// === CLASSIFIER logging macros ===

#[macro_export]
macro_rules! log_classifier_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::CLASSIFIER, $($key = $value,)* $msg)
    };
}

// === RECORDER logging macros ===

#[macro_export]
macro_rules! log_recorder_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = $crate::logging::Component::RECORDER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_recorder_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::RECORDER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_recorder_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::RECORDER, $($key = $value,)* $msg)
    };
}

// === COLLECTOR logging macros ===

#[macro_export]
macro_rules! log_collector_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = $crate::logging::Component::COLLECTOR, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_collector_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::COLLECTOR, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_collector_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::COLLECTOR, $($key = $value,)* $msg)
    };
}

// === REGRESS logging macros ===

#[macro_export]
macro_rules! log_regress_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::REGRESS, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_regress_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::REGRESS, $($key = $value,)* $msg)
    };
}

/// Initialize stderr logging with the given level filter.
/// `RUST_LOG` wins when set. Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Initialize logging into `log_file` for code running inside a traced process.
///
/// Stays off stderr so the traced program's own output is untouched, and
/// ignores `RUST_LOG`, which belongs to the host. An already installed
/// subscriber is left in place.
pub fn init_file_logging(level: LogLevel, log_file: &Path) -> io::Result<()> {
    let dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = log_file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log file has no name"))?;

    let appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.as_filter()))
        .with_writer(appender)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::INTERPOSER, "INTERPOSER");
        assert_eq!(Component::RECORDER, "RECORDER");
        assert_eq!(Component::REGRESS, "REGRESS");
    }

    #[test]
    fn test_debug_level_mapping() {
        assert_eq!(LogLevel::from_debug_level(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_debug_level(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_debug_level(2), LogLevel::Trace);
        assert_eq!(LogLevel::from_debug_level(9).as_filter(), "trace");
    }

    #[test]
    fn test_file_logging_rejects_nameless_path() {
        let err = init_file_logging(LogLevel::Debug, Path::new("/")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}

//! Log and Fatal Sinks
//!
//! The runtime never writes diagnostics straight to the process.  Every
//! message goes through a [`LogSink`] chosen when the runtime is created.
//! The default [`TracingSink`] forwards to `tracing` and exits the process
//! on fatal errors.

use std::fmt;
use tracing::{debug, error, info, warn};

/// Severity of a runtime diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

/// Destination for runtime diagnostics and unrecoverable failures.
pub trait LogSink {
    /// Record a diagnostic.
    fn log(&self, level: LogLevel, message: &str);

    /// Report an unrecoverable failure and leave the process.
    fn fatal(&self, code: i32, message: &str) -> !;
}

/// Sink that forwards to `tracing` and exits on fatal errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => error!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Debug => debug!("{message}"),
        }
    }

    fn fatal(&self, code: i32, message: &str) -> ! {
        error!(code, "{message}");
        eprintln!("fatal: {message}");
        std::process::exit(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recording(RefCell<Vec<(LogLevel, String)>>);

    impl LogSink for Recording {
        fn log(&self, level: LogLevel, message: &str) {
            self.0.borrow_mut().push((level, message.to_string()));
        }

        fn fatal(&self, code: i32, message: &str) -> ! {
            panic!("fatal {code}: {message}")
        }
    }

    #[test]
    fn test_custom_sink_records() {
        let sink = Recording(RefCell::new(Vec::new()));
        sink.log(LogLevel::Warn, "careful");
        assert_eq!(sink.0.borrow()[0], (LogLevel::Warn, "careful".to_string()));
    }

    #[test]
    #[should_panic(expected = "fatal 69")]
    fn test_custom_fatal_diverges() {
        let sink = Recording(RefCell::new(Vec::new()));
        sink.fatal(69, "no engine");
    }

    #[test]
    fn test_tracing_sink_log_does_not_panic() {
        TracingSink.log(LogLevel::Debug, "quiet");
    }

    #[test]
    fn test_level_display() {
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }
}

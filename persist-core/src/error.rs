//! Error and Result Types
//!
//! Two tiers of failure exist.  Script-level outcomes (a raised error, a
//! trapped termination) are reported through [`RunResult`], which is what
//! compile, run and module loading hand back.  Misuse of the host API
//! (stale handles, callback-less I/O handles, OS failures) surfaces as
//! [`RuntimeError`].  The only unrecoverable condition, engine boot
//! failure, goes through [`LogSink::fatal`](crate::log::LogSink::fatal).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the host-facing API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The handle was freed, or it was created by another runtime.
    #[error("{kind} handle is stale or belongs to another runtime")]
    StaleHandle { kind: &'static str },

    /// An I/O override was requested with neither a read nor a write callback.
    #[error("I/O handle '{0}' needs a read or a write callback")]
    NoCallbacks(String),

    /// The named I/O handle is not open.
    #[error("I/O handle '{0}' is not open")]
    NotOpen(String),

    /// The configuration could not be parsed or holds invalid bits.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Os(#[from] nix::errno::Errno),
}

impl RuntimeError {
    /// errno-like code for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::StaleHandle { .. } | Self::NoCallbacks(_) | Self::Config(_) => libc::EINVAL,
            Self::NotOpen(_) => libc::EBADF,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Os(errno) => *errno as i32,
        }
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Outcome of a compile, run or module load.
///
/// Always starts zeroed: `status == 0`, `errno == 0`, no message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Termination code passed to `terminate`, or 0.
    pub status: i32,
    /// errno-like code, set when the failure came from the OS or from input validation.
    pub errno: i32,
    /// Error message raised by the script or the runtime.
    pub message: Option<String>,
    /// Display form of the unit's final value, absent for `()`.
    pub value: Option<String>,
}

impl RunResult {
    /// A result carrying an error message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// A result for script-triggered termination.
    pub fn terminated(status: i32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = errno;
        self
    }

    /// Reset every field to zero.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// `true` when nothing was raised and no termination code was set.
    pub fn is_success(&self) -> bool {
        self.status == 0 && self.message.is_none()
    }
}

impl From<&RuntimeError> for RunResult {
    fn from(err: &RuntimeError) -> Self {
        RunResult::failed(err.to_string()).with_errno(err.errno())
    }
}

impl From<RuntimeError> for RunResult {
    fn from(err: RuntimeError) -> Self {
        RunResult::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_default_is_zeroed() {
        let result = RunResult::default();
        assert_eq!(result.status, 0);
        assert_eq!(result.errno, 0);
        assert!(result.message.is_none());
        assert!(result.is_success());
    }

    #[test]
    fn test_result_clear() {
        let mut result = RunResult::failed("boom").with_errno(libc::ENOENT);
        assert!(!result.is_success());
        result.clear();
        assert_eq!(result, RunResult::default());
    }

    #[test]
    fn test_terminated_is_not_success() {
        let result = RunResult::terminated(42);
        assert_eq!(result.status, 42);
        assert!(!result.is_success());
    }

    #[test]
    fn test_errno_mapping() {
        let stale = RuntimeError::StaleHandle { kind: "code unit" };
        assert_eq!(stale.errno(), libc::EINVAL);

        let io = RuntimeError::Io(std::io::Error::from_raw_os_error(libc::ENOENT));
        let result = RunResult::from(io);
        assert_eq!(result.errno, libc::ENOENT);
        assert!(result.message.is_some());
    }

    #[test]
    fn test_result_serializes() {
        let json = serde_json::to_string(&RunResult::terminated(3)).unwrap();
        assert!(json.contains("\"status\":3"));
    }
}

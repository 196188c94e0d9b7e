//! Error taxonomy for the telemetry engine.
//!
//! Monitoring failures never escape as panics. Per-item failures are logged and
//! skipped by the caller; everything that reaches this type is either a startup
//! problem (privileges, configuration) or a tick-level failure that the caller
//! logs before skipping the tick.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// The process is not elevated and the operation needs administrator rights.
    #[error("administrator rights required for {operation}")]
    PrivilegeRequired { operation: &'static str },

    /// A native call returned a failure status.
    #[error("{call} failed with status 0x{code:08X}")]
    Syscall { call: &'static str, code: u32 },

    /// The size-then-fill protocol kept racing with table growth.
    #[error("{call} buffer size changed on every attempt ({attempts} attempts)")]
    BufferRace { call: &'static str, attempts: u32 },

    /// Trace session setup or teardown failed.
    #[error("trace session error: {message} (status 0x{code:08X})")]
    Session { message: String, code: u32 },

    /// The operation has no implementation on this platform.
    #[error("{operation} is only available on Windows")]
    Unsupported { operation: &'static str },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MonitorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Privilege failures are reported once at startup and never retried per tick.
    pub fn is_privilege(&self) -> bool {
        matches!(self, Self::PrivilegeRequired { .. })
            || matches!(self, Self::Syscall { code: 5, .. })
            || matches!(self, Self::Session { code: 5, .. })
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_counts_as_privilege_error() {
        let err = MonitorError::Syscall {
            call: "GetExtendedTcpTable",
            code: 5,
        };
        assert!(err.is_privilege());
        assert!(!MonitorError::config("bad").is_privilege());
    }

    #[test]
    fn syscall_error_formats_status_in_hex() {
        let err = MonitorError::Syscall {
            call: "StartTraceW",
            code: 0xB7,
        };
        assert_eq!(err.to_string(), "StartTraceW failed with status 0x000000B7");
    }
}

//! Shared error type for the orchestration runtime.
//!
//! Every public, fallible entry point returns `Result<T, RuntimeError>`.
//! Internal helpers are free to propagate `anyhow::Result` and convert at
//! the boundary, the way `ccswarm::utils::error::ResultExt` does.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced at the boundary of the runtime, per spec §7.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("task queue full for priority band {band}")]
    QueueFull { band: u8 },

    #[error("no registered agent has capability '{capability}'")]
    NoAgent { capability: String },

    #[error("router exhausted all candidate backends for capability '{capability}'")]
    NoBackendAvailable { capability: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("circuit open for dependency '{dependency}'")]
    CircuitOpen { dependency: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("forbidden")]
    Forbidden,

    #[error("duplicate id '{id}'")]
    Duplicate { id: String },

    #[error("unknown frame type '{frame_type}'")]
    UnknownFrame { frame_type: String },

    #[error("unsupported protocol version {version}")]
    UnsupportedProtocol { version: u32 },

    #[error("request timed out")]
    RequestTimeout,

    #[error("capability '{capability}' is not supported by any backend")]
    CapabilityUnsupported { capability: String },

    #[error("internal error (trace {trace_id}): {message}")]
    Internal { trace_id: String, message: String },
}

impl RuntimeError {
    /// Build an `Internal` error with a fresh trace id, as the design notes
    /// require: "an `INTERNAL` error always includes a stable trace id".
    pub fn internal(message: impl Into<String>) -> Self {
        RuntimeError::Internal {
            trace_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
        }
    }

    /// Whether a caller can reasonably retry this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RuntimeError::QueueFull { .. }
                | RuntimeError::NoBackendAvailable { .. }
                | RuntimeError::CircuitOpen { .. }
                | RuntimeError::RateLimited { .. }
        )
    }
}

/// Extension trait mirroring the teacher's `ResultExt`, adapted to the
/// runtime's error type for call sites that want a one-line conversion
/// from an arbitrary error into `RuntimeError::Internal`.
pub trait ResultExt<T> {
    fn or_internal(self, context: &str) -> Result<T, RuntimeError>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn or_internal(self, context: &str) -> Result<T, RuntimeError> {
        self.map_err(|e| RuntimeError::internal(format!("{context}: {e}")))
    }
}

//! Error types for isolate-host.
//!
//! [`RuntimeError`] covers every recoverable failure in the lifecycle of an
//! isolate and its main instance. Contract violations (use of the instance
//! outside its valid states, out-of-range index lookups) are not represented
//! here: they panic.

use thiserror::Error;

/// Top-level runtime errors.
///
/// Failures surfaced while creating an isolate, loading its startup state,
/// or preparing the event loop. Script-level outcomes are reported as exit
/// codes instead (see [`crate::ExitCode`]).
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The engine context could not be created.
    ///
    /// The process cannot proceed without an isolate, so callers treat this
    /// as fatal rather than retrying.
    #[error("Isolate creation failed: {reason}")]
    IsolateCreation {
        /// Description of the engine failure.
        reason: String,
    },

    /// Compiling the bootstrap module failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The engine refused to deserialize the startup snapshot.
    ///
    /// Usually the snapshot was produced by an isolate with an incompatible
    /// configuration or a different engine version.
    #[error("Snapshot rejected by engine: {reason}")]
    SnapshotRejected {
        /// Description of the deserialization failure.
        reason: String,
    },

    /// A snapshot container could not be decoded, or does not belong to the
    /// configured bootstrap.
    #[error("Invalid snapshot: {reason}")]
    InvalidSnapshot {
        /// Description of the format violation.
        reason: String,
    },

    /// The I/O event loop could not be started.
    #[error("Event loop error: {reason}")]
    EventLoop {
        /// Description of the failure.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `IsolateCreation` error.
    pub fn isolate_creation(reason: impl Into<String>) -> Self {
        Self::IsolateCreation {
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `SnapshotRejected` error.
    pub fn snapshot_rejected(reason: impl Into<String>) -> Self {
        Self::SnapshotRejected {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidSnapshot` error.
    pub fn invalid_snapshot(reason: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            reason: reason.into(),
        }
    }

    /// Create a new `EventLoop` error.
    pub fn event_loop(reason: impl Into<String>) -> Self {
        Self::EventLoop {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error means the process cannot continue.
    ///
    /// Isolate creation and event loop startup have no fallback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IsolateCreation { .. } | Self::EventLoop { .. })
    }

    /// Returns `true` if this error came from the startup snapshot.
    pub fn is_snapshot_error(&self) -> bool {
        matches!(
            self,
            Self::SnapshotRejected { .. } | Self::InvalidSnapshot { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::isolate_creation("out of memory");
        assert_eq!(err.to_string(), "Isolate creation failed: out of memory");

        let err = RuntimeError::invalid_snapshot("bad magic");
        assert_eq!(err.to_string(), "Invalid snapshot: bad magic");
    }

    #[test]
    fn test_is_fatal() {
        assert!(RuntimeError::isolate_creation("x").is_fatal());
        assert!(RuntimeError::event_loop("x").is_fatal());
        assert!(!RuntimeError::compilation_failed("x").is_fatal());
        assert!(!RuntimeError::invalid_config("x").is_fatal());
    }

    #[test]
    fn test_is_snapshot_error() {
        assert!(RuntimeError::snapshot_rejected("x").is_snapshot_error());
        assert!(RuntimeError::invalid_snapshot("x").is_snapshot_error());
        assert!(!RuntimeError::isolate_creation("x").is_snapshot_error());
    }
}

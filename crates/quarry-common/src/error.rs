//! Error types for Quarry
//!
//! This module defines the common error types used throughout the system.

use std::fmt;
use thiserror::Error;

/// Common result type for Quarry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a directory lock could not be obtained
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockFailure {
    /// The lock is held by another process or handle; retrying will not help
    HeldElsewhere,
    /// Shared filesystem: the lock was retried until the fixed timeout expired
    RetriesExhausted { attempts: u32, waited_ms: u64 },
}

impl fmt::Display for LockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeldElsewhere => write!(f, "already held elsewhere"),
            Self::RetriesExhausted {
                attempts,
                waited_ms,
            } => write!(
                f,
                "shared filesystem, gave up after {attempts} attempts over {waited_ms} ms"
            ),
        }
    }
}

/// Common error type for Quarry
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Persisted state errors
    #[error("format error: {0}")]
    Format(String),

    #[error("stale cluster state: current version {current}, proposed {proposed}")]
    StaleClusterState { current: u64, proposed: u64 },

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("lock {name} unavailable: {reason}")]
    LockUnavailable { name: String, reason: LockFailure },

    // Cluster errors
    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    // Pipeline errors
    #[error("indexing of {entity_type} failed in {stage}: {message}")]
    PipelineWorker {
        entity_type: String,
        stage: String,
        message: String,
    },

    #[error("indexing of {0} aborted")]
    PipelineAborted(String),

    // Internal errors
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a format error
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a pipeline worker error
    pub fn pipeline_worker(
        entity_type: impl Into<String>,
        stage: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        Self::PipelineWorker {
            entity_type: entity_type.into(),
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StaleClusterState { .. }
                | Self::LockUnavailable {
                    reason: LockFailure::RetriesExhausted { .. },
                    ..
                }
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound(_)
                | Self::IndexNotFound(_)
                | Self::NodeNotFound(_)
                | Self::ShardNotFound(_)
        )
    }

    /// Classification shown to administrative callers
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Format(_) | Self::Serialization(_) => "FormatError",
            Self::StaleClusterState { .. } => "StaleClusterState",
            Self::LockUnavailable { .. } => "LockUnavailable",
            Self::PipelineWorker { .. } | Self::PipelineAborted(_) => "PipelineWorkerError",
            Self::InvariantViolation(_) => "InvariantViolation",
            Self::Io(_) | Self::Storage(_) | Self::FileNotFound(_) => "StorageError",
            Self::IndexNotFound(_)
            | Self::IndexAlreadyExists(_)
            | Self::NodeNotFound(_)
            | Self::ShardNotFound(_) => "ClusterError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Process exit code used by the CLI
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::Format(_) | Self::Serialization(_) => 3,
            Self::LockUnavailable { .. } => 4,
            Self::PipelineWorker { .. } | Self::PipelineAborted(_) => 5,
            Self::InvariantViolation(_) | Self::Internal(_) => 70,
            _ => 1,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let retried = Error::LockUnavailable {
            name: "write.lock".into(),
            reason: LockFailure::RetriesExhausted {
                attempts: 3,
                waited_ms: 30,
            },
        };
        let held = Error::LockUnavailable {
            name: "write.lock".into(),
            reason: LockFailure::HeldElsewhere,
        };
        assert!(retried.is_retryable());
        assert!(!held.is_retryable());
        assert!(!Error::format("bad").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::IndexNotFound("idx".into()).is_not_found());
        assert!(Error::FileNotFound("_0.nrm".into()).is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::configuration("x").category(), "ConfigurationError");
        assert_eq!(Error::format("x").category(), "FormatError");
        assert_eq!(
            Error::pipeline_worker("Book", "loader", "boom").category(),
            "PipelineWorkerError"
        );
        assert_eq!(Error::invariant("x").exit_code(), 70);
    }

    #[test]
    fn test_lock_failure_message() {
        let err = Error::LockUnavailable {
            name: "write.lock".into(),
            reason: LockFailure::RetriesExhausted {
                attempts: 5,
                waited_ms: 500,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("shared filesystem"));
        assert!(msg.contains("5 attempts"));
    }
}

//! Error types for RtTune
//!
//! This module defines all error types used throughout the application.
//! Discovery and parsing failures abort the whole run; per-entity bind
//! failures are isolated by the callers and surfaced in the run summary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for RtTune operations
#[derive(Error, Debug)]
pub enum RtTuneError {
    /// Privileged operation attempted without root
    #[error("Permission denied: '{operation}' requires an elevated context")]
    PermissionDenied {
        /// Operation that was refused
        operation: String,
    },

    /// Kernel-exposed text did not match the expected shape
    #[error("Malformed kernel data from {what}: {reason}")]
    MalformedInput {
        /// Source of the text (a file path or a tool name)
        what: String,
        /// What did not match
        reason: String,
    },

    /// I/O error with path context
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// Path being read or written
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A bind operation violated a hard precondition
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A named CPU set referenced by policy does not exist
    #[error("Unknown CPU set '{0}' referenced by layout")]
    UnknownCpuSet(String),

    /// An external collaborator tool failed
    #[error("'{tool}' failed: {message}")]
    Tool {
        /// Tool binary name
        tool: String,
        /// Captured failure detail
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RtTuneError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a malformed-input error for a file or tool output
    pub fn malformed(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Create an external-tool failure
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if this error is a permission issue
    pub fn is_permission_error(&self) -> bool {
        match self {
            Self::PermissionDenied { .. } => true,
            Self::Io { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

/// Result type alias for RtTune operations
pub type Result<T> = std::result::Result<T, RtTuneError>;

impl From<io::Error> for RtTuneError {
    fn from(err: io::Error) -> Self {
        RtTuneError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for RtTuneError {
    fn from(err: serde_json::Error) -> Self {
        RtTuneError::Config(err.to_string())
    }
}

/// A kernel object vanished between discovery and a write to it.
///
/// Affinity writes hitting this race are logged and swallowed at the write
/// site; everything else propagates.
pub fn is_transient_write_race(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::NotFound)
        || err.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32)
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| RtTuneError::io(path, e))
    }
}

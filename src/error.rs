/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Hierarchical error types with context and recovery strategies.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Error raised by a single transfer attempt or by a task as a whole
#[derive(Debug, Error)]
pub enum TransferError {
    /// Could not connect, or the connection broke mid-stream
    #[error("connection to {uri} failed: {message}")]
    Connection { uri: String, message: String },

    /// Connect, request or read stalled past the configured limit
    #[error("{uri} timed out")]
    Timeout { uri: String },

    /// Server answered with a non-success status
    #[error("{uri} returned HTTP {status}")]
    HttpStatus { uri: String, status: u16 },

    /// Body length differs from the expected size
    #[error("file has unexpected size: {file} (expected {expected}, received {received})")]
    SizeMismatch {
        file: String,
        expected: u64,
        received: u64,
    },

    /// Digest of the body differs from the expected hash sum
    #[error("hash sum does not match: {file} (expected {algorithm}: {expected}, received {algorithm}: {received})")]
    HashMismatch {
        file: String,
        algorithm: String,
        expected: String,
        received: String,
    },

    /// Server did not advertise a Content-Length
    #[error("no content length in response from {uri}")]
    NoContentLength { uri: String },

    /// Every candidate URI of the task has been tried
    #[error("no more mirrors available for {file} after {attempts} attempt(s)")]
    NoMirrorsRemaining { file: String, attempts: usize },

    /// The batch was cancelled while this task was pending or in flight
    #[error("download cancelled")]
    Cancelled,

    /// Artifact carries no hash and the policy forbids unauthenticated files
    #[error("{file} cannot be authenticated")]
    Unauthenticated { file: String },

    /// Hash type is not one of the supported algorithms
    #[error("unsupported hash type '{name}'")]
    UnsupportedHash { name: String },

    /// Expected digest is empty or not hex of the algorithm's length
    #[error("invalid {algorithm} digest '{digest}'")]
    InvalidDigest { algorithm: String, digest: String },

    /// Local file system failure (temp file, rename, cleanup)
    #[error("file system error for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Flat classification of [`TransferError`] used in reports and observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionError,
    Timeout,
    HttpStatusError,
    SizeMismatch,
    HashMismatch,
    NoContentLength,
    NoMirrorsRemaining,
    Cancelled,
    Unauthenticated,
    UnsupportedHash,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConnectionError => "connection error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HttpStatusError => "http status error",
            ErrorKind::SizeMismatch => "size mismatch",
            ErrorKind::HashMismatch => "hash mismatch",
            ErrorKind::NoContentLength => "no content length",
            ErrorKind::NoMirrorsRemaining => "no mirrors remaining",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::UnsupportedHash => "unsupported hash",
            ErrorKind::Io => "i/o error",
        };
        f.write_str(name)
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Connection { .. } => ErrorKind::ConnectionError,
            TransferError::Timeout { .. } => ErrorKind::Timeout,
            TransferError::HttpStatus { .. } => ErrorKind::HttpStatusError,
            TransferError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            TransferError::HashMismatch { .. } => ErrorKind::HashMismatch,
            TransferError::NoContentLength { .. } => ErrorKind::NoContentLength,
            TransferError::NoMirrorsRemaining { .. } => ErrorKind::NoMirrorsRemaining,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::Unauthenticated { .. } => ErrorKind::Unauthenticated,
            TransferError::UnsupportedHash { .. } | TransferError::InvalidDigest { .. } => {
                ErrorKind::UnsupportedHash
            }
            TransferError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Whether the scheduler should move on to the task's next candidate
    pub fn falls_back(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionError
                | ErrorKind::Timeout
                | ErrorKind::HttpStatusError
                | ErrorKind::SizeMismatch
                | ErrorKind::HashMismatch
                | ErrorKind::NoContentLength
        )
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Main error type for debboost operations outside a single transfer
#[derive(Debug, Error)]
pub enum DebboostError {
    /// Network errors while fetching mirror lists or probing
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// A download batch did not complete
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Candidate URI or inline hash specification is malformed
    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// Mirror selection expression could not be parsed
    #[error("Parser: {reason}")]
    SelectionParse { reason: String },

    /// Mirror selection named an index outside the displayed list
    #[error("Index {index} doesn't exist (valid range 1..{max})")]
    IndexOutOfRange { index: usize, max: usize },

    /// No reachable mirror survived probing
    #[error("Unable to find any mirrors")]
    NoMirrorsFound,

    /// Distro or release could not be determined
    #[error("There was an issue detecting release: {reason}")]
    ReleaseDetection { reason: String },

    /// Permission denied
    #[error("Permission denied: {operation}")]
    PermissionDenied { operation: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// File system errors
    #[error("File system error for '{path}': {message}")]
    FileSystem {
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// User declined a confirmation prompt
    #[error("Abort.")]
    Aborted,
}

/// Recovery strategy for errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry the operation after a delay
    Retry { max_attempts: u32, initial_delay_ms: u64 },
    /// Ask the user again
    Reprompt,
    /// Abort and cleanup
    Abort,
    /// No recovery possible
    Fatal,
}

impl DebboostError {
    /// Get the recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            DebboostError::Network { .. } => RecoveryStrategy::Retry {
                max_attempts: 3,
                initial_delay_ms: 1000,
            },
            DebboostError::SelectionParse { .. } | DebboostError::IndexOutOfRange { .. } => {
                RecoveryStrategy::Reprompt
            }
            DebboostError::PermissionDenied { .. } | DebboostError::ConfigError { .. } => {
                RecoveryStrategy::Fatal
            }
            _ => RecoveryStrategy::Abort,
        }
    }

    /// Create a network error
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        DebboostError::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a filesystem error
    pub fn filesystem(path: impl Into<String>, message: impl Into<String>, source: std::io::Error) -> Self {
        DebboostError::FileSystem {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Result type alias for debboost operations
pub type DebboostResult<T> = std::result::Result<T, DebboostError>;

//! Error types for scan operations.
//!
//! `TransportError` is what a collaborator reports for a single round trip,
//! classified by kind so the engine can decide between resume, retry, skip
//! and failure. `ScanError` is what callers of a scan observe.

use crate::types::PartitionId;
use thiserror::Error;

/// Result type for scan operations.
pub type ScanResult<T> = Result<T, ScanError>;

/// Classification of a failed round trip to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The node no longer owns the partition.
    NotMyVbucket,
    /// The connection carrying the session closed mid-stream.
    EndOfStream,
    /// No document exists for the request on this partition.
    DocumentNotFound,
    /// The node is busy and wants fewer concurrent scans.
    Busy,
    /// A transient failure; the request may succeed later.
    TemporaryFailure,
    /// The credentials were rejected.
    AuthenticationFailure,
    /// The collection id is unknown to the node.
    CollectionNotFound,
    /// The server cancelled the scan session.
    ScanCancelled,
    /// Any other failure.
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportErrorKind::NotMyVbucket => "not my vbucket",
            TransportErrorKind::EndOfStream => "end of stream",
            TransportErrorKind::DocumentNotFound => "document not found",
            TransportErrorKind::Busy => "busy",
            TransportErrorKind::TemporaryFailure => "temporary failure",
            TransportErrorKind::AuthenticationFailure => "authentication failure",
            TransportErrorKind::CollectionNotFound => "collection not found",
            TransportErrorKind::ScanCancelled => "scan cancelled",
            TransportErrorKind::Other => "error",
        };
        f.write_str(name)
    }
}

/// A failed round trip reported by a `ScanTransport`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// How the failure is classified.
    pub kind: TransportErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl TransportError {
    /// Create a new transport error.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an error with no extra detail.
    pub fn of(kind: TransportErrorKind) -> Self {
        Self::new(kind, kind.to_string())
    }

    /// Whether the session can be re-created from the last key seen.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::NotMyVbucket | TransportErrorKind::EndOfStream
        )
    }

    /// Whether the partition should be re-queued and tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Busy | TransportErrorKind::TemporaryFailure
        )
    }
}

/// Errors observed by callers of a scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Scan timed out")]
    Timeout,

    #[error("Request canceled")]
    RequestCanceled,

    #[error("Document not found in partition {partition}")]
    DocumentNotFound { partition: PartitionId },

    #[error("Authentication failure")]
    AuthenticationFailure,

    #[error("Collection {scope}.{collection} not found")]
    CollectionNotFound { scope: String, collection: String },

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Scan of partition {partition} failed: {source}")]
    Transport {
        partition: PartitionId,
        #[source]
        source: TransportError,
    },
}

impl ScanError {
    /// Map a fatal transport failure on a partition to a caller-facing error.
    pub fn from_transport(
        partition: PartitionId,
        scope: &str,
        collection: &str,
        err: TransportError,
    ) -> Self {
        match err.kind {
            TransportErrorKind::DocumentNotFound => ScanError::DocumentNotFound { partition },
            TransportErrorKind::AuthenticationFailure => ScanError::AuthenticationFailure,
            TransportErrorKind::CollectionNotFound => ScanError::CollectionNotFound {
                scope: scope.to_string(),
                collection: collection.to_string(),
            },
            TransportErrorKind::ScanCancelled => ScanError::RequestCanceled,
            _ => ScanError::Transport {
                partition,
                source: err,
            },
        }
    }

    /// Whether this error was caused by the scan deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScanError::Timeout)
    }
}

impl From<toml::de::Error> for ScanError {
    fn from(e: toml::de::Error) -> Self {
        ScanError::InvalidArgument(format!("invalid scan options: {}", e))
    }
}

//! Error types for the shard consumer

use crate::client::StreamClientError;
use crate::record::SequenceNumber;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for poller and coordinator operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Throttling, timeouts and connection problems. Retried with backoff.
    #[error("Transient stream error: {0}")]
    Transient(String),

    #[error("Call to the stream service timed out after {0:?}")]
    Timeout(Duration),

    #[error("Shard {0} is closed")]
    ShardClosed(String),

    #[error("Iterator expired for shard {0}")]
    IteratorExpired(String),

    #[error("Shard {shard_id} hit {count} consecutive undecodable records")]
    CorruptRecords { shard_id: String, count: u32 },

    #[error("Checkpoint error: {0}")]
    CheckpointFailed(#[from] CheckpointError),

    #[error("Sink rejected batch: {0}")]
    SinkFailed(String),

    /// Unknown stream or shard, access denied, invalid arguments. Never retried.
    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Maximum retry attempts reached after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConsumerError {
    /// Errors that feed the `Backoff` transition
    pub fn is_transient(&self) -> bool {
        matches!(self, ConsumerError::Transient(_) | ConsumerError::Timeout(_))
    }

    /// Errors that must not lead to a poller restart
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsumerError::FatalConfig(_) | ConsumerError::Config(_))
    }

    /// Convert a stream service error raised while reading `shard_id`
    pub fn for_shard(err: StreamClientError, shard_id: &str) -> Self {
        match err {
            StreamClientError::ExpiredIterator => ConsumerError::IteratorExpired(shard_id.to_string()),
            other => other.into(),
        }
    }
}

impl From<StreamClientError> for ConsumerError {
    fn from(err: StreamClientError) -> Self {
        match err {
            // no shard context here, see `ConsumerError::for_shard`
            StreamClientError::ExpiredIterator => ConsumerError::IteratorExpired("unknown".into()),
            StreamClientError::ThroughputExceeded(msg) => {
                ConsumerError::Transient(format!("Throughput exceeded: {}", msg))
            }
            StreamClientError::Timeout(msg) => {
                ConsumerError::Transient(format!("Timeout: {}", msg))
            }
            StreamClientError::ConnectionError(msg) => {
                ConsumerError::Transient(format!("Connection error: {}", msg))
            }
            StreamClientError::AccessDenied(msg) => {
                ConsumerError::FatalConfig(format!("Access denied: {}", msg))
            }
            StreamClientError::InvalidArgument(msg) => {
                ConsumerError::FatalConfig(format!("Invalid argument: {}", msg))
            }
            StreamClientError::ResourceNotFound(msg) => {
                ConsumerError::FatalConfig(format!("Resource not found: {}", msg))
            }
            StreamClientError::KmsError(msg) => {
                ConsumerError::FatalConfig(format!("KMS error: {}", msg))
            }
            StreamClientError::Other(msg) => ConsumerError::Transient(msg),
        }
    }
}

impl From<JoinError> for ConsumerError {
    fn from(err: JoinError) -> Self {
        ConsumerError::Other(err.into())
    }
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Error type for checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(
        "Refusing to move checkpoint for shard {shard_id} backwards from {current} to {attempted}"
    )]
    Stale {
        shard_id: String,
        current: SequenceNumber,
        attempted: SequenceNumber,
    },

    #[error("Invalid checkpoint data: {0}")]
    InvalidData(String),
}

impl CheckpointError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckpointError::StoreUnavailable(_))
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::InvalidData(err.to_string())
    }
}

/// Failure to turn a raw payload into a typed record
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Empty payload")]
    Empty,

    #[error("Malformed record: {0}")]
    Malformed(String),
}

/// Outcome reported by a [`RecordSink`](crate::sink::RecordSink) that could
/// not take a batch
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Soft failure (retriable): {0}")]
    SoftFailure(#[source] anyhow::Error),

    #[error("Hard failure (non-retriable): {0}")]
    HardFailure(#[source] anyhow::Error),
}

impl SinkError {
    pub fn soft(err: impl Into<anyhow::Error>) -> Self {
        SinkError::SoftFailure(err.into())
    }

    pub fn hard(err: impl Into<anyhow::Error>) -> Self {
        SinkError::HardFailure(err.into())
    }
}

/// Error type for the publisher
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Partition key must not be empty")]
    EmptyPartitionKey,

    #[error(transparent)]
    Stream(#[from] StreamClientError),

    #[error("Publish failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: StreamClientError,
    },

    #[error("Service returned {actual} results for {expected} entries")]
    InvalidResponse { expected: usize, actual: usize },
}

//! Error types for Rivulet

use thiserror::Error;

use crate::id::StreamId;

/// Errors raised by the durable storage underneath the engine
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corrupt journal record: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Corrupt error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Convert from postcard Error to StorageError
impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Deserialization(err.to_string())
    }
}

/// Errors returned by stream, group and ledger operations
///
/// Zero-length results (nothing idle to claim, acknowledging an id that is
/// not pending) are not errors and never show up here.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Invalid stream id: {0}")]
    InvalidId(String),

    #[error("Id {id} is equal or smaller than the stream's last id {last}")]
    IdTooSmall { id: StreamId, last: StreamId },

    #[error("Stream id space exhausted after {0}")]
    IdSpaceExhausted(StreamId),

    #[error("Consumer group already exists: {0}")]
    GroupExists(String),

    #[error("Consumer group {group} not found on stream {stream}")]
    GroupNotFound { stream: String, group: String },

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Consumer {consumer} not found in group {group}")]
    ConsumerNotFound { group: String, consumer: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StreamError {
    /// Errors a caller should treat as an informational no-op.
    ///
    /// Concurrent startups race to create the same group, so `GroupExists`
    /// only means someone else got there first.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::GroupExists(_))
    }

    pub fn group_not_found(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self::GroupNotFound {
            stream: stream.into(),
            group: group.into(),
        }
    }
}

/// Result type alias for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

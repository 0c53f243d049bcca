//! Error types for qualifier-store

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No session with this id exists in the store
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// A session with this id was already created
    #[error("session already exists: {session_id}")]
    SessionExists { session_id: String },

    /// The session no longer accepts checkpoints
    #[error("session {session_id} is {status} and does not accept checkpoints")]
    SessionClosed { session_id: String, status: String },

    /// A persisted record could not be decoded
    #[error("corrupt record in session {session_id} at line {line}: {reason}")]
    CorruptRecord {
        session_id: String,
        line: usize,
        reason: String,
    },

    /// Invalid content digest format
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Backend-specific failure (e.g. injected by a fake)
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

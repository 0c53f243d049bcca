//! Domain-level error taxonomy for Qualifier.

use qualifier_store::StorageError;

use super::result::EntityResult;

/// Errors produced while loading or validating a criterion set.
///
/// Any of these is fatal for a batch: no entity is scheduled.
#[derive(Debug, thiserror::Error)]
pub enum CriteriaError {
    #[error("duplicate criterion id: {id}")]
    DuplicateId { id: String },

    #[error("criterion {id} has empty text")]
    EmptyText { id: String },

    #[error("general criterion {id} must not name an audience")]
    UnexpectedAudience { id: String },

    #[error("criterion {id} requires an audience")]
    MissingAudience { id: String },

    #[error("criterion {id} targets audience {audience} which has no qualification question")]
    UnknownAudience { id: String, audience: String },

    #[error("audience {audience} has more than one qualification question")]
    DuplicateQualification { audience: String },

    #[error("failed to read criteria file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse criteria: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for criterion-set operations.
pub type CriteriaResult<T> = std::result::Result<T, CriteriaError>;

/// Why a session cannot be resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotResumableReason {
    /// No session record exists.
    Missing,
    /// The session record or checkpoint log failed to decode or validate.
    Corrupted(String),
    /// The session was created against a different criterion set.
    CriteriaChanged { expected: String, actual: String },
    /// Every entity already reached a terminal stage.
    AlreadyCompleted,
}

impl std::fmt::Display for NotResumableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotResumableReason::Missing => write!(f, "session checkpoint log is missing"),
            NotResumableReason::Corrupted(detail) => write!(f, "checkpoint log is corrupted: {detail}"),
            NotResumableReason::CriteriaChanged { expected, actual } => write!(
                f,
                "criterion set changed (session expects {expected}, current is {actual})"
            ),
            NotResumableReason::AlreadyCompleted => write!(f, "session already completed"),
        }
    }
}

/// Errors produced by the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("session {session_id} is not resumable: {reason}")]
    NotResumable {
        session_id: String,
        reason: NotResumableReason,
    },

    #[error("session {session_id} is already running in this process")]
    AlreadyRunning { session_id: String },

    #[error("checkpoint log of session {session_id} is unreadable: {detail}")]
    CorruptLog { session_id: String, detail: String },

    #[error("entity {entity_id} is not part of session {session_id}")]
    UnknownEntity {
        session_id: String,
        entity_id: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Entity-level unrecoverable errors. They abort only the entity concerned.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("checkpoint write failed for entity {entity_id}: {source}")]
    Checkpoint {
        entity_id: String,
        /// Result as it stood when the write failed
        partial: Box<EntityResult>,
        #[source]
        source: SessionError,
    },
}

impl EvaluationError {
    /// The partial result held by the evaluator when it aborted.
    pub fn into_partial(self) -> EntityResult {
        match self {
            EvaluationError::Checkpoint { partial, .. } => *partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_resumable_reason_is_specific() {
        let err = SessionError::NotResumable {
            session_id: "s-1".into(),
            reason: NotResumableReason::CriteriaChanged {
                expected: "abc".into(),
                actual: "def".into(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("not resumable"));
        assert!(msg.contains("abc"));
        assert!(msg.contains("def"));
    }

    #[test]
    fn storage_errors_convert() {
        let err: SessionError = StorageError::Backend("disk full".into()).into();
        assert!(err.to_string().contains("disk full"));
    }
}

//! Storage trait definitions for Qualifier
//!
//! `CheckpointStore` is flat durable storage keyed by
//! `(session_id, entity_id)`:
//! - session metadata (entity list, criterion-set identity, status)
//! - an append-only checkpoint log per session
//!
//! All methods are async and backend-agnostic. An in-memory fake is
//! provided for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest: criterion-set identity
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Unique identifier for a batch session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random SessionId
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    /// Whether the session reached an end state (it may still be resumable
    /// when cancelled or failed).
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One entity covered by a session, with its opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEntry {
    pub entity_id: String,
    pub payload: serde_json::Value,
}

/// Session metadata written once at creation and updated on status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    /// Identity of the criterion set the session was created against
    pub criteria_digest: ContentDigest,
    /// Human-readable version label of the criterion set
    pub criteria_version: String,
    /// Entities in submission order
    pub entities: Vec<EntityEntry>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create a new record in `Created` status.
    pub fn new(
        criteria_digest: ContentDigest,
        criteria_version: impl Into<String>,
        entities: Vec<EntityEntry>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            criteria_digest,
            criteria_version: criteria_version.into(),
            entities,
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `entity_id` belongs to this session.
    pub fn contains_entity(&self, entity_id: &str) -> bool {
        self.entities.iter().any(|e| e.entity_id == entity_id)
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// A checkpoint to append; the store assigns `seq` and `recorded_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCheckpoint {
    pub entity_id: String,
    /// Stage label, e.g. `"mandatory:Gaming"`
    pub stage: String,
    /// Whether the entity reached a terminal stage with this checkpoint
    pub terminal: bool,
    /// Serialized partial result
    pub payload: serde_json::Value,
}

/// A persisted checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub session_id: SessionId,
    pub entity_id: String,
    /// Monotonic sequence number within the session
    pub seq: u64,
    pub stage: String,
    pub terminal: bool,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Durable session store.
///
/// Guarantees:
/// - Checkpoints are append-only and ordered by `seq` within a session.
/// - A single append is atomic: it is either fully visible or absent.
/// - Completed sessions reject further checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new session. Fails if the id already exists.
    async fn create_session(&self, record: SessionRecord) -> StorageResult<()>;

    /// Load session metadata. Returns `StorageError::SessionNotFound` if absent.
    async fn get_session(&self, session_id: &SessionId) -> StorageResult<SessionRecord>;

    /// Update the lifecycle status of a session.
    async fn set_status(&self, session_id: &SessionId, status: SessionStatus)
        -> StorageResult<()>;

    /// Append a checkpoint to the session log.
    async fn append_checkpoint(
        &self,
        session_id: &SessionId,
        checkpoint: NewCheckpoint,
    ) -> StorageResult<CheckpointRecord>;

    /// Load the full checkpoint log of a session, ordered by `seq`.
    async fn load_checkpoints(&self, session_id: &SessionId) -> StorageResult<Vec<CheckpointRecord>>;

    /// List the ids of all sessions in the store.
    async fn list_session_ids(&self) -> StorageResult<Vec<SessionId>>;

    /// Remove a session and its checkpoints. No-op if absent.
    async fn delete_session(&self, session_id: &SessionId) -> StorageResult<()>;
}

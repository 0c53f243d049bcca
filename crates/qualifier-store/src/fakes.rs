//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryCheckpointStore`, which satisfies the `CheckpointStore`
//! contract without touching the filesystem and can inject write failures
//! for chosen entities.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug)]
struct SessionState {
    record: SessionRecord,
    checkpoints: Vec<CheckpointRecord>,
}

/// In-memory session store backed by a `BTreeMap<SessionId, SessionState>`.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    sessions: Mutex<BTreeMap<String, SessionState>>,
    failing_entities: Mutex<HashSet<String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent checkpoint append for `entity_id` fail.
    pub fn fail_writes_for(&self, entity_id: &str) {
        self.failing_entities
            .lock()
            .unwrap()
            .insert(entity_id.to_string());
    }

    /// Overwrite the payload of a stored checkpoint (simulates on-disk damage).
    pub fn corrupt_checkpoint(&self, session_id: &SessionId, seq: u64, payload: serde_json::Value) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(state) = sessions.get_mut(&session_id.0) {
            if let Some(cp) = state.checkpoints.iter_mut().find(|c| c.seq == seq) {
                cp.payload = payload;
            }
        }
    }

    /// Drop every checkpoint with `seq >= from_seq` (simulates a crash
    /// that happened before those writes).
    pub fn truncate_checkpoints(&self, session_id: &SessionId, from_seq: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(state) = sessions.get_mut(&session_id.0) {
            state.checkpoints.retain(|c| c.seq < from_seq);
        }
    }

    /// Number of checkpoints recorded for a session.
    pub fn checkpoint_count(&self, session_id: &SessionId) -> usize {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&session_id.0)
            .map(|s| s.checkpoints.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn create_session(&self, record: SessionRecord) -> StorageResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&record.session_id.0) {
            return Err(StorageError::SessionExists {
                session_id: record.session_id.0.clone(),
            });
        }
        sessions.insert(
            record.session_id.0.clone(),
            SessionState {
                record,
                checkpoints: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_session(&self, session_id: &SessionId) -> StorageResult<SessionRecord> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&session_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: session_id.0.clone(),
            })
    }

    async fn set_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> StorageResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions
            .get_mut(&session_id.0)
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: session_id.0.clone(),
            })?;
        state.record.status = status;
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn append_checkpoint(
        &self,
        session_id: &SessionId,
        checkpoint: NewCheckpoint,
    ) -> StorageResult<CheckpointRecord> {
        if self
            .failing_entities
            .lock()
            .unwrap()
            .contains(&checkpoint.entity_id)
        {
            return Err(StorageError::Backend(format!(
                "injected write failure for {}",
                checkpoint.entity_id
            )));
        }

        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions
            .get_mut(&session_id.0)
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: session_id.0.clone(),
            })?;
        if state.record.status == SessionStatus::Completed {
            return Err(StorageError::SessionClosed {
                session_id: session_id.0.clone(),
                status: state.record.status.to_string(),
            });
        }

        let seq = state.checkpoints.last().map(|c| c.seq + 1).unwrap_or(0);
        let record = CheckpointRecord {
            session_id: session_id.clone(),
            entity_id: checkpoint.entity_id,
            seq,
            stage: checkpoint.stage,
            terminal: checkpoint.terminal,
            payload: checkpoint.payload,
            recorded_at: Utc::now(),
        };
        state.checkpoints.push(record.clone());
        state.record.updated_at = record.recorded_at;
        Ok(record)
    }

    async fn load_checkpoints(&self, session_id: &SessionId) -> StorageResult<Vec<CheckpointRecord>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&session_id.0)
            .map(|s| s.checkpoints.clone())
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: session_id.0.clone(),
            })
    }

    async fn list_session_ids(&self) -> StorageResult<Vec<SessionId>> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions.keys().map(|k| SessionId(k.clone())).collect())
    }

    async fn delete_session(&self, session_id: &SessionId) -> StorageResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&session_id.0);
        Ok(())
    }
}

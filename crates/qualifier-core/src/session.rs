//! Resumable batch sessions on top of a [`CheckpointStore`].
//!
//! A session records the submitted entities and the identity of the
//! criterion set. Each entity's evaluator appends a self-describing
//! checkpoint (stage plus full partial result) at every stage boundary.
//! Resuming replays the log and keeps only the latest checkpoint per
//! entity, partitioning entities into complete, in-progress and
//! not-started.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use qualifier_store::{
    CheckpointRecord, CheckpointStore, EntityEntry, NewCheckpoint, SessionId, SessionRecord,
    SessionStatus, StorageError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{
    CriteriaSet, Entity, EntityResult, EvaluationStage, FinalStatus, NotResumableReason,
    SessionError, SessionResult, VerdictCounts,
};
use crate::evaluator::CheckpointSink;
use crate::metrics::METRICS;
use crate::obs;
use crate::scheduler::EntityJob;

/// Checkpoint payload as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointPayload {
    stage: EvaluationStage,
    result: EntityResult,
}

/// Latest decoded checkpoint of one entity.
#[derive(Debug, Clone)]
struct Latest {
    stage: EvaluationStage,
    result: EntityResult,
}

/// Entity counts by evaluation progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub not_started: usize,
    pub in_progress: usize,
    pub complete: usize,
}

/// One row of a session listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub criteria_version: String,
    pub criteria_digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub progress: Progress,
    pub resumable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_resumable_reason: Option<String>,
}

/// Per-entity progress inside a status report.
#[derive(Debug, Clone, Serialize)]
pub struct EntityProgress {
    pub entity_id: String,
    /// Label of the last checkpointed stage, if any.
    pub stage: Option<String>,
    pub final_status: Option<FinalStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusReport {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub criteria_version: String,
    pub progress: Progress,
    /// Entities in submission order.
    pub entities: Vec<EntityProgress>,
    /// Verdicts across every checkpointed result.
    pub verdicts: VerdictCounts,
}

/// What is left to do for a resumed session.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub record: SessionRecord,
    /// In-progress entities (with their partial result) then not-started
    /// ones, each in submission order.
    pub pending: Vec<EntityJob>,
    /// Results of entities that already reached a terminal status.
    pub completed: Vec<EntityResult>,
}

/// Session lifecycle, checkpointing and recovery.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn CheckpointStore>,
    entity_locks: Arc<EntityLockTable>,
}

/// (session id, entity id)
type EntityKey = (String, String);

type EntityLockTable = Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>;

/// A handle on one entity's write lock. The table entry goes away with the
/// last lease.
struct EntityLease {
    table: Arc<EntityLockTable>,
    key: EntityKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for EntityLease {
    fn drop(&mut self) {
        let mut locks = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // Handles are only cloned under the table lock: the table's and ours.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

impl SessionManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            entity_locks: Arc::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Persist a new session for `entities` evaluated against `criteria`.
    pub async fn create_session(
        &self,
        entities: &[Entity],
        criteria: &CriteriaSet,
    ) -> SessionResult<SessionRecord> {
        let entries = entities
            .iter()
            .map(|e| {
                Ok(EntityEntry {
                    entity_id: e.id.clone(),
                    payload: serde_json::to_value(e)?,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let record = SessionRecord::new(criteria.digest().clone(), criteria.version(), entries);
        self.store.create_session(record.clone()).await?;
        info!(
            session_id = %record.session_id,
            entities = entities.len(),
            criteria = %criteria.digest().short(),
            "session created"
        );
        Ok(record)
    }

    pub async fn load_session(&self, session_id: &SessionId) -> SessionResult<SessionRecord> {
        self.store
            .get_session(session_id)
            .await
            .map_err(|e| not_found_or(e, session_id))
    }

    /// Append a checkpoint for one entity.
    ///
    /// Writes for the same entity are serialized; different entities never
    /// wait on each other.
    pub async fn checkpoint(
        &self,
        session_id: &SessionId,
        stage: &EvaluationStage,
        result: &EntityResult,
    ) -> SessionResult<u64> {
        let lease = self.entity_lock((session_id.0.clone(), result.entity_id.clone()));
        let written = {
            let _guard = lease.lock.lock().await;
            self.append(session_id, stage, result).await
        };
        drop(lease);
        let written = written?;

        METRICS.inc_checkpoints_written();
        obs::emit_checkpoint_written(&session_id.0, &result.entity_id, &written.stage, written.seq);
        Ok(written.seq)
    }

    /// A sink writing checkpoints for the entities of `record`.
    pub fn writer(&self, record: &SessionRecord) -> SessionWriter {
        SessionWriter {
            sessions: self.clone(),
            session_id: record.session_id.clone(),
            entity_ids: Arc::new(record.entities.iter().map(|e| e.entity_id.clone()).collect()),
        }
    }

    pub async fn mark(&self, session_id: &SessionId, status: SessionStatus) -> SessionResult<()> {
        self.store
            .set_status(session_id, status)
            .await
            .map_err(|e| not_found_or(e, session_id))?;
        debug!(session_id = %session_id, status = %status, "session status updated");
        Ok(())
    }

    /// Build the plan for continuing `session_id` against `criteria`.
    ///
    /// Fails with `SessionError::NotResumable` when the session is missing,
    /// its log cannot be decoded, it was created against a different
    /// criterion set, or nothing is left to do.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        criteria: &CriteriaSet,
    ) -> SessionResult<ResumePlan> {
        let not_resumable = |reason| SessionError::NotResumable {
            session_id: session_id.0.clone(),
            reason,
        };

        let record = match self.store.get_session(session_id).await {
            Ok(record) => record,
            Err(StorageError::SessionNotFound { .. }) => {
                return Err(not_resumable(NotResumableReason::Missing))
            }
            Err(StorageError::CorruptRecord { reason, .. }) => {
                return Err(not_resumable(NotResumableReason::Corrupted(reason)))
            }
            Err(e) => return Err(e.into()),
        };

        if &record.criteria_digest != criteria.digest() {
            return Err(not_resumable(NotResumableReason::CriteriaChanged {
                expected: format!("{}@{}", record.criteria_version, record.criteria_digest.short()),
                actual: format!("{}@{}", criteria.version(), criteria.digest().short()),
            }));
        }
        if record.status == SessionStatus::Completed {
            return Err(not_resumable(NotResumableReason::AlreadyCompleted));
        }

        let checkpoints = match self.store.load_checkpoints(session_id).await {
            Ok(checkpoints) => checkpoints,
            Err(StorageError::SessionNotFound { .. }) => {
                return Err(not_resumable(NotResumableReason::Missing))
            }
            Err(StorageError::CorruptRecord { line, reason, .. }) => {
                return Err(not_resumable(NotResumableReason::Corrupted(format!(
                    "line {line}: {reason}"
                ))))
            }
            Err(e) => return Err(e.into()),
        };
        let mut latest = fold_checkpoints(&record, checkpoints)
            .map_err(|detail| not_resumable(NotResumableReason::Corrupted(detail)))?;

        let mut in_progress = Vec::new();
        let mut not_started = Vec::new();
        let mut completed = Vec::new();
        for entry in &record.entities {
            let entity: Entity = serde_json::from_value(entry.payload.clone()).map_err(|e| {
                not_resumable(NotResumableReason::Corrupted(format!(
                    "entity {}: {e}",
                    entry.entity_id
                )))
            })?;
            if entity.id != entry.entity_id {
                return Err(not_resumable(NotResumableReason::Corrupted(format!(
                    "entity entry {} holds entity {}",
                    entry.entity_id, entity.id
                ))));
            }
            match latest.remove(&entry.entity_id) {
                Some(Latest { result, .. }) if result.is_terminal() => completed.push(result),
                Some(Latest { result, .. }) => in_progress.push(EntityJob::resumed(entity, result)),
                None => not_started.push(EntityJob::fresh(entity)),
            }
        }

        if in_progress.is_empty() && not_started.is_empty() {
            // Every entity finished but the status update was lost.
            self.mark(session_id, SessionStatus::Completed).await?;
            return Err(not_resumable(NotResumableReason::AlreadyCompleted));
        }

        obs::emit_session_resumed(
            &session_id.0,
            in_progress.len() + not_started.len(),
            completed.len(),
        );
        let mut pending = in_progress;
        pending.extend(not_started);
        Ok(ResumePlan {
            record,
            pending,
            completed,
        })
    }

    /// Summaries of every stored session, oldest first.
    pub async fn list_sessions(&self) -> SessionResult<Vec<SessionSummary>> {
        let ids = self.store.list_session_ids().await?;
        let loaded = join_all(ids.iter().map(|id| self.summarize(id))).await;

        let mut summaries = Vec::with_capacity(ids.len());
        for (session_id, summary) in ids.iter().zip(loaded) {
            match summary {
                Ok(summary) => summaries.push(summary),
                Err(err) => warn!(session_id = %session_id, error = %err, "skipping unreadable session"),
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }

    /// Sessions that `resume` would accept (for an unchanged criterion set).
    pub async fn list_resumable(&self) -> SessionResult<Vec<SessionSummary>> {
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| s.resumable)
            .collect())
    }

    pub async fn status(&self, session_id: &SessionId) -> SessionResult<SessionStatusReport> {
        let record = self.load_session(session_id).await?;
        let latest = self.latest(&record).await?;

        let mut verdicts = VerdictCounts::default();
        let entities = record
            .entities
            .iter()
            .map(|entry| {
                let latest = latest.get(&entry.entity_id);
                if let Some(l) = latest {
                    let totals = l.result.verdict_totals();
                    verdicts.passed += totals.passed;
                    verdicts.not_passed += totals.not_passed;
                    verdicts.indeterminate += totals.indeterminate;
                    verdicts.errors += totals.errors;
                    verdicts.total += totals.total;
                }
                EntityProgress {
                    entity_id: entry.entity_id.clone(),
                    stage: latest.map(|l| l.stage.to_string()),
                    final_status: latest.and_then(|l| l.result.final_status.clone()),
                }
            })
            .collect();

        Ok(SessionStatusReport {
            session_id: record.session_id.clone(),
            status: record.status,
            criteria_version: record.criteria_version.clone(),
            progress: progress(&record, &latest),
            entities,
            verdicts,
        })
    }

    /// Latest result of every entity with at least one checkpoint, sorted
    /// by entity id. In-progress entities carry `final_status = None`.
    pub async fn results(&self, session_id: &SessionId) -> SessionResult<Vec<EntityResult>> {
        let record = self.load_session(session_id).await?;
        let latest = self.latest(&record).await?;
        Ok(latest.into_values().map(|l| l.result).collect())
    }

    /// Delete finished sessions not updated within `older_than`.
    ///
    /// A cutoff before the earliest representable time prunes nothing.
    pub async fn prune(&self, older_than: chrono::Duration) -> SessionResult<Vec<SessionId>> {
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            debug!(older_than = %older_than, "prune cutoff out of range; nothing to prune");
            return Ok(Vec::new());
        };
        let mut removed = Vec::new();
        for session_id in self.store.list_session_ids().await? {
            let record = match self.store.get_session(&session_id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "skipping unreadable session");
                    continue;
                }
            };
            if record.status.is_finished() && record.updated_at <= cutoff {
                self.store.delete_session(&session_id).await?;
                info!(session_id = %session_id, status = %record.status, "session pruned");
                removed.push(session_id);
            }
        }
        Ok(removed)
    }

    async fn summarize(&self, session_id: &SessionId) -> SessionResult<SessionSummary> {
        let record = self.load_session(session_id).await?;
        let (progress, reason) = match self.latest(&record).await {
            Ok(latest) => {
                let progress = progress(&record, &latest);
                let reason = if record.status == SessionStatus::Completed
                    || progress.complete == progress.total
                {
                    Some(NotResumableReason::AlreadyCompleted)
                } else {
                    None
                };
                (progress, reason)
            }
            Err(SessionError::CorruptLog { detail, .. }) => (
                Progress {
                    total: record.entities.len(),
                    ..Progress::default()
                },
                Some(NotResumableReason::Corrupted(detail)),
            ),
            Err(e) => return Err(e),
        };

        Ok(SessionSummary {
            session_id: record.session_id,
            status: record.status,
            criteria_version: record.criteria_version,
            criteria_digest: record.criteria_digest.to_string(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            progress,
            resumable: reason.is_none(),
            not_resumable_reason: reason.map(|r| r.to_string()),
        })
    }

    async fn latest(&self, record: &SessionRecord) -> SessionResult<BTreeMap<String, Latest>> {
        let corrupt = |detail: String| SessionError::CorruptLog {
            session_id: record.session_id.0.clone(),
            detail,
        };
        let checkpoints = match self.store.load_checkpoints(&record.session_id).await {
            Ok(checkpoints) => checkpoints,
            Err(StorageError::CorruptRecord { line, reason, .. }) => {
                return Err(corrupt(format!("line {line}: {reason}")))
            }
            Err(e) => return Err(not_found_or(e, &record.session_id)),
        };
        fold_checkpoints(record, checkpoints).map_err(corrupt)
    }

    async fn append(
        &self,
        session_id: &SessionId,
        stage: &EvaluationStage,
        result: &EntityResult,
    ) -> SessionResult<CheckpointRecord> {
        let payload = serde_json::to_value(CheckpointPayload {
            stage: stage.clone(),
            result: result.clone(),
        })?;
        let written = self
            .store
            .append_checkpoint(
                session_id,
                NewCheckpoint {
                    entity_id: result.entity_id.clone(),
                    stage: stage.to_string(),
                    terminal: result.is_terminal(),
                    payload,
                },
            )
            .await?;
        Ok(written)
    }

    fn entity_lock(&self, key: EntityKey) -> EntityLease {
        let mut locks = self.entity_locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = Arc::clone(locks.entry(key.clone()).or_default());
        EntityLease {
            table: Arc::clone(&self.entity_locks),
            key,
            lock,
        }
    }

    /// Entities with a checkpoint write in flight.
    pub fn tracked_entity_locks(&self) -> usize {
        self.entity_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Writes checkpoints for the entities of one session.
#[derive(Clone)]
pub struct SessionWriter {
    sessions: SessionManager,
    session_id: SessionId,
    entity_ids: Arc<HashSet<String>>,
}

impl SessionWriter {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

#[async_trait]
impl CheckpointSink for SessionWriter {
    async fn checkpoint(
        &self,
        stage: &EvaluationStage,
        result: &EntityResult,
    ) -> SessionResult<()> {
        if !self.entity_ids.contains(&result.entity_id) {
            return Err(SessionError::UnknownEntity {
                session_id: self.session_id.0.clone(),
                entity_id: result.entity_id.clone(),
            });
        }
        self.sessions
            .checkpoint(&self.session_id, stage, result)
            .await
            .map(|_| ())
    }
}

fn not_found_or(err: StorageError, session_id: &SessionId) -> SessionError {
    match err {
        StorageError::SessionNotFound { .. } => SessionError::NotFound {
            session_id: session_id.0.clone(),
        },
        other => other.into(),
    }
}

/// Keep the latest checkpoint per entity, validating the log on the way.
fn fold_checkpoints(
    record: &SessionRecord,
    checkpoints: Vec<CheckpointRecord>,
) -> Result<BTreeMap<String, Latest>, String> {
    let members: HashSet<&str> = record.entities.iter().map(|e| e.entity_id.as_str()).collect();
    let mut latest: BTreeMap<String, Latest> = BTreeMap::new();

    for cp in checkpoints {
        if !members.contains(cp.entity_id.as_str()) {
            return Err(format!(
                "checkpoint {} names entity {} outside the session",
                cp.seq, cp.entity_id
            ));
        }
        let payload: CheckpointPayload = serde_json::from_value(cp.payload)
            .map_err(|e| format!("checkpoint {} does not decode: {e}", cp.seq))?;
        if payload.result.entity_id != cp.entity_id {
            return Err(format!(
                "checkpoint {} is keyed by {} but holds {}",
                cp.seq, cp.entity_id, payload.result.entity_id
            ));
        }
        if latest
            .get(&cp.entity_id)
            .is_some_and(|prev| prev.result.is_terminal())
        {
            return Err(format!(
                "checkpoint {} follows a terminal checkpoint of {}",
                cp.seq, cp.entity_id
            ));
        }
        latest.insert(
            cp.entity_id,
            Latest {
                stage: payload.stage,
                result: payload.result,
            },
        );
    }
    Ok(latest)
}

fn progress(record: &SessionRecord, latest: &BTreeMap<String, Latest>) -> Progress {
    let complete = latest.values().filter(|l| l.result.is_terminal()).count();
    Progress {
        total: record.entities.len(),
        not_started: record.entities.len() - latest.len(),
        in_progress: latest.len() - complete,
        complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Criterion, GeneralStatus, Stage};
    use qualifier_store::fakes::MemoryCheckpointStore;

    fn criteria(version: &str) -> CriteriaSet {
        CriteriaSet::new(
            version,
            vec![Criterion::new("q", Stage::Qualification, Some("Gaming"), "Games?")],
        )
        .unwrap()
    }

    fn entities() -> Vec<Entity> {
        vec![
            Entity::new("acme", "Acme", "games"),
            Entity::new("globex", "Globex", "payments"),
        ]
    }

    #[tokio::test]
    async fn writer_rejects_foreign_entity() {
        let sessions = SessionManager::new(Arc::new(MemoryCheckpointStore::new()));
        let record = sessions.create_session(&entities(), &criteria("v1")).await.unwrap();
        let writer = sessions.writer(&record);

        let err = writer
            .checkpoint(&EvaluationStage::General, &EntityResult::new("initech"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownEntity { .. }));
    }

    #[tokio::test]
    async fn resume_partitions_entities() {
        let sessions = SessionManager::new(Arc::new(MemoryCheckpointStore::new()));
        let set = criteria("v1");
        let record = sessions.create_session(&entities(), &set).await.unwrap();

        let mut partial = EntityResult::new("acme");
        partial.general_status = Some(GeneralStatus::Skipped);
        sessions
            .checkpoint(&record.session_id, &EvaluationStage::General, &partial)
            .await
            .unwrap();

        let plan = sessions.resume(&record.session_id, &set).await.unwrap();
        assert!(plan.completed.is_empty());
        assert_eq!(plan.pending.len(), 2);
        assert_eq!(plan.pending[0].entity.id, "acme");
        assert_eq!(plan.pending[0].partial.as_ref(), Some(&partial));
        assert_eq!(plan.pending[1].entity.id, "globex");
        assert!(plan.pending[1].partial.is_none());
    }

    #[tokio::test]
    async fn checkpoints_of_unknown_entities_corrupt_the_log() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let sessions = SessionManager::new(store.clone());
        let set = criteria("v1");
        let record = sessions.create_session(&entities(), &set).await.unwrap();

        // Bypass the writer to simulate a damaged log.
        sessions
            .checkpoint(&record.session_id, &EvaluationStage::General, &EntityResult::new("initech"))
            .await
            .unwrap();

        let err = sessions.resume(&record.session_id, &set).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::NotResumable {
                reason: NotResumableReason::Corrupted(_),
                ..
            }
        ));
        let listed = sessions.list_sessions().await.unwrap();
        assert!(!listed[0].resumable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn entity_locks_are_released_after_writes() {
        let sessions = SessionManager::new(Arc::new(MemoryCheckpointStore::new()));
        let record = sessions.create_session(&entities(), &criteria("v1")).await.unwrap();

        let mut writes = Vec::new();
        for round in 0..20 {
            for id in ["acme", "globex"] {
                let sessions = sessions.clone();
                let session_id = record.session_id.clone();
                writes.push(tokio::spawn(async move {
                    let mut partial = EntityResult::new(id);
                    partial.general_status = Some(GeneralStatus::Skipped);
                    let stage = if round % 2 == 0 {
                        EvaluationStage::General
                    } else {
                        EvaluationStage::Qualification
                    };
                    sessions.checkpoint(&session_id, &stage, &partial).await.unwrap()
                }));
            }
        }
        let mut seqs = Vec::new();
        for write in writes {
            seqs.push(write.await.unwrap());
        }
        seqs.sort();
        assert_eq!(seqs, (0..40).collect::<Vec<u64>>());
        assert_eq!(sessions.tracked_entity_locks(), 0);
    }

    #[tokio::test]
    async fn prune_with_out_of_range_cutoff_removes_nothing() {
        let sessions = SessionManager::new(Arc::new(MemoryCheckpointStore::new()));
        let record = sessions.create_session(&entities(), &criteria("v1")).await.unwrap();
        sessions
            .mark(&record.session_id, SessionStatus::Cancelled)
            .await
            .unwrap();

        let removed = sessions
            .prune(chrono::Duration::days(1_000_000_000))
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert_eq!(sessions.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_of_missing_session_is_not_found() {
        let sessions = SessionManager::new(Arc::new(MemoryCheckpointStore::new()));
        let err = sessions.status(&SessionId::from("nope")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }
}

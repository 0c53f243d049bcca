use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

const SESSION_FILE: &str = "session.json";
const CHECKPOINT_LOG: &str = "checkpoints.jsonl";

/// Filesystem-backed session store.
///
/// Layout: `<root>/sessions/<session_id>/session.json` holds the session
/// record (replaced atomically), `<root>/sessions/<session_id>/checkpoints.jsonl`
/// holds one JSON checkpoint per line (append-only).
///
/// Disk I/O runs on the blocking thread pool. Writers to one session are
/// serialized; different sessions never wait on each other. One process
/// writes a given store at a time.
#[derive(Clone)]
pub struct FsCheckpointStore {
    inner: Arc<FsInner>,
}

struct FsInner {
    sessions_dir: PathBuf,
    logs: Mutex<HashMap<SessionId, Arc<Mutex<LogState>>>>,
}

/// Write state of one session, loaded from disk on first write.
#[derive(Default)]
struct LogState {
    tail: Option<LogTail>,
}

#[derive(Debug, Clone, Copy)]
struct LogTail {
    next_seq: u64,
    status: SessionStatus,
}

impl FsCheckpointStore {
    /// Create a new `FsCheckpointStore` rooted at `root`. Creates `root/sessions/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let sessions_dir = root.as_ref().join("sessions");
        fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            inner: Arc::new(FsInner {
                sessions_dir,
                logs: Mutex::new(HashMap::new()),
            }),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&FsInner) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StorageError::Backend(format!("filesystem task failed: {e}")))?
    }
}

impl FsInner {
    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir.join(&session_id.0)
    }

    fn log_handle(&self, session_id: &SessionId) -> Arc<Mutex<LogState>> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(logs.entry(session_id.clone()).or_default())
    }

    fn read_record(&self, session_id: &SessionId) -> StorageResult<SessionRecord> {
        let path = self.session_dir(session_id).join(SESSION_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::SessionNotFound {
                    session_id: session_id.0.clone(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptRecord {
            session_id: session_id.0.clone(),
            line: 0,
            reason: e.to_string(),
        })
    }

    fn write_record(&self, record: &SessionRecord) -> StorageResult<()> {
        let dir = self.session_dir(&record.session_id);
        fs::create_dir_all(&dir)?;

        // Atomic replace: write to a temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(SESSION_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_log(&self, session_id: &SessionId) -> StorageResult<Vec<CheckpointRecord>> {
        let path = self.session_dir(session_id).join(CHECKPOINT_LOG);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: CheckpointRecord =
                serde_json::from_str(&line).map_err(|e| StorageError::CorruptRecord {
                    session_id: session_id.0.clone(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    /// The cached tail of `session_id`'s log, reading it from disk once.
    fn tail<'a>(
        &self,
        session_id: &SessionId,
        state: &'a mut LogState,
    ) -> StorageResult<&'a mut LogTail> {
        if state.tail.is_none() {
            let status = self.read_record(session_id)?.status;
            let next_seq = self
                .read_log(session_id)?
                .last()
                .map(|c| c.seq + 1)
                .unwrap_or(0);
            debug!(session_id = %session_id, next_seq, "checkpoint log loaded");
            state.tail = Some(LogTail { next_seq, status });
        }
        state
            .tail
            .as_mut()
            .ok_or_else(|| StorageError::Backend("checkpoint log state missing".into()))
    }

    fn create_session(&self, record: SessionRecord) -> StorageResult<()> {
        let handle = self.log_handle(&record.session_id);
        let mut state = handle.lock().unwrap_or_else(|e| e.into_inner());
        if self.session_dir(&record.session_id).join(SESSION_FILE).exists() {
            return Err(StorageError::SessionExists {
                session_id: record.session_id.0.clone(),
            });
        }
        self.write_record(&record)?;
        state.tail = Some(LogTail {
            next_seq: 0,
            status: record.status,
        });
        debug!(session_id = %record.session_id, "session created on disk");
        Ok(())
    }

    fn set_status(&self, session_id: &SessionId, status: SessionStatus) -> StorageResult<()> {
        let handle = self.log_handle(session_id);
        let mut state = handle.lock().unwrap_or_else(|e| e.into_inner());
        let mut record = self.read_record(session_id)?;
        record.status = status;
        record.updated_at = Utc::now();
        self.write_record(&record)?;
        if let Some(tail) = state.tail.as_mut() {
            tail.status = status;
        }
        Ok(())
    }

    fn append_checkpoint(
        &self,
        session_id: &SessionId,
        checkpoint: NewCheckpoint,
    ) -> StorageResult<CheckpointRecord> {
        let handle = self.log_handle(session_id);
        let mut state = handle.lock().unwrap_or_else(|e| e.into_inner());
        let tail = self.tail(session_id, &mut state)?;
        if tail.status == SessionStatus::Completed {
            return Err(StorageError::SessionClosed {
                session_id: session_id.0.clone(),
                status: tail.status.to_string(),
            });
        }

        let record = CheckpointRecord {
            session_id: session_id.clone(),
            entity_id: checkpoint.entity_id,
            seq: tail.next_seq,
            stage: checkpoint.stage,
            terminal: checkpoint.terminal,
            payload: checkpoint.payload,
            recorded_at: Utc::now(),
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_dir(session_id).join(CHECKPOINT_LOG))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        tail.next_seq += 1;
        Ok(record)
    }

    fn list_session_ids(&self) -> StorageResult<Vec<SessionId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(SessionId(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn delete_session(&self, session_id: &SessionId) -> StorageResult<()> {
        let handle = self.log_handle(session_id);
        let mut state = handle.lock().unwrap_or_else(|e| e.into_inner());
        // Writers still queued on this handle re-read the (missing) session.
        state.tail = None;
        let removed = match fs::remove_dir_all(self.session_dir(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        };
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        removed
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn create_session(&self, record: SessionRecord) -> StorageResult<()> {
        self.blocking(move |store| store.create_session(record)).await
    }

    async fn get_session(&self, session_id: &SessionId) -> StorageResult<SessionRecord> {
        let session_id = session_id.clone();
        self.blocking(move |store| store.read_record(&session_id)).await
    }

    async fn set_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> StorageResult<()> {
        let session_id = session_id.clone();
        self.blocking(move |store| store.set_status(&session_id, status)).await
    }

    async fn append_checkpoint(
        &self,
        session_id: &SessionId,
        checkpoint: NewCheckpoint,
    ) -> StorageResult<CheckpointRecord> {
        let session_id = session_id.clone();
        self.blocking(move |store| store.append_checkpoint(&session_id, checkpoint))
            .await
    }

    async fn load_checkpoints(&self, session_id: &SessionId) -> StorageResult<Vec<CheckpointRecord>> {
        let session_id = session_id.clone();
        self.blocking(move |store| {
            // Surface a missing session as such, not as an empty log.
            store.read_record(&session_id)?;
            store.read_log(&session_id)
        })
        .await
    }

    async fn list_session_ids(&self) -> StorageResult<Vec<SessionId>> {
        self.blocking(|store| store.list_session_ids()).await
    }

    async fn delete_session(&self, session_id: &SessionId) -> StorageResult<()> {
        let session_id = session_id.clone();
        self.blocking(move |store| store.delete_session(&session_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsCheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn record() -> SessionRecord {
        SessionRecord::new(
            ContentDigest::from_bytes(b"criteria"),
            "v1",
            vec![EntityEntry {
                entity_id: "acme".into(),
                payload: serde_json::json!({"name": "Acme"}),
            }],
        )
    }

    #[tokio::test]
    async fn creates_session_layout() {
        let (dir, store) = make_store();
        let rec = record();
        store.create_session(rec.clone()).await.unwrap();

        let session_file = dir
            .path()
            .join("sessions")
            .join(&rec.session_id.0)
            .join(SESSION_FILE);
        assert!(session_file.exists());
    }

    #[tokio::test]
    async fn appends_one_line_per_checkpoint() {
        let (dir, store) = make_store();
        let rec = record();
        store.create_session(rec.clone()).await.unwrap();

        for stage in ["general", "qualification"] {
            store
                .append_checkpoint(
                    &rec.session_id,
                    NewCheckpoint {
                        entity_id: "acme".into(),
                        stage: stage.into(),
                        terminal: false,
                        payload: serde_json::json!({"stage": stage}),
                    },
                )
                .await
                .unwrap();
        }

        let log = dir
            .path()
            .join("sessions")
            .join(&rec.session_id.0)
            .join(CHECKPOINT_LOG);
        let contents = fs::read_to_string(log).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_reported_as_corrupt() {
        let (dir, store) = make_store();
        let rec = record();
        store.create_session(rec.clone()).await.unwrap();
        store
            .append_checkpoint(
                &rec.session_id,
                NewCheckpoint {
                    entity_id: "acme".into(),
                    stage: "general".into(),
                    terminal: false,
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap();

        let log = dir
            .path()
            .join("sessions")
            .join(&rec.session_id.0)
            .join(CHECKPOINT_LOG);
        let mut file = OpenOptions::new().append(true).open(log).unwrap();
        file.write_all(b"{\"session_id\":").unwrap();

        match store.load_checkpoints(&rec.session_id).await {
            Err(StorageError::CorruptRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected CorruptRecord, got {other:?}"),
        }
    }

    fn general(entity: &str) -> NewCheckpoint {
        NewCheckpoint {
            entity_id: entity.into(),
            stage: "general".into(),
            terminal: false,
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn sequence_continues_after_reopen() {
        let (dir, store) = make_store();
        let rec = record();
        store.create_session(rec.clone()).await.unwrap();
        for _ in 0..3 {
            store
                .append_checkpoint(&rec.session_id, general("acme"))
                .await
                .unwrap();
        }
        drop(store);

        let reopened = FsCheckpointStore::new(dir.path()).unwrap();
        let next = reopened
            .append_checkpoint(&rec.session_id, general("acme"))
            .await
            .unwrap();
        assert_eq!(next.seq, 3);
        let seqs: Vec<u64> = reopened
            .load_checkpoints(&rec.session_id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn appends_do_not_reread_the_log() {
        let (dir, store) = make_store();
        let rec = record();
        store.create_session(rec.clone()).await.unwrap();
        store
            .append_checkpoint(&rec.session_id, general("acme"))
            .await
            .unwrap();

        // Damage the first line behind the store's back. Readers notice,
        // the writer keeps appending from its cached tail.
        let log = dir
            .path()
            .join("sessions")
            .join(&rec.session_id.0)
            .join(CHECKPOINT_LOG);
        let mut contents = fs::read_to_string(&log).unwrap();
        contents.insert(0, '#');
        fs::write(&log, contents).unwrap();

        let next = store
            .append_checkpoint(&rec.session_id, general("acme"))
            .await
            .unwrap();
        assert_eq!(next.seq, 1);
        assert!(matches!(
            store.load_checkpoints(&rec.session_id).await,
            Err(StorageError::CorruptRecord { line: 1, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sessions_append_independently() {
        let (_dir, store) = make_store();
        let sessions = [record(), record()];
        for rec in &sessions {
            store.create_session(rec.clone()).await.unwrap();
        }

        let mut writes = Vec::new();
        for rec in &sessions {
            for _ in 0..25 {
                let store = store.clone();
                let session_id = rec.session_id.clone();
                writes.push(tokio::spawn(async move {
                    store
                        .append_checkpoint(&session_id, general("acme"))
                        .await
                        .unwrap()
                }));
            }
        }
        for write in writes {
            write.await.unwrap();
        }

        for rec in &sessions {
            let seqs: Vec<u64> = store
                .load_checkpoints(&rec.session_id)
                .await
                .unwrap()
                .iter()
                .map(|c| c.seq)
                .collect();
            assert_eq!(seqs, (0..25).collect::<Vec<u64>>());
        }
    }

    #[tokio::test]
    async fn deleted_session_rejects_appends() {
        let (_dir, store) = make_store();
        let rec = record();
        store.create_session(rec.clone()).await.unwrap();
        store
            .append_checkpoint(&rec.session_id, general("acme"))
            .await
            .unwrap();
        store.delete_session(&rec.session_id).await.unwrap();

        let err = store
            .append_checkpoint(&rec.session_id, general("acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound { .. }));
    }
}

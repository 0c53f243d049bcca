//! Trait contract tests for CheckpointStore.
//!
//! Every conforming backend must pass these; they run against the
//! in-memory fake and the filesystem store.

use qualifier_store::fakes::MemoryCheckpointStore;
use qualifier_store::storage_traits::*;
use qualifier_store::{FsCheckpointStore, StorageError};

fn session() -> SessionRecord {
    SessionRecord::new(
        ContentDigest::from_bytes(b"criteria-v1"),
        "v1",
        vec![
            EntityEntry {
                entity_id: "acme".into(),
                payload: serde_json::json!({"name": "Acme"}),
            },
            EntityEntry {
                entity_id: "globex".into(),
                payload: serde_json::json!({"name": "Globex"}),
            },
        ],
    )
}

fn checkpoint(entity: &str, stage: &str, terminal: bool) -> NewCheckpoint {
    NewCheckpoint {
        entity_id: entity.into(),
        stage: stage.into(),
        terminal,
        payload: serde_json::json!({"entity": entity, "stage": stage}),
    }
}

async fn create_then_get_round_trip(store: &dyn CheckpointStore) {
    let rec = session();
    store.create_session(rec.clone()).await.unwrap();
    let loaded = store.get_session(&rec.session_id).await.unwrap();

    assert_eq!(loaded.session_id, rec.session_id);
    assert_eq!(loaded.criteria_digest, rec.criteria_digest);
    assert_eq!(loaded.entities, rec.entities);
    assert_eq!(loaded.status, SessionStatus::Created);
}

async fn duplicate_create_rejected(store: &dyn CheckpointStore) {
    let rec = session();
    store.create_session(rec.clone()).await.unwrap();
    let err = store.create_session(rec).await.unwrap_err();
    assert!(matches!(err, StorageError::SessionExists { .. }));
}

async fn missing_session_not_found(store: &dyn CheckpointStore) {
    let err = store.get_session(&SessionId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::SessionNotFound { .. }));
    let err = store.load_checkpoints(&SessionId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::SessionNotFound { .. }));
}

async fn checkpoints_are_ordered_by_seq(store: &dyn CheckpointStore) {
    let rec = session();
    store.create_session(rec.clone()).await.unwrap();

    store
        .append_checkpoint(&rec.session_id, checkpoint("acme", "general", false))
        .await
        .unwrap();
    store
        .append_checkpoint(&rec.session_id, checkpoint("globex", "general", false))
        .await
        .unwrap();
    let last = store
        .append_checkpoint(&rec.session_id, checkpoint("acme", "terminal", true))
        .await
        .unwrap();

    let log = store.load_checkpoints(&rec.session_id).await.unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(log[2].seq, last.seq);
    assert!(log[2].terminal);
    assert_eq!(log[2].payload["stage"], "terminal");
}

async fn completed_session_rejects_checkpoints(store: &dyn CheckpointStore) {
    let rec = session();
    store.create_session(rec.clone()).await.unwrap();
    store
        .set_status(&rec.session_id, SessionStatus::Completed)
        .await
        .unwrap();

    let err = store
        .append_checkpoint(&rec.session_id, checkpoint("acme", "general", false))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::SessionClosed { .. }));
}

async fn cancelled_session_still_accepts_checkpoints(store: &dyn CheckpointStore) {
    let rec = session();
    store.create_session(rec.clone()).await.unwrap();
    store
        .set_status(&rec.session_id, SessionStatus::Cancelled)
        .await
        .unwrap();

    store
        .append_checkpoint(&rec.session_id, checkpoint("acme", "general", false))
        .await
        .unwrap();
}

async fn list_and_delete(store: &dyn CheckpointStore) {
    let a = session();
    let b = session();
    store.create_session(a.clone()).await.unwrap();
    store.create_session(b.clone()).await.unwrap();

    let ids = store.list_session_ids().await.unwrap();
    assert!(ids.contains(&a.session_id));
    assert!(ids.contains(&b.session_id));

    store.delete_session(&a.session_id).await.unwrap();
    store.delete_session(&a.session_id).await.unwrap();
    let ids = store.list_session_ids().await.unwrap();
    assert!(!ids.contains(&a.session_id));
    assert!(ids.contains(&b.session_id));
}

macro_rules! contract_suite {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn create_get() {
                let (_guard, store) = $make;
                create_then_get_round_trip(&store).await;
            }

            #[tokio::test]
            async fn duplicate_create() {
                let (_guard, store) = $make;
                duplicate_create_rejected(&store).await;
            }

            #[tokio::test]
            async fn missing_session() {
                let (_guard, store) = $make;
                missing_session_not_found(&store).await;
            }

            #[tokio::test]
            async fn ordering() {
                let (_guard, store) = $make;
                checkpoints_are_ordered_by_seq(&store).await;
            }

            #[tokio::test]
            async fn completed_rejects() {
                let (_guard, store) = $make;
                completed_session_rejects_checkpoints(&store).await;
            }

            #[tokio::test]
            async fn cancelled_accepts() {
                let (_guard, store) = $make;
                cancelled_session_still_accepts_checkpoints(&store).await;
            }

            #[tokio::test]
            async fn listing() {
                let (_guard, store) = $make;
                list_and_delete(&store).await;
            }
        }
    };
}

contract_suite!(memory, ((), MemoryCheckpointStore::new()));
contract_suite!(filesystem, {
    let dir = tempfile::tempdir().unwrap();
    let store = FsCheckpointStore::new(dir.path()).unwrap();
    (dir, store)
});

#[tokio::test]
async fn fs_store_is_readable_by_a_second_instance() {
    let dir = tempfile::tempdir().unwrap();
    let rec = session();
    {
        let writer = FsCheckpointStore::new(dir.path()).unwrap();
        writer.create_session(rec.clone()).await.unwrap();
        writer
            .append_checkpoint(&rec.session_id, checkpoint("acme", "general", false))
            .await
            .unwrap();
    }

    let reader = FsCheckpointStore::new(dir.path()).unwrap();
    let log = reader.load_checkpoints(&rec.session_id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].entity_id, "acme");
}

#[tokio::test]
async fn memory_store_injects_write_failures() {
    let store = MemoryCheckpointStore::new();
    let rec = session();
    store.create_session(rec.clone()).await.unwrap();
    store.fail_writes_for("globex");

    store
        .append_checkpoint(&rec.session_id, checkpoint("acme", "general", false))
        .await
        .unwrap();
    let err = store
        .append_checkpoint(&rec.session_id, checkpoint("globex", "general", false))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Backend(_)));
    assert_eq!(store.checkpoint_count(&rec.session_id), 1);
}

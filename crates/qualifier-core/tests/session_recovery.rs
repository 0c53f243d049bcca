//! Checkpointing and resume: idempotence, rejection reasons and crash
//! recovery across process instances.

use std::sync::Arc;
use std::time::Duration;

use qualifier_core::config::ScreeningConfig;
use qualifier_core::domain::{
    Answer, CriteriaSet, Criterion, Entity, EntityResult, FinalStatus, NotResumableReason,
    SessionError, Stage,
};
use qualifier_core::fakes::{ScriptedClassifier, StaticSource};
use qualifier_core::remote::RetryPolicy;
use qualifier_core::service::{ScreeningError, ScreeningService};
use qualifier_core::{SessionId, SessionStatus};
use qualifier_store::fakes::MemoryCheckpointStore;
use qualifier_store::{CheckpointStore, FsCheckpointStore};

fn config() -> ScreeningConfig {
    ScreeningConfig {
        retry: RetryPolicy {
            rate_limit_base_delay_ms: 1,
            transport_delay_ms: 1,
            ..RetryPolicy::default()
        },
        ..ScreeningConfig::default()
    }
}

fn criteria(version: &str) -> Arc<CriteriaSet> {
    Arc::new(
        CriteriaSet::new(
            version,
            vec![
                Criterion::new("G", Stage::General, None, "Is a company"),
                Criterion::new("QG", Stage::Qualification, Some("Gaming"), "Games?"),
                Criterion::new("QF", Stage::Qualification, Some("Fintech"), "Payments?"),
                Criterion::new("X", Stage::Mandatory, Some("Gaming"), "Online play"),
                Criterion::new("Y", Stage::NiceToHave, Some("Gaming"), "Esports"),
                Criterion::new("Z", Stage::NiceToHave, Some("Gaming"), "Mobile"),
                Criterion::new("F", Stage::NiceToHave, Some("Fintech"), "EU licence"),
            ],
        )
        .unwrap(),
    )
}

fn entities() -> Vec<Entity> {
    ["e1", "e2", "e3", "e4", "e5"]
        .iter()
        .map(|id| Entity::new(*id, id.to_uppercase(), format!("{id} description")))
        .collect()
}

fn classifier() -> ScriptedClassifier {
    ScriptedClassifier::new(Answer::Passed)
        .answer("e2", "X", Answer::NotPassed)
        .answer("e3", "G", Answer::NotPassed)
        .qualify_as("e4", &[("Gaming", false), ("Fintech", false)])
        .answer("e5", "Y", Answer::Indeterminate)
        .answer("e5", "F", Answer::NotPassed)
}

fn service(store: Arc<dyn CheckpointStore>, classifier: ScriptedClassifier) -> ScreeningService {
    ScreeningService::new(
        config(),
        store,
        Arc::new(classifier),
        Arc::new(StaticSource::new("search results")),
    )
    .unwrap()
}

async fn run_to_completion(store: Arc<MemoryCheckpointStore>) -> (SessionId, Vec<EntityResult>) {
    let service = service(store, classifier());
    let handle = service
        .submit_batch(entities(), criteria("v1"), Some(2))
        .await
        .unwrap();
    let session_id = handle.session_id().clone();
    handle.wait().await.unwrap();
    let results = service.get_results(&session_id).await.unwrap();
    (session_id, results)
}

fn not_resumable_reason(err: ScreeningError) -> NotResumableReason {
    match err {
        ScreeningError::Session(SessionError::NotResumable { reason, .. }) => reason,
        other => panic!("expected NotResumable, got {other:?}"),
    }
}

#[tokio::test]
async fn resuming_from_any_checkpoint_matches_an_uninterrupted_run() {
    let baseline_store = Arc::new(MemoryCheckpointStore::new());
    let (baseline_id, baseline) = run_to_completion(baseline_store.clone()).await;
    assert_eq!(baseline.len(), 5);
    let total = baseline_store.checkpoint_count(&baseline_id) as u64;

    for cut in 0..total {
        let store = Arc::new(MemoryCheckpointStore::new());
        let (session_id, _) = run_to_completion(store.clone()).await;
        store.truncate_checkpoints(&session_id, cut);
        store
            .set_status(&session_id, SessionStatus::Running)
            .await
            .unwrap();

        let service = service(store.clone(), classifier());
        let summary = service
            .resume(&session_id, criteria("v1"), Some(3))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(summary.status, SessionStatus::Completed, "cut at {cut}");

        let resumed = service.get_results(&session_id).await.unwrap();
        assert_eq!(resumed, baseline, "cut at {cut}");
    }
}

#[tokio::test]
async fn completed_entities_are_never_re_run() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = service(store.clone(), classifier());
    let handle = first
        .submit_batch(entities(), criteria("v1"), Some(1))
        .await
        .unwrap();
    let session_id = handle.session_id().clone();
    handle.wait().await.unwrap();

    // With one slot the log is sequential: e1 writes general, qualification,
    // then mandatory and nice_to_have for Gaming and Fintech (0..=5); e2
    // follows with general (6) and qualification (7).
    store.truncate_checkpoints(&session_id, 8);
    store
        .set_status(&session_id, SessionStatus::Cancelled)
        .await
        .unwrap();

    let fresh = Arc::new(classifier());
    let second = ScreeningService::new(
        config(),
        store.clone(),
        fresh.clone(),
        Arc::new(StaticSource::new("search results")),
    )
    .unwrap();
    let (delivered, summary) = second
        .resume(&session_id, criteria("v1"), Some(1))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(summary.previously_completed, 1);
    assert_eq!(delivered.len(), 4);
    assert_eq!(first.sessions().tracked_entity_locks(), 0);
    assert_eq!(second.sessions().tracked_entity_locks(), 0);
    assert!(fresh.calls_for("e1").is_empty());
    assert_eq!(fresh.calls_for("e2"), vec!["X", "F"]);
    assert_eq!(fresh.calls_for("e3"), vec!["G"]);
    assert!(!fresh.qualify_calls().contains(&"e2".to_string()));
}

#[tokio::test]
async fn missing_session_is_not_resumable() {
    let service = service(Arc::new(MemoryCheckpointStore::new()), classifier());
    let err = service
        .resume(&SessionId::from("ghost"), criteria("v1"), None)
        .await
        .err()
        .unwrap();
    assert_eq!(not_resumable_reason(err), NotResumableReason::Missing);
}

#[tokio::test]
async fn changed_criteria_are_rejected() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let (session_id, _) = run_to_completion(store.clone()).await;
    store.truncate_checkpoints(&session_id, 3);
    store
        .set_status(&session_id, SessionStatus::Cancelled)
        .await
        .unwrap();

    let service = service(store, classifier());
    let err = service
        .resume(&session_id, criteria("v2"), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        not_resumable_reason(err),
        NotResumableReason::CriteriaChanged { .. }
    ));
    assert!(!service.is_running(&session_id));
}

#[tokio::test]
async fn completed_session_is_not_resumable() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let (session_id, _) = run_to_completion(store.clone()).await;

    let service = service(store.clone(), classifier());
    let err = service
        .resume(&session_id, criteria("v1"), None)
        .await
        .err()
        .unwrap();
    assert_eq!(not_resumable_reason(err), NotResumableReason::AlreadyCompleted);

    // Same when only the final status update was lost.
    store
        .set_status(&session_id, SessionStatus::Running)
        .await
        .unwrap();
    let err = service
        .resume(&session_id, criteria("v1"), None)
        .await
        .err()
        .unwrap();
    assert_eq!(not_resumable_reason(err), NotResumableReason::AlreadyCompleted);
    let record = store.get_session(&session_id).await.unwrap();
    assert_eq!(record.status, SessionStatus::Completed);
}

#[tokio::test]
async fn undecodable_checkpoint_is_reported_as_corruption() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let (session_id, _) = run_to_completion(store.clone()).await;
    store.corrupt_checkpoint(&session_id, 2, serde_json::json!({"stage": "warp"}));
    store
        .set_status(&session_id, SessionStatus::Running)
        .await
        .unwrap();

    let service = service(store, classifier());
    let err = service
        .resume(&session_id, criteria("v1"), None)
        .await
        .err()
        .unwrap();
    match not_resumable_reason(err) {
        NotResumableReason::Corrupted(detail) => assert!(detail.contains("checkpoint 2")),
        other => panic!("expected Corrupted, got {other:?}"),
    }

    let summaries = service.sessions().list_sessions().await.unwrap();
    assert!(!summaries[0].resumable);
    assert!(service.list_resumable().await.unwrap().is_empty());
}

#[test]
fn crashed_session_resumes_in_a_new_process() {
    let dir = tempfile::tempdir().unwrap();

    let session_id = {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = Arc::new(FsCheckpointStore::new(dir.path()).unwrap());
            let slow = classifier().with_latency(Duration::from_millis(100));
            let service = service(store, slow);
            let handle = service
                .submit_batch(entities(), criteria("v1"), Some(1))
                .await
                .unwrap();
            let session_id = handle.session_id().clone();
            // e1 has checkpointed general and qualification by now.
            tokio::time::sleep(Duration::from_millis(250)).await;
            session_id
        })
        // Dropping the runtime kills every task mid-flight.
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let store = Arc::new(FsCheckpointStore::new(dir.path()).unwrap());
        let service = service(store, classifier());

        let resumable = service.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].status, SessionStatus::Running);
        assert_eq!(resumable[0].progress.in_progress, 1);

        let (_, summary) = service
            .resume(&session_id, criteria("v1"), None)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);

        let results = service.get_results(&session_id).await.unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.is_terminal()));
        assert_eq!(results[2].final_status, Some(FinalStatus::FailedGeneral));
        assert_eq!(results[3].final_status, Some(FinalStatus::NotQualifiedAny));
    });
}

#[tokio::test]
async fn prune_removes_only_old_finished_sessions() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let (finished, _) = run_to_completion(store.clone()).await;
    let service = service(store.clone(), classifier());
    let pending = service
        .sessions()
        .create_session(&entities(), &criteria("v1"))
        .await
        .unwrap();

    let removed = service.sessions().prune(chrono::Duration::days(1)).await.unwrap();
    assert!(removed.is_empty());

    let removed = service.sessions().prune(chrono::Duration::zero()).await.unwrap();
    assert_eq!(removed, vec![finished]);
    let remaining = service.sessions().list_sessions().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id, pending.session_id);
}

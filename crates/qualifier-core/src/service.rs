//! Batch screening surface: submit, resume, cancel and inspect sessions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use qualifier_store::{CheckpointStore, SessionId, SessionRecord, SessionStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{warn, Instrument};

use crate::breaker::CircuitBreaker;
use crate::config::{ConfigError, ScreeningConfig};
use crate::domain::{CriteriaError, CriteriaSet, Entity, EntityResult, SessionError};
use crate::evaluator::EvaluationContext;
use crate::metrics::METRICS;
use crate::obs;
use crate::remote::{ClassificationService, InformationSource};
use crate::scheduler::{BatchReport, EntityJob, Scheduler};
use crate::session::{SessionManager, SessionStatusReport, SessionSummary};

#[derive(Debug, thiserror::Error)]
pub enum ScreeningError {
    #[error(transparent)]
    Criteria(#[from] CriteriaError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("entity {entity_id} submitted more than once")]
    DuplicateEntity { entity_id: String },

    #[error("concurrency limit must be at least 1")]
    InvalidConcurrency,

    #[error("batch task failed: {0}")]
    TaskFailed(String),
}

pub type ScreeningResult<T> = std::result::Result<T, ScreeningError>;

/// Final account of one run of a session.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub session_id: SessionId,
    /// Status recorded for the session when the run ended.
    pub status: SessionStatus,
    pub report: BatchReport,
    /// Entities already complete before this run started (resume only).
    pub previously_completed: usize,
}

/// A running batch.
pub struct BatchHandle {
    session_id: SessionId,
    results: mpsc::UnboundedReceiver<EntityResult>,
    finished: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next result in completion order; `None` once every admitted entity
    /// has been delivered.
    pub async fn next_result(&mut self) -> Option<EntityResult> {
        self.results.recv().await
    }

    /// Wait for the run to end, discarding undelivered results.
    pub async fn wait(self) -> ScreeningResult<BatchSummary> {
        drop(self.results);
        self.finished
            .await
            .map_err(|e| ScreeningError::TaskFailed(e.to_string()))
    }

    /// Drain the result stream, then wait for the run to end. Results are
    /// sorted by entity id.
    pub async fn collect(mut self) -> ScreeningResult<(Vec<EntityResult>, BatchSummary)> {
        let mut results = Vec::new();
        while let Some(result) = self.results.recv().await {
            results.push(result);
        }
        results.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        let summary = self.wait().await?;
        Ok((results, summary))
    }
}

type ActiveRuns = Arc<Mutex<HashMap<String, watch::Sender<bool>>>>;

/// Entry point for embedding applications.
///
/// Owns one circuit breaker, shared by every batch it runs. Services
/// talking to the same remote credential should share a breaker through
/// [`ScreeningService::with_breaker`].
pub struct ScreeningService {
    config: ScreeningConfig,
    sessions: SessionManager,
    classifier: Arc<dyn ClassificationService>,
    source: Arc<dyn InformationSource>,
    breaker: Arc<CircuitBreaker>,
    active: ActiveRuns,
}

impl ScreeningService {
    pub fn new(
        config: ScreeningConfig,
        store: Arc<dyn CheckpointStore>,
        classifier: Arc<dyn ClassificationService>,
        source: Arc<dyn InformationSource>,
    ) -> ScreeningResult<Self> {
        config.validate()?;
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        Ok(Self {
            config,
            sessions: SessionManager::new(store),
            classifier,
            source,
            breaker,
            active: Arc::default(),
        })
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Create a session for `entities` and start evaluating them.
    ///
    /// `concurrency` defaults to `max_concurrent_companies`.
    pub async fn submit_batch(
        &self,
        entities: Vec<Entity>,
        criteria: Arc<CriteriaSet>,
        concurrency: Option<usize>,
    ) -> ScreeningResult<BatchHandle> {
        let concurrency = self.concurrency(concurrency)?;
        let mut seen = HashSet::new();
        if let Some(dup) = entities.iter().find(|e| !seen.insert(e.id.as_str())) {
            return Err(ScreeningError::DuplicateEntity {
                entity_id: dup.id.clone(),
            });
        }

        let record = self.sessions.create_session(&entities, &criteria).await?;
        let cancel = self.register(&record.session_id)?;
        let jobs = entities.into_iter().map(EntityJob::fresh).collect();
        self.launch(record, criteria, jobs, 0, concurrency, cancel).await
    }

    /// Continue an interrupted session from its checkpoints.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        criteria: Arc<CriteriaSet>,
        concurrency: Option<usize>,
    ) -> ScreeningResult<BatchHandle> {
        let concurrency = self.concurrency(concurrency)?;
        let cancel = self.register(session_id)?;
        let plan = match self.sessions.resume(session_id, &criteria).await {
            Ok(plan) => plan,
            Err(err) => {
                self.unregister(session_id);
                return Err(err.into());
            }
        };
        let previously_completed = plan.completed.len();
        self.launch(
            plan.record,
            criteria,
            plan.pending,
            previously_completed,
            concurrency,
            cancel,
        )
        .await
    }

    /// Request cancellation of a running session. Returns `false` if the
    /// session is not running in this service.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(&session_id.0) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(&session_id.0)
    }

    pub async fn get_status(&self, session_id: &SessionId) -> ScreeningResult<SessionStatusReport> {
        Ok(self.sessions.status(session_id).await?)
    }

    pub async fn get_results(&self, session_id: &SessionId) -> ScreeningResult<Vec<EntityResult>> {
        Ok(self.sessions.results(session_id).await?)
    }

    /// Resumable sessions, excluding those running in this service.
    pub async fn list_resumable(&self) -> ScreeningResult<Vec<SessionSummary>> {
        let sessions = self.sessions.list_resumable().await?;
        Ok(sessions
            .into_iter()
            .filter(|s| !self.is_running(&s.session_id))
            .collect())
    }

    fn concurrency(&self, requested: Option<usize>) -> ScreeningResult<usize> {
        match requested {
            Some(0) => Err(ScreeningError::InvalidConcurrency),
            Some(n) => Ok(n),
            None => Ok(self.config.max_concurrent_companies),
        }
    }

    fn register(&self, session_id: &SessionId) -> ScreeningResult<watch::Receiver<bool>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(&session_id.0) {
            return Err(SessionError::AlreadyRunning {
                session_id: session_id.0.clone(),
            }
            .into());
        }
        let (tx, rx) = watch::channel(false);
        active.insert(session_id.0.clone(), tx);
        Ok(rx)
    }

    fn unregister(&self, session_id: &SessionId) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&session_id.0);
    }

    async fn launch(
        &self,
        record: SessionRecord,
        criteria: Arc<CriteriaSet>,
        jobs: Vec<EntityJob>,
        previously_completed: usize,
        concurrency: usize,
        cancel: watch::Receiver<bool>,
    ) -> ScreeningResult<BatchHandle> {
        let session_id = record.session_id.clone();
        if let Err(err) = self.sessions.mark(&session_id, SessionStatus::Running).await {
            self.unregister(&session_id);
            return Err(err.into());
        }

        let ctx = Arc::new(EvaluationContext::new(
            criteria,
            Arc::clone(&self.classifier),
            Arc::clone(&self.source),
            Arc::clone(&self.breaker),
            &self.config,
        ));
        let scheduler = Scheduler::new(ctx, Arc::new(self.sessions.writer(&record)), concurrency);
        obs::emit_batch_started(&session_id.0, jobs.len(), scheduler.concurrency());
        let (results, report) = scheduler.run(jobs, cancel);

        let sessions = self.sessions.clone();
        let active = Arc::clone(&self.active);
        let span = tracing::info_span!("qualifier.batch", session_id = %session_id);
        let finished = tokio::spawn(
            {
                let session_id = session_id.clone();
                async move {
                    let (report, status) = match report.await {
                        Ok(report) if !report.aborted.is_empty() => (report, SessionStatus::Failed),
                        Ok(report) if report.is_complete() => (report, SessionStatus::Completed),
                        Ok(report) => (report, SessionStatus::Cancelled),
                        Err(err) => {
                            warn!(error = %err, "scheduler task failed");
                            (BatchReport::default(), SessionStatus::Failed)
                        }
                    };
                    if let Err(err) = sessions.mark(&session_id, status).await {
                        warn!(error = %err, status = %status, "failed to record session status");
                    }
                    active
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&session_id.0);

                    obs::emit_batch_finished(
                        &session_id.0,
                        report.completed.len(),
                        report.aborted.len(),
                        report.cancelled.len(),
                        report.not_admitted.len(),
                    );
                    METRICS.flush();
                    BatchSummary {
                        session_id,
                        status,
                        report,
                        previously_completed,
                    }
                }
            }
            .instrument(span),
        );

        Ok(BatchHandle {
            session_id,
            results,
            finished,
        })
    }
}

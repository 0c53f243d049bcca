//! Bounded-concurrency scheduling of entity evaluations.
//!
//! A driver task admits entities in submission order, one per semaphore
//! permit; a finishing entity frees its permit for the next one at once.
//! Results are delivered on an unbounded channel in completion order.
//! Each evaluation runs in its own task so a panic aborts that entity only.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{warn, Instrument};

use crate::domain::{Entity, EntityResult, FinalStatus};
use crate::evaluator::{CheckpointSink, EntityEvaluator, EvaluationContext, EvaluationOutcome};
use crate::metrics::METRICS;
use crate::obs;

/// One entity to evaluate, optionally resuming from a partial result.
#[derive(Debug, Clone)]
pub struct EntityJob {
    pub entity: Entity,
    pub partial: Option<EntityResult>,
}

impl EntityJob {
    pub fn fresh(entity: Entity) -> Self {
        Self {
            entity,
            partial: None,
        }
    }

    pub fn resumed(entity: Entity, partial: EntityResult) -> Self {
        Self {
            entity,
            partial: Some(partial),
        }
    }
}

/// Entity ids by how their evaluation ended, each sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Reached a terminal status.
    pub completed: Vec<String>,
    /// Entity-level unrecoverable error; delivered with `FinalStatus::Aborted`.
    pub aborted: Vec<String>,
    /// Stopped at a stage boundary by cancellation.
    pub cancelled: Vec<String>,
    /// Never started because cancellation arrived first.
    pub not_admitted: Vec<String>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.completed.len() + self.aborted.len() + self.cancelled.len() + self.not_admitted.len()
    }

    /// Whether every entity reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.aborted.is_empty() && self.cancelled.is_empty() && self.not_admitted.is_empty()
    }

    fn record(&mut self, entity_id: String, disposition: Disposition) {
        match disposition {
            Disposition::Completed => self.completed.push(entity_id),
            Disposition::Aborted => self.aborted.push(entity_id),
            Disposition::Cancelled => self.cancelled.push(entity_id),
        }
    }

    fn sort(&mut self) {
        self.completed.sort();
        self.aborted.sort();
        self.cancelled.sort();
        self.not_admitted.sort();
    }
}

#[derive(Debug, Clone, Copy)]
enum Disposition {
    Completed,
    Aborted,
    Cancelled,
}

pub struct Scheduler {
    ctx: Arc<EvaluationContext>,
    sink: Arc<dyn CheckpointSink>,
    concurrency: usize,
}

impl Scheduler {
    /// `concurrency` below 1 is treated as 1.
    pub fn new(ctx: Arc<EvaluationContext>, sink: Arc<dyn CheckpointSink>, concurrency: usize) -> Self {
        Self {
            ctx,
            sink,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start evaluating `jobs`.
    ///
    /// Returns the result stream and a handle resolving to the batch report
    /// once every admitted entity has finished. Setting `cancel` to `true`
    /// stops admission and interrupts running entities at their next stage
    /// boundary.
    pub fn run(
        &self,
        jobs: Vec<EntityJob>,
        cancel: watch::Receiver<bool>,
    ) -> (mpsc::UnboundedReceiver<EntityResult>, JoinHandle<BatchReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let ctx = Arc::clone(&self.ctx);
        let sink = Arc::clone(&self.sink);

        let driver = tokio::spawn(async move {
            let mut cancel = cancel;
            let mut tasks = JoinSet::new();
            let mut report = BatchReport::default();
            let mut pending = jobs.into_iter();

            while let Some(job) = pending.next() {
                let permit = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => None,
                    permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    report.not_admitted.push(job.entity.id);
                    report.not_admitted.extend(pending.map(|j| j.entity.id));
                    break;
                };

                let span = tracing::info_span!("qualifier.entity", entity_id = %job.entity.id);
                let task = evaluate_entity(
                    Arc::clone(&ctx),
                    Arc::clone(&sink),
                    job,
                    cancel.clone(),
                    tx.clone(),
                );
                tasks.spawn(
                    async move {
                        let outcome = task.await;
                        drop(permit);
                        outcome
                    }
                    .instrument(span),
                );
            }
            drop(tx);

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((entity_id, disposition)) => report.record(entity_id, disposition),
                    Err(err) => warn!(error = %err, "entity task failed to join"),
                }
            }
            report.sort();
            report
        });

        (rx, driver)
    }
}

async fn evaluate_entity(
    ctx: Arc<EvaluationContext>,
    sink: Arc<dyn CheckpointSink>,
    job: EntityJob,
    cancel: watch::Receiver<bool>,
    results: mpsc::UnboundedSender<EntityResult>,
) -> (String, Disposition) {
    let entity_id = job.entity.id.clone();
    let started = Instant::now();
    let evaluator = match job.partial {
        Some(partial) => EntityEvaluator::resume(ctx, job.entity, partial),
        None => EntityEvaluator::new(ctx, job.entity),
    };

    let run = tokio::spawn(
        async move { evaluator.run(&*sink, &cancel).await }.in_current_span(),
    );

    let (disposition, result) = match run.await {
        Ok(Ok(EvaluationOutcome::Finished(result))) => (Disposition::Completed, result),
        Ok(Ok(EvaluationOutcome::Interrupted(result))) => (Disposition::Cancelled, result),
        Ok(Err(err)) => {
            obs::emit_entity_aborted(&entity_id, &err);
            let reason = err.to_string();
            let mut partial = err.into_partial();
            partial.final_status = Some(FinalStatus::Aborted { reason });
            (Disposition::Aborted, partial)
        }
        Err(join_err) => {
            obs::emit_entity_aborted(&entity_id, &join_err);
            let mut partial = EntityResult::new(entity_id.clone());
            partial.final_status = Some(FinalStatus::Aborted {
                reason: format!("evaluation task failed: {join_err}"),
            });
            (Disposition::Aborted, partial)
        }
    };

    match disposition {
        Disposition::Aborted => METRICS.inc_entities_aborted(),
        _ => METRICS.inc_entities_finished(),
    }
    obs::emit_entity_finished(
        &entity_id,
        &format!("{disposition:?}").to_lowercase(),
        started.elapsed().as_millis() as u64,
    );

    // A dropped receiver only means nobody is listening any more.
    let _ = results.send(result);
    (entity_id, disposition)
}

/// Resolves once cancellation is requested; never resolves if the sender
/// is dropped without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let sender_dropped = cancel.wait_for(|c| *c).await.is_err();
    if sender_dropped {
        std::future::pending::<()>().await;
    }
}

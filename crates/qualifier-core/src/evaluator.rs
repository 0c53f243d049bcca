//! Per-entity evaluation state machine.
//!
//! ```text
//! General -> Qualification -> { Mandatory(aud) -> Excluded
//!                             |                -> NiceToHave(aud) -> Scored }* -> Done
//! ```
//!
//! The next step is always derived from the partial [`EntityResult`], so an
//! evaluator built from a checkpointed result continues from the first
//! unreached stage. A checkpoint is written after every step; cancellation
//! is observed before every step, never in the middle of one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::config::ScreeningConfig;
use crate::domain::{
    AudienceOutcome, AudiencePhase, CriteriaSet, Criterion, CriterionVerdict, Entity,
    EntityResult, EvaluationError, EvaluationStage, FailureKind, FinalStatus, GeneralStatus,
    NiceToHaveOutcome, SessionResult, SourceSelector, Stage, Verdict, VerdictCounts,
};
use crate::remote::{
    call_with_controls, ClassificationService, ClassifyRequest, InformationSource,
    QualificationRequest, RetryPolicy, SourceLocator,
};

/// Everything an evaluator needs besides its entity. Shared by all
/// evaluators of a batch.
#[derive(Clone)]
pub struct EvaluationContext {
    pub criteria: Arc<CriteriaSet>,
    pub classifier: Arc<dyn ClassificationService>,
    pub source: Arc<dyn InformationSource>,
    pub breaker: Arc<CircuitBreaker>,
    pub retry: RetryPolicy,
    /// Bounds concurrent information-source fetches across the batch.
    pub fetch_limit: Arc<Semaphore>,
    pub search_for_mandatory: bool,
}

impl EvaluationContext {
    pub fn new(
        criteria: Arc<CriteriaSet>,
        classifier: Arc<dyn ClassificationService>,
        source: Arc<dyn InformationSource>,
        breaker: Arc<CircuitBreaker>,
        config: &ScreeningConfig,
    ) -> Self {
        Self {
            criteria,
            classifier,
            source,
            breaker,
            retry: config.retry.clone(),
            fetch_limit: Arc::new(Semaphore::new(config.max_concurrent_fetches)),
            search_for_mandatory: config.search_for_mandatory,
        }
    }
}

/// Receives the partial result at every stage boundary.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn checkpoint(&self, stage: &EvaluationStage, result: &EntityResult)
        -> SessionResult<()>;
}

/// How an evaluation run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// The entity reached a terminal status.
    Finished(EntityResult),
    /// Cancellation was observed at a stage boundary.
    Interrupted(EntityResult),
}

impl EvaluationOutcome {
    pub fn result(&self) -> &EntityResult {
        match self {
            EvaluationOutcome::Finished(r) | EvaluationOutcome::Interrupted(r) => r,
        }
    }

    pub fn into_result(self) -> EntityResult {
        match self {
            EvaluationOutcome::Finished(r) | EvaluationOutcome::Interrupted(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    General,
    Qualification,
    Mandatory(String),
    NiceToHave(String),
}

pub struct EntityEvaluator {
    ctx: Arc<EvaluationContext>,
    entity: Entity,
    result: EntityResult,
}

impl EntityEvaluator {
    /// Start a fresh evaluation.
    pub fn new(ctx: Arc<EvaluationContext>, entity: Entity) -> Self {
        let result = EntityResult::new(entity.id.clone());
        Self {
            ctx,
            entity,
            result,
        }
    }

    /// Continue from a checkpointed partial result.
    pub fn resume(ctx: Arc<EvaluationContext>, entity: Entity, partial: EntityResult) -> Self {
        Self {
            ctx,
            entity,
            result: partial,
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn result(&self) -> &EntityResult {
        &self.result
    }

    /// Drive the entity to a terminal status or until cancelled.
    pub async fn run(
        mut self,
        sink: &dyn CheckpointSink,
        cancel: &watch::Receiver<bool>,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        if self.settle() {
            self.persist(sink, &EvaluationStage::Finalized).await?;
        }

        while let Some(step) = self.next_step() {
            if *cancel.borrow() {
                debug!(entity_id = %self.entity.id, "cancelled at stage boundary");
                return Ok(EvaluationOutcome::Interrupted(self.result));
            }
            let stage = self.execute(step).await;
            self.settle();
            self.persist(sink, &stage).await?;
        }

        Ok(EvaluationOutcome::Finished(self.result))
    }

    async fn persist(
        &self,
        sink: &dyn CheckpointSink,
        stage: &EvaluationStage,
    ) -> Result<(), EvaluationError> {
        match sink.checkpoint(stage, &self.result).await {
            Ok(()) => Ok(()),
            Err(source) => Err(EvaluationError::Checkpoint {
                entity_id: self.entity.id.clone(),
                partial: Box::new(self.result.clone()),
                source,
            }),
        }
    }

    fn next_step(&self) -> Option<Step> {
        if self.result.is_terminal() {
            return None;
        }
        if self.result.general_status.is_none() {
            return Some(Step::General);
        }
        if self.result.qualification.is_none() {
            return Some(Step::Qualification);
        }
        self.ctx.criteria.audiences().iter().find_map(|audience| {
            match self.result.audience_outcomes.get(audience)?.phase {
                AudiencePhase::Mandatory => Some(Step::Mandatory(audience.clone())),
                AudiencePhase::NiceToHave => Some(Step::NiceToHave(audience.clone())),
                AudiencePhase::Excluded | AudiencePhase::Scored => None,
            }
        })
    }

    /// Derive the final status when nothing is left to evaluate.
    /// Returns `true` if it changed.
    fn settle(&mut self) -> bool {
        if self.result.is_terminal() {
            return false;
        }
        let status = if self.result.general_status == Some(GeneralStatus::Failed) {
            FinalStatus::FailedGeneral
        } else if self.result.qualification.is_none() {
            return false;
        } else if self.result.audience_outcomes.is_empty() {
            FinalStatus::NotQualifiedAny
        } else if self
            .result
            .audience_outcomes
            .values()
            .all(|o| o.phase.is_done())
        {
            FinalStatus::Completed
        } else {
            return false;
        };
        self.result.final_status = Some(status);
        true
    }

    async fn execute(&mut self, step: Step) -> EvaluationStage {
        match step {
            Step::General => {
                self.run_general().await;
                EvaluationStage::General
            }
            Step::Qualification => {
                self.run_qualification().await;
                EvaluationStage::Qualification
            }
            Step::Mandatory(audience) => {
                self.run_mandatory(&audience).await;
                EvaluationStage::Mandatory { audience }
            }
            Step::NiceToHave(audience) => {
                self.run_nice_to_have(&audience).await;
                EvaluationStage::NiceToHave { audience }
            }
        }
    }

    async fn run_general(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        let general = ctx.criteria.general();
        let mut verdicts = Vec::with_capacity(general.len());
        let mut status = if general.is_empty() {
            GeneralStatus::Skipped
        } else {
            GeneralStatus::Passed
        };

        for criterion in general {
            let verdict = self.evaluate(criterion).await;
            let failed = verdict.verdict == Verdict::NotPassed;
            verdicts.push(verdict);
            if failed {
                status = GeneralStatus::Failed;
                break;
            }
        }

        debug!(entity_id = %self.entity.id, status = ?status, "general stage done");
        self.result.general_status = Some(status);
        self.result.general_verdicts = verdicts;
    }

    async fn run_qualification(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        let questions: Vec<(String, String)> = ctx
            .criteria
            .qualification()
            .into_iter()
            .filter_map(|c| Some((c.audience.clone()?, c.text.clone())))
            .collect();

        let mut qualification: BTreeMap<String, bool> =
            questions.iter().map(|(a, _)| (a.clone(), false)).collect();

        if !questions.is_empty() {
            if self.entity.description.trim().is_empty() {
                self.result.qualification_error =
                    Some("entity has no description to qualify against".into());
            } else {
                let request = QualificationRequest {
                    entity_id: self.entity.id.clone(),
                    context: self.entity.description.clone(),
                    questions,
                };
                let classifier = &*ctx.classifier;
                let request = &request;
                match call_with_controls(&ctx.breaker, &ctx.retry, move || {
                    classifier.qualify(request)
                })
                .await
                {
                    Ok(answers) => {
                        for (audience, qualified) in qualification.iter_mut() {
                            *qualified = answers.get(audience).copied().unwrap_or(false);
                        }
                    }
                    Err(failure) => {
                        tracing::warn!(
                            entity_id = %self.entity.id,
                            error = %failure,
                            "qualification failed; no audience qualifies"
                        );
                        self.result.qualification_error = Some(failure.to_string());
                    }
                }
            }
        }

        for (audience, _) in qualification.iter().filter(|(_, q)| **q) {
            self.result
                .audience_outcomes
                .insert(audience.clone(), AudienceOutcome::qualified(audience.clone()));
        }
        debug!(
            entity_id = %self.entity.id,
            qualified = self.result.audience_outcomes.len(),
            "qualification stage done"
        );
        self.result.qualification = Some(qualification);
    }

    async fn run_mandatory(&mut self, audience: &str) {
        let ctx = Arc::clone(&self.ctx);
        let mut verdicts = Vec::new();
        let mut excluded = false;

        for criterion in ctx.criteria.mandatory(audience) {
            let verdict = self.evaluate(criterion).await;
            let stop = verdict.verdict == Verdict::NotPassed;
            verdicts.push(verdict);
            if stop {
                excluded = true;
                break;
            }
        }

        debug!(entity_id = %self.entity.id, audience, excluded, "mandatory stage done");
        if let Some(outcome) = self.result.audience_outcomes.get_mut(audience) {
            outcome.mandatory_counts = VerdictCounts::from_verdicts(&verdicts);
            outcome.mandatory_verdicts = verdicts;
            outcome.excluded = excluded;
            outcome.phase = if excluded {
                AudiencePhase::Excluded
            } else {
                AudiencePhase::NiceToHave
            };
        }
    }

    async fn run_nice_to_have(&mut self, audience: &str) {
        let ctx = Arc::clone(&self.ctx);
        let mut verdicts = Vec::new();
        for criterion in ctx.criteria.nice_to_have(audience) {
            verdicts.push(self.evaluate(criterion).await);
        }

        let nth = NiceToHaveOutcome::from_verdicts(verdicts);
        debug!(entity_id = %self.entity.id, audience, score = nth.score, "nice-to-have stage done");
        if let Some(outcome) = self.result.audience_outcomes.get_mut(audience) {
            outcome.nice_to_have = Some(nth);
            outcome.phase = AudiencePhase::Scored;
        }
    }

    /// Evaluate one criterion. Never fails: problems become an `Error` verdict.
    async fn evaluate(&self, criterion: &Criterion) -> CriterionVerdict {
        if criterion.text.trim().is_empty() {
            return CriterionVerdict::failed(&criterion.id, FailureKind::Data, "criterion has no text");
        }

        let context = match self.context_for(criterion).await {
            Ok(context) => context,
            Err(verdict) => return verdict,
        };
        if context.trim().is_empty() {
            return CriterionVerdict::failed(
                &criterion.id,
                FailureKind::Data,
                "no context text available",
            );
        }

        let request = ClassifyRequest {
            entity_id: self.entity.id.clone(),
            criterion_id: criterion.id.clone(),
            stage: criterion.stage,
            context,
            question: criterion.text.clone(),
        };
        let classifier = &*self.ctx.classifier;
        let request = &request;
        let verdict = match call_with_controls(&self.ctx.breaker, &self.ctx.retry, move || {
            classifier.classify(request)
        })
        .await
        {
            Ok(answer) => CriterionVerdict::answered(&criterion.id, answer),
            Err(failure) => CriterionVerdict::failed(&criterion.id, failure.kind, failure.message),
        };
        debug!(
            entity_id = %self.entity.id,
            criterion_id = %criterion.id,
            verdict = ?verdict.verdict,
            "criterion evaluated"
        );
        verdict
    }

    async fn context_for(&self, criterion: &Criterion) -> Result<String, CriterionVerdict> {
        let selector = match criterion.source {
            SourceSelector::Description
                if criterion.stage == Stage::Mandatory && self.ctx.search_for_mandatory =>
            {
                SourceSelector::WebSearch
            }
            other => other,
        };
        if selector == SourceSelector::Description {
            return Ok(self.entity.description.clone());
        }

        let source_failure =
            |message: String| CriterionVerdict::failed(&criterion.id, FailureKind::Source, message);
        let _permit = self
            .ctx
            .fetch_limit
            .acquire()
            .await
            .map_err(|e| source_failure(e.to_string()))?;
        let locator = SourceLocator {
            selector,
            query: criterion.search_query.clone(),
        };
        self.ctx
            .source
            .fetch(&self.entity, &locator)
            .await
            .map_err(|e| source_failure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Answer;
    use crate::fakes::{RecordingSink, ScriptedClassifier, StaticSource};
    use crate::remote::ClassifyError;

    fn criteria() -> CriteriaSet {
        CriteriaSet::new(
            "v1",
            vec![
                Criterion::new("g", Stage::General, None, "Is a company"),
                Criterion::new("q", Stage::Qualification, Some("Gaming"), "Makes games?"),
                Criterion::new("a", Stage::Mandatory, Some("Gaming"), "A"),
                Criterion::new("b", Stage::Mandatory, Some("Gaming"), "B"),
                Criterion::new("c", Stage::Mandatory, Some("Gaming"), "C"),
                Criterion::new("n", Stage::NiceToHave, Some("Gaming"), "N"),
            ],
        )
        .unwrap()
    }

    fn context(classifier: ScriptedClassifier) -> Arc<EvaluationContext> {
        context_with(classifier, Arc::new(StaticSource::new("search results")))
    }

    fn context_with(classifier: ScriptedClassifier, source: Arc<StaticSource>) -> Arc<EvaluationContext> {
        let config = ScreeningConfig {
            retry: RetryPolicy {
                transport_delay_ms: 1,
                rate_limit_base_delay_ms: 1,
                ..RetryPolicy::default()
            },
            ..ScreeningConfig::default()
        };
        Arc::new(EvaluationContext::new(
            Arc::new(criteria()),
            Arc::new(classifier),
            source,
            Arc::new(CircuitBreaker::new(config.breaker.clone())),
            &config,
        ))
    }

    fn entity() -> Entity {
        Entity::new("acme", "Acme", "Acme builds multiplayer games")
    }

    #[tokio::test]
    async fn general_not_passed_is_terminal() {
        let classifier = ScriptedClassifier::new(Answer::Passed).answer("acme", "g", Answer::NotPassed);
        let ctx = context(classifier);
        let sink = RecordingSink::default();
        let (_tx, rx) = watch::channel(false);

        let outcome = EntityEvaluator::new(ctx, entity()).run(&sink, &rx).await.unwrap();
        let result = outcome.into_result();

        assert_eq!(result.final_status, Some(FinalStatus::FailedGeneral));
        assert!(result.qualification.is_none());
        assert_eq!(sink.stages(), vec!["general".to_string()]);
    }

    #[tokio::test]
    async fn mandatory_source_escalates_to_search() {
        let source = Arc::new(StaticSource::new("search results"));
        let ctx = context_with(ScriptedClassifier::new(Answer::Passed), source.clone());
        let sink = RecordingSink::default();
        let (_tx, rx) = watch::channel(false);

        EntityEvaluator::new(ctx, entity()).run(&sink, &rx).await.unwrap();

        assert_eq!(
            sink.stages(),
            vec!["general", "qualification", "mandatory:Gaming", "nice_to_have:Gaming"]
        );
        let fetches = source.fetches();
        assert_eq!(fetches.len(), 3);
        assert!(fetches
            .iter()
            .all(|(entity_id, selector)| entity_id == "acme" && *selector == SourceSelector::WebSearch));
    }

    #[tokio::test]
    async fn qualification_error_disqualifies_every_audience() {
        let classifier = ScriptedClassifier::new(Answer::Passed)
            .fail_qualification("acme", ClassifyError::InvalidInput("bad".into()));
        let ctx = context(classifier);
        let sink = RecordingSink::default();
        let (_tx, rx) = watch::channel(false);

        let result = EntityEvaluator::new(ctx, entity())
            .run(&sink, &rx)
            .await
            .unwrap()
            .into_result();

        assert_eq!(result.final_status, Some(FinalStatus::NotQualifiedAny));
        assert_eq!(result.qualification.as_ref().unwrap().get("Gaming"), Some(&false));
        assert!(result.qualification_error.unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_stage() {
        let classifier = ScriptedClassifier::new(Answer::Passed);
        let ctx = context(classifier);
        let sink = RecordingSink::default();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let outcome = EntityEvaluator::new(ctx, entity()).run(&sink, &rx).await.unwrap();
        assert!(matches!(outcome, EvaluationOutcome::Interrupted(_)));
        assert!(sink.stages().is_empty());
    }

    #[tokio::test]
    async fn sink_failure_aborts_with_partial_result() {
        let classifier = ScriptedClassifier::new(Answer::Passed);
        let ctx = context(classifier);
        let sink = RecordingSink::failing_after(1);
        let (_tx, rx) = watch::channel(false);

        let err = EntityEvaluator::new(ctx, entity())
            .run(&sink, &rx)
            .await
            .unwrap_err();
        let partial = err.into_partial();
        assert_eq!(partial.general_status, Some(GeneralStatus::Passed));
        assert!(partial.qualification.is_some());
        assert!(!partial.is_terminal());
    }

    #[tokio::test]
    async fn unsettled_terminal_partial_is_finalized() {
        let ctx = context(ScriptedClassifier::new(Answer::Passed));
        let sink = RecordingSink::default();
        let (_tx, rx) = watch::channel(false);

        let mut partial = EntityResult::new("acme");
        partial.general_status = Some(GeneralStatus::Passed);
        partial.qualification = Some(BTreeMap::from([("Gaming".to_string(), false)]));

        let result = EntityEvaluator::resume(ctx, entity(), partial)
            .run(&sink, &rx)
            .await
            .unwrap()
            .into_result();
        assert_eq!(result.final_status, Some(FinalStatus::NotQualifiedAny));
        assert_eq!(sink.stages(), vec!["finalized".to_string()]);
    }
}

//! Scripted fakes for the remote collaborators and the checkpoint sink
//! (testing only).
//!
//! - `ScriptedClassifier`: answers per `(entity, criterion)`, call log,
//!   in-flight gauge, optional latency
//! - `StaticSource`: fixed context text, per-selector failures
//! - `RecordingSink`: keeps every checkpoint, optional injected failure

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use qualifier_store::StorageError;

use crate::domain::{Answer, Entity, EntityResult, EvaluationStage, SessionError, SessionResult, SourceSelector};
use crate::evaluator::CheckpointSink;
use crate::remote::{
    ClassificationService, ClassifyError, ClassifyRequest, InformationSource,
    QualificationRequest, SourceError, SourceLocator,
};

/// Tracks concurrent calls and the high-water mark.
#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) -> GaugeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self)
    }
}

struct GaugeGuard<'a>(&'a Gauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

type Key = (String, String);

/// Deterministic stand-in for the remote classification service.
#[derive(Debug)]
pub struct ScriptedClassifier {
    default_answer: Answer,
    fixed: Mutex<HashMap<Key, Answer>>,
    scripts: Mutex<HashMap<Key, VecDeque<Result<Answer, ClassifyError>>>>,
    qualifications: Mutex<HashMap<String, BTreeMap<String, bool>>>,
    qualify_errors: Mutex<HashMap<String, ClassifyError>>,
    latency: Option<Duration>,
    calls: Mutex<Vec<Key>>,
    qualify_calls: Mutex<Vec<String>>,
    gauge: Gauge,
}

impl ScriptedClassifier {
    /// Every unscripted question gets `default_answer`; every audience qualifies.
    pub fn new(default_answer: Answer) -> Self {
        Self {
            default_answer,
            fixed: Mutex::default(),
            scripts: Mutex::default(),
            qualifications: Mutex::default(),
            qualify_errors: Mutex::default(),
            latency: None,
            calls: Mutex::default(),
            qualify_calls: Mutex::default(),
            gauge: Gauge::default(),
        }
    }

    /// Always answer `answer` for this entity and criterion.
    pub fn answer(self, entity_id: &str, criterion_id: &str, answer: Answer) -> Self {
        self.fixed
            .lock()
            .unwrap()
            .insert((entity_id.to_string(), criterion_id.to_string()), answer);
        self
    }

    /// Play `outcomes` in order on successive calls, then fall back to the
    /// fixed or default answer.
    pub fn script(
        self,
        entity_id: &str,
        criterion_id: &str,
        outcomes: Vec<Result<Answer, ClassifyError>>,
    ) -> Self {
        self.scripts.lock().unwrap().insert(
            (entity_id.to_string(), criterion_id.to_string()),
            outcomes.into(),
        );
        self
    }

    /// Qualification answers for one entity; unlisted audiences do not qualify.
    pub fn qualify_as(self, entity_id: &str, audiences: &[(&str, bool)]) -> Self {
        self.qualifications.lock().unwrap().insert(
            entity_id.to_string(),
            audiences
                .iter()
                .map(|(a, q)| (a.to_string(), *q))
                .collect(),
        );
        self
    }

    pub fn fail_qualification(self, entity_id: &str, err: ClassifyError) -> Self {
        self.qualify_errors
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), err);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// `(entity_id, criterion_id)` of every classify call, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Criterion ids asked about one entity, in call order.
    pub fn calls_for(&self, entity_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == entity_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn qualify_calls(&self) -> Vec<String> {
        self.qualify_calls.lock().unwrap().clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.gauge.max.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ClassificationService for ScriptedClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Answer, ClassifyError> {
        let key = (request.entity_id.clone(), request.criterion_id.clone());
        self.calls.lock().unwrap().push(key.clone());
        let _guard = self.gauge.enter();
        self.delay().await;

        if let Some(outcome) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        let fixed = self.fixed.lock().unwrap().get(&key).copied();
        Ok(fixed.unwrap_or(self.default_answer))
    }

    async fn qualify(
        &self,
        request: &QualificationRequest,
    ) -> Result<BTreeMap<String, bool>, ClassifyError> {
        self.qualify_calls
            .lock()
            .unwrap()
            .push(request.entity_id.clone());
        let _guard = self.gauge.enter();
        self.delay().await;

        if let Some(err) = self.qualify_errors.lock().unwrap().get(&request.entity_id) {
            return Err(err.clone());
        }
        if let Some(answers) = self.qualifications.lock().unwrap().get(&request.entity_id) {
            return Ok(answers.clone());
        }
        Ok(request
            .questions
            .iter()
            .map(|(audience, _)| (audience.clone(), true))
            .collect())
    }
}

/// Information source returning the same text for every request.
#[derive(Debug)]
pub struct StaticSource {
    text: String,
    failing: Mutex<HashSet<SourceSelector>>,
    fetches: Mutex<Vec<(String, SourceSelector)>>,
    latency: Option<Duration>,
    gauge: Gauge,
}

impl StaticSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            failing: Mutex::default(),
            fetches: Mutex::default(),
            latency: None,
            gauge: Gauge::default(),
        }
    }

    pub fn fail_for(self, selector: SourceSelector) -> Self {
        self.failing.lock().unwrap().insert(selector);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// `(entity_id, selector)` of every fetch, in call order.
    pub fn fetches(&self) -> Vec<(String, SourceSelector)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.gauge.max.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InformationSource for StaticSource {
    async fn fetch(&self, entity: &Entity, locator: &SourceLocator) -> Result<String, SourceError> {
        self.fetches
            .lock()
            .unwrap()
            .push((entity.id.clone(), locator.selector));
        let _guard = self.gauge.enter();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.failing.lock().unwrap().contains(&locator.selector) {
            return Err(SourceError::Unavailable {
                selector: locator.selector,
                message: "provider returned 503".into(),
            });
        }
        Ok(self.text.clone())
    }
}

/// Checkpoint sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<(EvaluationStage, EntityResult)>>,
    fail_after: Option<usize>,
}

impl RecordingSink {
    /// Accept `n` checkpoints, then fail every later one.
    pub fn failing_after(n: usize) -> Self {
        Self {
            records: Mutex::default(),
            fail_after: Some(n),
        }
    }

    pub fn records(&self) -> Vec<(EvaluationStage, EntityResult)> {
        self.records.lock().unwrap().clone()
    }

    /// Stage labels in checkpoint order.
    pub fn stages(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(stage, _)| stage.to_string())
            .collect()
    }
}

#[async_trait]
impl CheckpointSink for RecordingSink {
    async fn checkpoint(
        &self,
        stage: &EvaluationStage,
        result: &EntityResult,
    ) -> SessionResult<()> {
        let mut records = self.records.lock().unwrap();
        if self.fail_after.is_some_and(|n| records.len() >= n) {
            return Err(SessionError::Storage(StorageError::Backend(
                "injected checkpoint failure".into(),
            )));
        }
        records.push((stage.clone(), result.clone()));
        Ok(())
    }
}

//! Qualifier Core Library
//!
//! Resilient concurrent screening of companies against a hierarchy of
//! business criteria (general, qualification, mandatory, nice-to-have),
//! where every criterion is answered by a slow, rate-limited remote
//! classifier.
//!
//! - `breaker`: circuit breaker shared by every evaluator of a credential
//! - `evaluator`: per-entity stage machine with short-circuit semantics
//! - `scheduler`: bounded-concurrency driver with cooperative cancellation
//! - `session`: resumable sessions over a `qualifier_store::CheckpointStore`
//! - `service`: submit / resume / cancel / inspect batches

pub mod breaker;
pub mod config;
pub mod domain;
pub mod evaluator;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod telemetry;

pub use breaker::{Admission, BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState, Clock, ManualClock, SystemClock};

pub use config::{ConfigError, ScreeningConfig};

pub use domain::{
    Answer, AudienceOutcome, AudiencePhase, CriteriaError, CriteriaSet, Criterion,
    CriterionVerdict, Entity, EntityResult, EvaluationError, EvaluationStage, FailureKind,
    FinalStatus, GeneralStatus, NiceToHaveOutcome, NotResumableReason, SessionError,
    SourceSelector, Stage, Verdict, VerdictCounts,
};

pub use evaluator::{CheckpointSink, EntityEvaluator, EvaluationContext, EvaluationOutcome};

pub use remote::{
    call_with_controls, CallFailure, ClassificationService, ClassifyError, ClassifyRequest,
    InformationSource, QualificationRequest, RetryPolicy, SourceError, SourceLocator,
};

pub use scheduler::{BatchReport, EntityJob, Scheduler};

pub use service::{BatchHandle, BatchSummary, ScreeningError, ScreeningResult, ScreeningService};

pub use session::{
    EntityProgress, Progress, ResumePlan, SessionManager, SessionStatusReport, SessionSummary,
    SessionWriter,
};

pub use qualifier_store::{SessionId, SessionStatus};

//! Domain models for Qualifier.
//!
//! Canonical definitions for the core entities:
//! - `Criterion` / `CriteriaSet`: immutable criterion hierarchy loaded once per batch
//! - `Entity`: the company being screened
//! - `Verdict` / `CriterionVerdict`: tri-state remote answers plus local errors
//! - `EntityResult` / `AudienceOutcome`: typed per-entity evaluation record

pub mod criterion;
pub mod entity;
pub mod error;
pub mod result;
pub mod verdict;

// Re-export main types and errors
pub use criterion::{CriteriaSet, Criterion, SourceSelector, Stage};
pub use entity::Entity;
pub use error::{
    CriteriaError, CriteriaResult, EvaluationError, NotResumableReason, SessionError,
    SessionResult,
};
pub use result::{
    AudienceOutcome, AudiencePhase, EntityResult, EvaluationStage, FinalStatus, GeneralStatus,
    NiceToHaveOutcome,
};
pub use verdict::{Answer, CriterionVerdict, Failure, FailureKind, Verdict, VerdictCounts};

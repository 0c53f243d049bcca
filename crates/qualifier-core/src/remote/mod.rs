//! Remote collaborators and the guarded call path in front of them.
//!
//! - [`ClassificationService`]: one remote question per criterion, plus a
//!   batched per-audience qualification question set
//! - [`InformationSource`]: opaque, possibly slow text provider
//! - [`controls::call_with_controls`]: breaker gate, timeout and retry

pub mod controls;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::{Answer, Entity, FailureKind, SourceSelector, Stage};

pub use controls::{call_with_controls, CallFailure, RetryPolicy};

/// Failure of a single remote classification call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifyError {
    /// The service signalled throttling.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The request itself is unusable; retrying cannot help.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ClassifyError {
    /// Failure kind for a non-rate-limit error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ClassifyError::RateLimited { .. } => FailureKind::RateLimited,
            ClassifyError::InvalidInput(_) => FailureKind::Data,
            ClassifyError::Transport(_)
            | ClassifyError::Timeout { .. }
            | ClassifyError::MalformedResponse(_) => FailureKind::Transport,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClassifyError::InvalidInput(_))
    }
}

/// One criterion question about one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyRequest {
    pub entity_id: String,
    pub criterion_id: String,
    pub stage: Stage,
    /// Context text supplied by the information source
    pub context: String,
    pub question: String,
}

/// One batched qualification question set: one question per audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualificationRequest {
    pub entity_id: String,
    pub context: String,
    /// `(audience, question)` in audience order
    pub questions: Vec<(String, String)>,
}

/// Remote classification service (an LLM behind an API).
///
/// The concurrency strategy of an implementation is fixed when it is
/// constructed; callers never switch strategies mid-run.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Answer, ClassifyError>;

    /// Answer every qualification question at once. Audiences missing
    /// from the returned map count as not qualified.
    async fn qualify(
        &self,
        request: &QualificationRequest,
    ) -> Result<BTreeMap<String, bool>, ClassifyError>;
}

/// Failure of the information source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("entity {entity_id} has no website")]
    NoWebsite { entity_id: String },

    #[error("{selector:?} source unavailable: {message}")]
    Unavailable {
        selector: SourceSelector,
        message: String,
    },
}

/// Where to fetch context from for one criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocator {
    pub selector: SourceSelector,
    pub query: Option<String>,
}

/// Supplier of context text for non-description criteria.
#[async_trait]
pub trait InformationSource: Send + Sync {
    async fn fetch(&self, entity: &Entity, locator: &SourceLocator) -> Result<String, SourceError>;
}

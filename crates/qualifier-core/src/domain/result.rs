//! Typed per-entity evaluation records.
//!
//! An `EntityResult` is owned by the evaluator producing it and is only
//! published (checkpointed) at stage boundaries. Because the record itself
//! says which stages are done, a partial result is all that is needed to
//! resume an evaluation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::verdict::{CriterionVerdict, VerdictCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneralStatus {
    Passed,
    /// No general criteria configured; treated as a pass.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinalStatus {
    /// A general criterion was `NotPassed`.
    FailedGeneral,
    /// No audience qualified.
    NotQualifiedAny,
    /// Every qualified audience is either excluded or scored.
    Completed,
    /// Entity-level unrecoverable error (e.g. checkpoint write failure).
    Aborted { reason: String },
}

/// Progress of one qualified audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudiencePhase {
    /// Mandatory criteria not yet evaluated.
    Mandatory,
    /// A mandatory criterion was `NotPassed`; nice-to-have is skipped.
    Excluded,
    /// Mandatory passed; nice-to-have not yet evaluated.
    NiceToHave,
    /// Nice-to-have evaluated and scored.
    Scored,
}

impl AudiencePhase {
    pub fn is_done(self) -> bool {
        matches!(self, AudiencePhase::Excluded | AudiencePhase::Scored)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NiceToHaveOutcome {
    pub verdicts: Vec<CriterionVerdict>,
    pub counts: VerdictCounts,
    /// `passed / total`, in `[0, 1]`
    pub score: f64,
    pub indeterminate_rate: f64,
}

impl NiceToHaveOutcome {
    pub fn from_verdicts(verdicts: Vec<CriterionVerdict>) -> Self {
        let counts = VerdictCounts::from_verdicts(&verdicts);
        Self {
            score: counts.pass_rate(),
            indeterminate_rate: counts.indeterminate_rate(),
            counts,
            verdicts,
        }
    }
}

/// Outcome for one audience the entity qualified for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudienceOutcome {
    pub audience: String,
    pub qualified: bool,
    pub phase: AudiencePhase,
    /// Mandatory verdicts in evaluation order; stops at the first `NotPassed`.
    pub mandatory_verdicts: Vec<CriterionVerdict>,
    pub mandatory_counts: VerdictCounts,
    pub excluded: bool,
    /// Present once the audience is scored; never present when excluded.
    pub nice_to_have: Option<NiceToHaveOutcome>,
}

impl AudienceOutcome {
    pub fn qualified(audience: impl Into<String>) -> Self {
        Self {
            audience: audience.into(),
            qualified: true,
            phase: AudiencePhase::Mandatory,
            mandatory_verdicts: Vec::new(),
            mandatory_counts: VerdictCounts::default(),
            excluded: false,
            nice_to_have: None,
        }
    }

    pub fn mandatory_indeterminate_rate(&self) -> f64 {
        self.mandatory_counts.indeterminate_rate()
    }

    pub fn nice_to_have_score(&self) -> Option<f64> {
        self.nice_to_have.as_ref().map(|n| n.score)
    }
}

/// Stage boundary at which a checkpoint is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum EvaluationStage {
    General,
    Qualification,
    Mandatory { audience: String },
    NiceToHave { audience: String },
    /// Bookkeeping step that closes an entity with nothing left to evaluate.
    Finalized,
}

impl std::fmt::Display for EvaluationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationStage::General => f.write_str("general"),
            EvaluationStage::Qualification => f.write_str("qualification"),
            EvaluationStage::Mandatory { audience } => write!(f, "mandatory:{audience}"),
            EvaluationStage::NiceToHave { audience } => write!(f, "nice_to_have:{audience}"),
            EvaluationStage::Finalized => f.write_str("finalized"),
        }
    }
}

/// Full evaluation record for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResult {
    pub entity_id: String,
    /// `None` until the general stage ran.
    pub general_status: Option<GeneralStatus>,
    pub general_verdicts: Vec<CriterionVerdict>,
    /// Per-audience qualification; `None` until the qualification stage ran.
    pub qualification: Option<BTreeMap<String, bool>>,
    /// Set when the batched qualification call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualification_error: Option<String>,
    /// Outcomes for qualified audiences only.
    pub audience_outcomes: BTreeMap<String, AudienceOutcome>,
    /// `None` while evaluation is in progress.
    pub final_status: Option<FinalStatus>,
}

impl EntityResult {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            general_status: None,
            general_verdicts: Vec::new(),
            qualification: None,
            qualification_error: None,
            audience_outcomes: BTreeMap::new(),
            final_status: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.final_status.is_some()
    }

    /// Audiences the entity qualified for, in name order.
    pub fn qualified_audiences(&self) -> Vec<&str> {
        self.qualification
            .iter()
            .flatten()
            .filter(|(_, qualified)| **qualified)
            .map(|(audience, _)| audience.as_str())
            .collect()
    }

    /// Counts of criteria evaluated across all stages, for ND/error statistics.
    pub fn verdict_totals(&self) -> VerdictCounts {
        let mut totals = VerdictCounts::from_verdicts(&self.general_verdicts);
        for outcome in self.audience_outcomes.values() {
            for v in &outcome.mandatory_verdicts {
                totals.record(v.verdict);
            }
            if let Some(nth) = &outcome.nice_to_have {
                for v in &nth.verdicts {
                    totals.record(v.verdict);
                }
            }
        }
        totals
    }
}

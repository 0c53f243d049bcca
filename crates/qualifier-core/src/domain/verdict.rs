//! Verdicts and verdict statistics.

use serde::{Deserialize, Serialize};

/// What the remote classifier can answer for one criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Answer {
    Passed,
    NotPassed,
    /// Insufficient information to decide.
    Indeterminate,
}

/// Outcome of one criterion evaluation.
///
/// `Indeterminate` is a substantive answer ("not enough data"), `Error`
/// means no answer was obtained. Neither one excludes an audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    NotPassed,
    Indeterminate,
    Error,
}

impl From<Answer> for Verdict {
    fn from(answer: Answer) -> Self {
        match answer {
            Answer::Passed => Verdict::Passed,
            Answer::NotPassed => Verdict::NotPassed,
            Answer::Indeterminate => Verdict::Indeterminate,
        }
    }
}

/// Why a criterion ended with `Verdict::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Remote throttling persisted through every retry.
    RateLimited,
    /// Network, timeout or malformed response persisted through every retry.
    Transport,
    /// Rejected locally by the open circuit breaker; no request was sent.
    BreakerOpen,
    /// Malformed entity or criterion input; never retried.
    Data,
    /// The information source could not supply context.
    Source,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

/// Verdict for one criterion, keyed by its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionVerdict {
    pub criterion_id: String,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl CriterionVerdict {
    pub fn answered(criterion_id: impl Into<String>, answer: Answer) -> Self {
        Self {
            criterion_id: criterion_id.into(),
            verdict: answer.into(),
            failure: None,
        }
    }

    pub fn failed(criterion_id: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            criterion_id: criterion_id.into(),
            verdict: Verdict::Error,
            failure: Some(Failure {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Running tally of verdicts for one group of criteria.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub passed: u32,
    pub not_passed: u32,
    pub indeterminate: u32,
    pub errors: u32,
    pub total: u32,
}

impl VerdictCounts {
    pub fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Passed => self.passed += 1,
            Verdict::NotPassed => self.not_passed += 1,
            Verdict::Indeterminate => self.indeterminate += 1,
            Verdict::Error => self.errors += 1,
        }
        self.total += 1;
    }

    pub fn from_verdicts<'a>(verdicts: impl IntoIterator<Item = &'a CriterionVerdict>) -> Self {
        let mut counts = Self::default();
        for v in verdicts {
            counts.record(v.verdict);
        }
        counts
    }

    /// `passed / total`, or 0 when nothing was evaluated.
    pub fn pass_rate(&self) -> f64 {
        ratio(self.passed, self.total)
    }

    /// Share of verdicts without a substantive answer (indeterminate or error).
    pub fn indeterminate_rate(&self) -> f64 {
        ratio(self.indeterminate + self.errors, self.total)
    }
}

fn ratio(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(total)
    }
}

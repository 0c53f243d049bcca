//! Guarded remote calls: breaker gate, per-call timeout, bounded retry.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ClassifyError;
use crate::breaker::CircuitBreaker;
use crate::domain::FailureKind;
use crate::metrics::METRICS;

/// Retry and timeout policy for remote classification calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Rate-limit backoff is `base * 2^attempt`, capped at `rate_limit_max_delay_ms`.
    pub rate_limit_base_delay_ms: u64,
    pub rate_limit_max_delay_ms: u64,
    /// Fixed delay between transport-error retries.
    pub transport_delay_ms: u64,
    /// Independent timeout for each attempt.
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_base_delay_ms: 5_000,
            rate_limit_max_delay_ms: 60_000,
            transport_delay_ms: 2_000,
            call_timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed attempt (0-based) that was rate limited.
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .rate_limit_base_delay_ms
            .saturating_mul(factor)
            .min(self.rate_limit_max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn transport_delay(&self) -> Duration {
        Duration::from_millis(self.transport_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// A guarded call that produced no answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} after {attempts} attempt(s): {message}")]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Requests actually sent (0 when the breaker rejected the first one).
    pub attempts: u32,
}

/// Run `call` through the breaker with timeout and retry.
///
/// The breaker is consulted before every attempt. A rejection ends the call
/// immediately with `FailureKind::BreakerOpen` and does not use up an
/// attempt. Every completed attempt is reported to the breaker, which
/// decides whether the failure is rate-limit-class.
pub async fn call_with_controls<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, CallFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClassifyError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        let Some(admission) = breaker.admit() else {
            METRICS.inc_breaker_rejections();
            return Err(CallFailure {
                kind: FailureKind::BreakerOpen,
                message: "circuit breaker open; request not sent".into(),
                attempts,
            });
        };

        attempts += 1;
        METRICS.inc_remote_calls();
        let outcome = match tokio::time::timeout(policy.call_timeout(), call()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(ClassifyError::Timeout {
                limit_ms: policy.call_timeout_ms,
            }),
        };

        let err = match outcome {
            Ok(value) => {
                breaker.record_success_of(admission);
                return Ok(value);
            }
            Err(err) => err,
        };

        let rate_limited = breaker.record_failure(&err);
        let kind = if rate_limited {
            METRICS.inc_rate_limited();
            FailureKind::RateLimited
        } else {
            err.failure_kind()
        };

        if !err.is_retryable() || attempts >= max_attempts {
            return Err(CallFailure {
                kind,
                message: err.to_string(),
                attempts,
            });
        }

        let delay = if rate_limited {
            policy.rate_limit_delay(attempts - 1)
        } else {
            policy.transport_delay()
        };
        tracing::debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            rate_limited,
            error = %err,
            "retrying remote call"
        );
        METRICS.inc_retries();
        tokio::time::sleep(delay).await;
    }
}

//! Screening configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::remote::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for one screening deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Entities evaluated at once.
    pub max_concurrent_companies: usize,
    /// Concurrent information-source fetches across all entities.
    pub max_concurrent_fetches: usize,
    /// Fetch mandatory criteria sourced from the description via web search.
    pub search_for_mandatory: bool,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            max_concurrent_companies: 12,
            max_concurrent_fetches: 8,
            search_for_mandatory: true,
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ScreeningConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 7] = [
            ("max_concurrent_companies", self.max_concurrent_companies as u64),
            ("max_concurrent_fetches", self.max_concurrent_fetches as u64),
            ("breaker.failure_threshold", u64::from(self.breaker.failure_threshold)),
            ("breaker.success_threshold", u64::from(self.breaker.success_threshold)),
            (
                "breaker.max_half_open_requests",
                u64::from(self.breaker.max_half_open_requests),
            ),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
            ("retry.call_timeout_ms", self.retry.call_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.retry.rate_limit_max_delay_ms < self.retry.rate_limit_base_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.rate_limit_max_delay_ms",
                reason: "must not be below rate_limit_base_delay_ms".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ScreeningConfig::default();
        assert_eq!(cfg.max_concurrent_companies, 12);
        assert_eq!(cfg.max_concurrent_fetches, 8);
        assert!(cfg.search_for_mandatory);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ScreeningConfig =
            serde_json::from_str(r#"{"max_concurrent_companies": 4, "retry": {"max_attempts": 5}}"#)
                .unwrap();
        assert_eq!(cfg.max_concurrent_companies, 4);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.transport_delay_ms, 2_000);
        assert_eq!(cfg.breaker.failure_threshold, 5);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = ScreeningConfig {
            max_concurrent_companies: 0,
            ..ScreeningConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_companies"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screening.json");
        std::fs::write(&path, r#"{"breaker": {"recovery_timeout_secs": 30}}"#).unwrap();
        let cfg = ScreeningConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.breaker.recovery_timeout_secs, 30);

        std::fs::write(&path, r#"{"retry": {"max_attempts": 0}}"#).unwrap();
        assert!(matches!(
            ScreeningConfig::from_json_file(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }
}

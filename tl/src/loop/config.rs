//! Control loop configuration

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::domain::Coverage;

/// How the loop learns which stages to replay after a failed gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    /// Use identifiers returned by `run_pipeline`, scraping the log only
    /// when the pipeline returns none
    #[default]
    Structured,
    /// Always scrape the execution log (legacy)
    Log,
}

/// Limits and thresholds for one session (the `session` config section)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Retry cycles allowed before giving up
    #[serde(rename = "max-iterations", default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Coverage below which a FAIL verdict triggers a retry
    #[serde(
        rename = "coverage-threshold",
        default = "default_coverage_threshold",
        deserialize_with = "threshold_in_range"
    )]
    pub coverage_threshold: u8,

    /// Timeout for each pipeline call in milliseconds
    #[serde(rename = "call-timeout-ms", default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Wall-clock budget for the whole session in milliseconds
    #[serde(rename = "budget-ms", default)]
    pub budget_ms: Option<u64>,

    #[serde(default)]
    pub linkage: Linkage,
}

fn default_max_iterations() -> u32 {
    debug!("default_max_iterations: called");
    5
}

fn default_coverage_threshold() -> u8 {
    debug!("default_coverage_threshold: called");
    90
}

fn default_call_timeout() -> u64 {
    debug!("default_call_timeout: called");
    600_000 // 10 minutes
}

fn threshold_in_range<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let threshold = u8::deserialize(deserializer)?;
    if threshold > Coverage::MAX {
        return Err(serde::de::Error::custom(format!(
            "coverage-threshold {} is above {}",
            threshold,
            Coverage::MAX
        )));
    }
    Ok(threshold)
}

impl Default for LoopConfig {
    fn default() -> Self {
        debug!("LoopConfig::default: called");
        Self {
            max_iterations: default_max_iterations(),
            coverage_threshold: default_coverage_threshold(),
            call_timeout_ms: default_call_timeout(),
            budget_ms: None,
            linkage: Linkage::default(),
        }
    }
}

impl LoopConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_section_uses_defaults() {
        let config: LoopConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.coverage_threshold, 90);
        assert_eq!(config.call_timeout(), Duration::from_secs(600));
        assert_eq!(config.budget(), None);
        assert_eq!(config.linkage, Linkage::Structured);
    }

    #[test]
    fn test_threshold_above_full_coverage_rejected() {
        let err = serde_yaml::from_str::<LoopConfig>("coverage-threshold: 101").unwrap_err();
        assert!(err.to_string().contains("above 100"));
        let config: LoopConfig = serde_yaml::from_str("coverage-threshold: 100").unwrap();
        assert_eq!(config.coverage_threshold, 100);
    }

    #[test]
    fn test_threshold_out_of_u8_rejected() {
        assert!(serde_yaml::from_str::<LoopConfig>("coverage-threshold: 300").is_err());
    }
}

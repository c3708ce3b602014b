//! Quality gate
//!
//! Retries only when both signals agree the artifact is weak: coverage
//! under the threshold AND a FAIL verdict. Either signal alone accepts.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Coverage, Verdict};

/// Outcome of a gate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDecision {
    Accept,
    Retry,
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "ACCEPT"),
            Self::Retry => write!(f, "RETRY"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityGate {
    threshold: u8,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl QualityGate {
    pub const DEFAULT_THRESHOLD: u8 = 90;

    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn decide(&self, coverage: Coverage, verdict: Verdict) -> GateDecision {
        let decision = if coverage.value() < self.threshold && verdict == Verdict::Fail {
            GateDecision::Retry
        } else {
            GateDecision::Accept
        };
        debug!(%coverage, %verdict, threshold = self.threshold, %decision, "QualityGate::decide: called");
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cov(v: i64) -> Coverage {
        Coverage::new(v).unwrap()
    }

    #[test]
    fn test_boundaries() {
        let gate = QualityGate::default();
        assert_eq!(gate.decide(cov(89), Verdict::Fail), GateDecision::Retry);
        assert_eq!(gate.decide(cov(90), Verdict::Fail), GateDecision::Accept);
        assert_eq!(gate.decide(cov(0), Verdict::Pass), GateDecision::Accept);
        assert_eq!(gate.decide(cov(100), Verdict::Pass), GateDecision::Accept);
    }

    #[test]
    fn test_custom_threshold() {
        let gate = QualityGate::new(70);
        assert_eq!(gate.decide(cov(69), Verdict::Fail), GateDecision::Retry);
        assert_eq!(gate.decide(cov(75), Verdict::Fail), GateDecision::Accept);
    }

    proptest! {
        #[test]
        fn prop_low_coverage_fail_retries(c in 0i64..90) {
            prop_assert_eq!(QualityGate::default().decide(cov(c), Verdict::Fail), GateDecision::Retry);
        }

        #[test]
        fn prop_high_coverage_accepts(c in 90i64..=100, pass in any::<bool>()) {
            let verdict = if pass { Verdict::Pass } else { Verdict::Fail };
            prop_assert_eq!(QualityGate::default().decide(cov(c), verdict), GateDecision::Accept);
        }

        #[test]
        fn prop_pass_always_accepts(c in 0i64..=100, threshold in 0u8..=100) {
            prop_assert_eq!(QualityGate::new(threshold).decide(cov(c), Verdict::Pass), GateDecision::Accept);
        }
    }
}

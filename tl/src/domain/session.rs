//! Session state and evaluator contract types
//!
//! The pipeline reports evaluation results in their raw wire shape
//! ([`EvaluationReport`]). The control loop validates them into an
//! [`Evaluation`] before anything touches [`SessionState`]; out-of-range
//! coverage or an unknown verdict is a [`ContractError`], never clamped.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::StageId;

/// Violations of the evaluator's output contract
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("Coverage {0} is outside 0..=100")]
    CoverageOutOfRange(i64),

    #[error("Verdict '{0}' is neither PASS nor FAIL")]
    UnknownVerdict(String),

    #[error("No evaluation recorded yet")]
    MissingEvaluation,
}

/// Estimated share of the target logic exercised by the artifact (0..=100)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Coverage(u8);

impl Coverage {
    pub const MAX: u8 = 100;

    pub fn new(value: i64) -> Result<Self, ContractError> {
        debug!(value, "Coverage::new: called");
        if (0..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            debug!(value, "Coverage::new: out of range");
            Err(ContractError::CoverageOutOfRange(value))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Coverage {
    type Error = ContractError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Coverage> for i64 {
    fn from(c: Coverage) -> Self {
        c.0 as i64
    }
}

impl std::fmt::Display for Coverage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Evaluator's binary judgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl std::str::FromStr for Verdict {
    type Err = ContractError;

    /// Exact spelling only: `PASS` or `FAIL`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "Verdict::from_str: called");
        match s {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            other => {
                debug!(%other, "Verdict::from_str: unknown verdict");
                Err(ContractError::UnknownVerdict(other.to_string()))
            }
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// Evaluation result as the pipeline emits it (unvalidated)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub expected_coverage: i64,
    #[serde(default)]
    pub feedback: String,
    pub pass_fail: String,
}

impl EvaluationReport {
    pub fn new(expected_coverage: i64, pass_fail: impl Into<String>, feedback: impl Into<String>) -> Self {
        Self {
            expected_coverage,
            feedback: feedback.into(),
            pass_fail: pass_fail.into(),
        }
    }

    /// Validate against the evaluator contract
    pub fn validate(&self) -> Result<Evaluation, ContractError> {
        debug!(
            coverage = self.expected_coverage,
            verdict = %self.pass_fail,
            "EvaluationReport::validate: called"
        );
        Ok(Evaluation {
            coverage: Coverage::new(self.expected_coverage)?,
            verdict: self.pass_fail.parse()?,
            feedback: self.feedback.clone(),
        })
    }
}

/// Validated evaluation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub coverage: Coverage,
    pub verdict: Verdict,
    pub feedback: String,
}

/// Mutable record threaded through one session of the control loop
///
/// Owned by a single `LoopEngine`; never shared across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Latest generated artifact (test code)
    pub artifact: String,

    /// Latest coverage estimate
    pub coverage: Coverage,

    /// Latest verdict; `None` until the first evaluation
    pub verdict: Option<Verdict>,

    /// Latest remediation notes; empty only before the first evaluation
    pub feedback: String,

    /// Stage that produced `artifact`, set while resolving a retry
    pub generation_stage_id: Option<StageId>,

    /// Stage that produced the evaluation, set while resolving a retry
    pub evaluation_stage_id: Option<StageId>,
}

impl SessionState {
    pub fn new() -> Self {
        debug!("SessionState::new: called");
        Self::default()
    }

    /// Overwrite the artifact after a generation call
    pub fn apply_artifact(&mut self, artifact: impl Into<String>) {
        self.artifact = artifact.into();
        debug!(artifact_len = self.artifact.len(), "SessionState::apply_artifact: called");
    }

    /// Overwrite coverage, verdict and feedback after an evaluation call
    pub fn apply_evaluation(&mut self, evaluation: Evaluation) {
        debug!(coverage = %evaluation.coverage, verdict = %evaluation.verdict, "SessionState::apply_evaluation: called");
        self.coverage = evaluation.coverage;
        self.verdict = Some(evaluation.verdict);
        self.feedback = evaluation.feedback;
    }

    /// Current coverage and verdict, if an evaluation has been applied
    pub fn evaluation(&self) -> Result<(Coverage, Verdict), ContractError> {
        self.verdict
            .map(|verdict| (self.coverage, verdict))
            .ok_or(ContractError::MissingEvaluation)
    }

    /// Store both stage identifiers at once
    pub fn set_stage_ids(&mut self, generation: StageId, evaluation: StageId) {
        debug!(%generation, %evaluation, "SessionState::set_stage_ids: called");
        self.generation_stage_id = Some(generation);
        self.evaluation_stage_id = Some(evaluation);
    }
}

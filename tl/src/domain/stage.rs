//! Stage identity types

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Opaque identifier of one stage execution inside the external pipeline
///
/// Only meaningful to the pipeline that issued it. Not stable across
/// pipeline versions and never parsed by the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    /// Wrap an identifier issued by the pipeline
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-ordered identifier
    pub fn generate() -> Self {
        let id = uuid::Uuid::now_v7().to_string();
        debug!(%id, "StageId::generate: called");
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Role a stage plays in the feedback loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageRole {
    /// Produces the artifact (the test suite)
    Generation,
    /// Produces coverage, verdict and feedback for the artifact
    Evaluation,
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generation => write!(f, "generation"),
            Self::Evaluation => write!(f, "evaluation"),
        }
    }
}

/// Identifiers of the two stages the loop replays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageIds {
    pub generation: StageId,
    pub evaluation: StageId,
}

impl StageIds {
    pub fn new(generation: StageId, evaluation: StageId) -> Self {
        debug!(%generation, %evaluation, "StageIds::new: called");
        Self { generation, evaluation }
    }
}

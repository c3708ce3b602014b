//! Stage identifier resolver (legacy log linkage)
//!
//! Scrapes the generation and evaluation stage identifiers out of a
//! line-oriented execution log. A line names a stage when it contains that
//! stage's marker; the identifier is the rest of the line after the marker,
//! trimmed. Later lines win, so a log spanning several runs resolves to the
//! most recent one. A marker with nothing after it does not count.

use thiserror::Error;
use tracing::debug;

use crate::domain::{StageId, StageIds, StageRole};
use crate::pipeline::{PipelineDefinition, PipelineError, stage_marker};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("No {role} stage found in execution log (marker '{marker}')")]
    StageNotFound { role: StageRole, marker: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResolver {
    generation_marker: String,
    evaluation_marker: String,
}

impl StageResolver {
    pub fn new(generation_marker: &str, evaluation_marker: &str) -> Self {
        debug!(%generation_marker, %evaluation_marker, "StageResolver::new: called");
        Self {
            generation_marker: generation_marker.to_string(),
            evaluation_marker: evaluation_marker.to_string(),
        }
    }

    /// Markers for the positions the definition assigns to each role
    pub fn for_definition(definition: &PipelineDefinition) -> Result<Self, PipelineError> {
        debug!(pipeline = %definition.name, "StageResolver::for_definition: called");
        let position = |role: StageRole| {
            definition
                .position_of(role)
                .ok_or_else(|| PipelineError::Definition(format!("pipeline '{}' has no {} stage", definition.name, role)))
        };
        Ok(Self::new(
            &stage_marker(position(StageRole::Generation)?),
            &stage_marker(position(StageRole::Evaluation)?),
        ))
    }

    /// (generation, evaluation) markers
    pub fn markers(&self) -> (&str, &str) {
        (&self.generation_marker, &self.evaluation_marker)
    }

    fn marker(&self, role: StageRole) -> &str {
        match role {
            StageRole::Generation => &self.generation_marker,
            StageRole::Evaluation => &self.evaluation_marker,
        }
    }

    /// Locate both stage identifiers; fails naming the first missing role
    pub fn resolve<S: AsRef<str>>(&self, lines: &[S]) -> Result<StageIds, ResolveError> {
        debug!(line_count = lines.len(), "StageResolver::resolve: called");
        let generation = self.find(lines, StageRole::Generation)?;
        let evaluation = self.find(lines, StageRole::Evaluation)?;
        Ok(StageIds::new(generation, evaluation))
    }

    fn find<S: AsRef<str>>(&self, lines: &[S], role: StageRole) -> Result<StageId, ResolveError> {
        let marker = self.marker(role);
        lines
            .iter()
            .rev()
            .filter_map(|line| {
                let line = line.as_ref();
                line.find(marker).map(|at| line[at + marker.len()..].trim())
            })
            .find(|id| !id.is_empty())
            .map(StageId::new)
            .ok_or_else(|| {
                debug!(%role, %marker, "StageResolver::find: marker not found");
                ResolveError::StageNotFound {
                    role,
                    marker: marker.to_string(),
                }
            })
    }
}

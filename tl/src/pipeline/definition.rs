//! Pipeline definitions and loading
//!
//! A pipeline definition is an ordered list of LLM stages. Two of them carry
//! a role: the `generation` stage produces the artifact and the `evaluation`
//! stage judges it. Definitions are loaded from:
//! 1. Builtin (embedded in binary)
//! 2. User global (~/.config/testloop/pipelines/*.yml)
//! 3. Project-specific (.testloop/pipelines/*.yml)
//!
//! Later definitions override earlier ones with the same name.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::PipelineError;
use crate::config::PipelineConfig;
use crate::domain::StageRole;

/// One stage of a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name; earlier outputs are exposed to templates as `outputs.<name>`
    pub name: String,

    /// Role in the feedback loop, if any
    #[serde(default)]
    pub role: Option<StageRole>,

    /// System prompt sent with every call of this stage
    #[serde(rename = "system-prompt", default)]
    pub system_prompt: String,

    /// Handlebars template rendered into the user prompt
    pub prompt: String,

    /// Sink file (relative to the output directory) for this stage's output
    #[serde(rename = "output-file", default)]
    pub output_file: Option<String>,
}

/// A named, ordered pipeline of stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Filled from the file name or map key when loading
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    /// Check the stage layout the control loop relies on
    ///
    /// Requires unique stage names and exactly one generation and one
    /// evaluation stage, with generation first.
    pub fn validate(&self) -> Result<(), PipelineError> {
        debug!(name = %self.name, stage_count = self.stages.len(), "PipelineDefinition::validate: called");
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::Definition(format!(
                    "pipeline '{}' has duplicate stage '{}'",
                    self.name, stage.name
                )));
            }
        }

        let generation = self.single_role_index(StageRole::Generation)?;
        let evaluation = self.single_role_index(StageRole::Evaluation)?;
        if generation > evaluation {
            debug!(generation, evaluation, "PipelineDefinition::validate: evaluation precedes generation");
            return Err(PipelineError::Definition(format!(
                "pipeline '{}' evaluates before it generates",
                self.name
            )));
        }
        Ok(())
    }

    fn single_role_index(&self, role: StageRole) -> Result<usize, PipelineError> {
        let indices: Vec<usize> = self
            .stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role == Some(role))
            .map(|(i, _)| i)
            .collect();
        match indices.as_slice() {
            [idx] => Ok(*idx),
            [] => Err(PipelineError::Definition(format!(
                "pipeline '{}' has no {} stage",
                self.name, role
            ))),
            _ => Err(PipelineError::Definition(format!(
                "pipeline '{}' has {} {} stages, expected one",
                self.name,
                indices.len(),
                role
            ))),
        }
    }

    /// Index of the stage holding `role`
    pub fn index_of(&self, role: StageRole) -> Option<usize> {
        self.stages.iter().position(|s| s.role == Some(role))
    }

    /// 1-based position of the stage holding `role`
    pub fn position_of(&self, role: StageRole) -> Option<usize> {
        self.index_of(role).map(|i| i + 1)
    }

    /// Stage definition by name
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Execution-log marker for the stage at 1-based `position`
pub fn stage_marker(position: usize) -> String {
    format!("Task {}:", position)
}

/// Builtin pipeline definitions (embedded in binary)
const BUILTIN_JEST: &str = include_str!("builtin/jest.yml");
const BUILTIN_JEST_LITE: &str = include_str!("builtin/jest-lite.yml");

/// Loader for pipeline definitions
#[derive(Debug, Default)]
pub struct PipelineLoader {
    definitions: BTreeMap<String, PipelineDefinition>,
}

impl PipelineLoader {
    /// Load every definition reachable from the configured paths
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        debug!(paths = ?config.paths, "PipelineLoader::new: called");
        let mut loader = Self::default();

        if config.use_builtin() {
            loader.load_builtin("jest", BUILTIN_JEST)?;
            loader.load_builtin("jest-lite", BUILTIN_JEST_LITE)?;
        }

        for path in config.expanded_paths() {
            if path.is_dir() {
                loader.load_from_directory(&path)?;
            } else {
                debug!(?path, "PipelineLoader::new: directory does not exist, skipping");
            }
        }

        info!(count = loader.definitions.len(), "Loaded pipeline definitions");
        Ok(loader)
    }

    fn load_builtin(&mut self, name: &str, yaml: &str) -> Result<()> {
        debug!(%name, "load_builtin: called");
        let mut definition: PipelineDefinition =
            serde_yaml::from_str(yaml).with_context(|| format!("Failed to parse builtin pipeline: {}", name))?;
        definition.name = name.to_string();
        definition.validate()?;
        self.definitions.insert(name.to_string(), definition);
        Ok(())
    }

    fn load_from_directory(&mut self, dir: &Path) -> Result<()> {
        debug!(?dir, "load_from_directory: called");
        let entries = fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e == "yml" || e == "yaml").unwrap_or(false) {
                if let Err(e) = self.load_from_file(&path) {
                    warn!(?path, error = %e, "Failed to load pipeline definition");
                }
            } else {
                debug!(?path, "load_from_directory: skipping non-yaml file");
            }
        }
        Ok(())
    }

    /// Load one file; the file stem names the definition
    fn load_from_file(&mut self, path: &Path) -> Result<()> {
        debug!(?path, "load_from_file: called");
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read: {}", path.display()))?;
        let mut definition: PipelineDefinition =
            serde_yaml::from_str(&content).with_context(|| format!("Failed to parse: {}", path.display()))?;

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| eyre::eyre!("Invalid filename: {}", path.display()))?;
        definition.name = name.to_string();
        definition.validate()?;

        if self.definitions.contains_key(name) {
            info!(%name, ?path, "Overriding pipeline definition");
        }
        self.definitions.insert(name.to_string(), definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PipelineDefinition> {
        debug!(%name, "PipelineLoader::get: called");
        self.definitions.get(name)
    }

    /// Definitions sorted by name
    pub fn definitions(&self) -> impl Iterator<Item = &PipelineDefinition> {
        self.definitions.values()
    }
}

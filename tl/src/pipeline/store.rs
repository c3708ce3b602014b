//! Run records for the staged pipeline
//!
//! Each run lives under `<storage>/runs/<run-id>/`:
//! - `run.json`: the full [`RunRecord`] (inputs, every stage output)
//! - `stages.log`: the execution log, one `Task <n>: <stage-id>` line per stage
//!
//! `<storage>/runs/latest` holds the id of the most recently saved run, and
//! `<storage>/runs/stages/<stage-id>` the id of the run that owns a stage.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::definition::{StageDefinition, stage_marker};
use super::{PipelineError, PipelineInputs};
use crate::domain::{StageId, StageIds, StageRole};

/// One executed stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: StageId,

    /// 1-based position in the pipeline
    pub position: usize,

    pub name: String,

    #[serde(default)]
    pub role: Option<StageRole>,

    /// Inputs substituted by the most recent replay, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<PipelineInputs>,

    pub output: String,

    /// Executions of this stage, including the original run
    pub attempts: u32,

    pub completed_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(position: usize, stage: &StageDefinition, output: String) -> Self {
        Self {
            id: StageId::generate(),
            position,
            name: stage.name.clone(),
            role: stage.role,
            inputs: None,
            output,
            attempts: 1,
            completed_at: Utc::now(),
        }
    }

    /// Record a replay of this stage; the identifier stays the same
    pub fn replace_output(&mut self, output: String, inputs: Option<PipelineInputs>) {
        debug!(id = %self.id, attempts = self.attempts, "StageRecord::replace_output: called");
        self.output = output;
        self.inputs = inputs;
        self.attempts += 1;
        self.completed_at = Utc::now();
    }
}

/// Everything needed to replay any stage of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub pipeline: String,
    pub inputs: PipelineInputs,
    pub stages: Vec<StageRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(pipeline: &str, inputs: PipelineInputs) -> Self {
        let now = Utc::now();
        let id = uuid::Uuid::now_v7().to_string();
        debug!(%id, %pipeline, "RunRecord::new: called");
        Self {
            id,
            pipeline: pipeline.to_string(),
            inputs,
            stages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_stage(&mut self, stage: StageRecord) {
        self.stages.push(stage);
        self.updated_at = Utc::now();
    }

    pub fn stage_index(&self, id: &StageId) -> Option<usize> {
        self.stages.iter().position(|s| &s.id == id)
    }

    pub fn stage_for_role(&self, role: StageRole) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.role == Some(role))
    }

    /// Generation and evaluation identifiers, once both stages have run
    pub fn stage_ids(&self) -> Option<StageIds> {
        let generation = self.stage_for_role(StageRole::Generation)?;
        let evaluation = self.stage_for_role(StageRole::Evaluation)?;
        Some(StageIds::new(generation.id.clone(), evaluation.id.clone()))
    }

    /// True when the run is older than `ttl`
    pub fn is_expired(&self, ttl: Option<Duration>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        let age = Utc::now().signed_duration_since(self.created_at);
        age.to_std().map(|age| age > ttl).unwrap_or(false)
    }

    /// Execution log: a marker line per stage followed by a detail line
    pub fn log_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.stages.len() * 2 + 1);
        lines.push(format!("Run {} ({})", self.id, self.pipeline));
        for stage in &self.stages {
            lines.push(format!("{} {}", stage_marker(stage.position), stage.id));
            let role = stage.role.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "    name={} role={} attempts={} completed={}",
                stage.name,
                role,
                stage.attempts,
                stage.completed_at.to_rfc3339()
            ));
        }
        lines
    }
}

/// File-backed store of run records
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    /// Store rooted at `<dir>/runs`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let root = dir.as_ref().join("runs");
        debug!(?root, "RunStore::new: called");
        Self { root }
    }

    fn run_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn latest_path(&self) -> PathBuf {
        self.root.join("latest")
    }

    /// Index entry for a stage; `None` for ids that cannot name a file
    fn stage_path(&self, id: &StageId) -> Option<PathBuf> {
        let id = id.as_str();
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.root.join("stages").join(id))
    }

    /// Write the record and its execution log, and mark it as latest
    pub async fn save(&self, record: &RunRecord) -> Result<(), PipelineError> {
        debug!(id = %record.id, stage_count = record.stages.len(), "RunStore::save: called");
        let dir = self.run_dir(&record.id);
        tokio::fs::create_dir_all(&dir).await?;

        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(dir.join("run.json"), json).await?;

        let mut log = record.log_lines().join("\n");
        log.push('\n');
        tokio::fs::write(dir.join("stages.log"), log).await?;

        tokio::fs::create_dir_all(self.root.join("stages")).await?;
        for stage in &record.stages {
            if let Some(path) = self.stage_path(&stage.id) {
                tokio::fs::write(path, &record.id).await?;
            }
        }

        tokio::fs::write(self.latest_path(), &record.id).await?;
        info!(id = %record.id, "Saved pipeline run");
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<RunRecord, PipelineError> {
        debug!(%id, "RunStore::load: called");
        match tokio::fs::read_to_string(self.run_dir(id).join("run.json")).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(%id, "RunStore::load: no such run");
                Err(PipelineError::RunExpired(format!("no run '{}' in store", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Id of the most recent run, if any
    pub async fn latest_id(&self) -> Result<Option<String>, PipelineError> {
        debug!("RunStore::latest_id: called");
        match tokio::fs::read_to_string(self.latest_path()).await {
            Ok(id) => {
                let id = id.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn latest(&self) -> Result<Option<RunRecord>, PipelineError> {
        debug!("RunStore::latest: called");
        match self.latest_id().await? {
            Some(id) => Ok(Some(self.load(&id).await?)),
            None => Ok(None),
        }
    }

    /// Id of the run that owns `stage`, if any stored run does
    pub async fn run_for_stage(&self, stage: &StageId) -> Result<Option<String>, PipelineError> {
        debug!(%stage, "RunStore::run_for_stage: called");
        let Some(path) = self.stage_path(stage) else {
            debug!(%stage, "run_for_stage: not an indexable id");
            return Ok(None);
        };
        match tokio::fs::read_to_string(path).await {
            Ok(id) => {
                let id = id.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stored execution log of a run
    pub async fn log(&self, id: &str) -> Result<Vec<String>, PipelineError> {
        debug!(%id, "RunStore::log: called");
        match tokio::fs::read_to_string(self.run_dir(id).join("stages.log")).await {
            Ok(text) => Ok(text.lines().map(String::from).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PipelineError::RunExpired(format!("no run '{}' in store", id)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

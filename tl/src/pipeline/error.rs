//! Pipeline invocation errors

use std::time::Duration;
use thiserror::Error;

use crate::domain::{StageId, StageRole};
use crate::llm::LlmError;

/// Any failure of `run_pipeline`, `replay_stage` or `execution_log`
///
/// Always fatal to the session that hit it; the control loop never retries
/// a failed call.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("LLM call failed in stage '{stage}': {source}")]
    Llm {
        stage: String,
        #[source]
        source: LlmError,
    },

    #[error("Command `{command}` exited with code {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Pipeline call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown stage id: {0}")]
    UnknownStage(StageId),

    #[error("Run context expired: {0}")]
    RunExpired(String),

    #[error("Stage {stage_id} returned the wrong kind of output (expected {expected} output)")]
    UnexpectedOutput { stage_id: StageId, expected: StageRole },

    #[error("Malformed pipeline output: {0}")]
    Malformed(String),

    #[error("Invalid pipeline definition: {0}")]
    Definition(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

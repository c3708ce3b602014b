//! Legacy shell-command pipeline
//!
//! Wraps an external pipeline that only offers a CLI. Commands run through
//! `sh -c`; values travel in environment variables, never on the command
//! line:
//!
//! | Variable            | Set for        | Content                        |
//! |---------------------|----------------|--------------------------------|
//! | `TESTLOOP_FEEDBACK` | run, replay    | feedback text                  |
//! | `TESTLOOP_INPUTS`   | run, replay    | all inputs as a JSON object    |
//! | `TESTLOOP_STAGE_ID` | replay         | stage identifier to replay     |
//!
//! A variable not set for a call is removed from the child's environment.
//! An evaluation replay, which takes no inputs, sees only the stage id.
//!
//! The external pipeline cannot report stage identifiers, so the control loop
//! scrapes them from the `log` command's output.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Pipeline, PipelineError, PipelineInputs, PipelineOutcome, StageOutput, parse_evaluation, parse_json_output};
use crate::config::CommandConfig;
use crate::domain::{EvaluationReport, StageId};

pub const ENV_FEEDBACK: &str = "TESTLOOP_FEEDBACK";
pub const ENV_INPUTS: &str = "TESTLOOP_INPUTS";
pub const ENV_STAGE_ID: &str = "TESTLOOP_STAGE_ID";

const PIPELINE_VARS: [&str; 3] = [ENV_FEEDBACK, ENV_INPUTS, ENV_STAGE_ID];

/// What the `run` command prints
#[derive(Debug, Deserialize)]
struct RunOutput {
    artifact: String,
    #[serde(flatten)]
    evaluation: EvaluationReport,
}

#[derive(Debug, Deserialize)]
struct ArtifactOutput {
    artifact: String,
}

pub struct CommandPipeline {
    config: CommandConfig,
}

impl CommandPipeline {
    pub fn new(config: CommandConfig) -> Self {
        debug!(run = %config.run, log = %config.log, replay = %config.replay, "CommandPipeline::new: called");
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Shell command with exactly `env` among the pipeline variables
    ///
    /// Pipeline variables missing from `env` are removed so values inherited
    /// from the parent never reach the child.
    fn command(&self, command: &str, env: &[(&str, String)]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        for key in PIPELINE_VARS {
            if !env.iter().any(|(k, _)| *k == key) {
                cmd.env_remove(key);
            }
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run one command and return its stdout
    async fn run_command(&self, name: &str, command: &str, env: &[(&str, String)]) -> Result<String, PipelineError> {
        debug!(%name, %command, "run_command: called");
        if command.trim().is_empty() {
            return Err(PipelineError::Definition(format!(
                "pipeline.command.{} is not configured",
                name
            )));
        }

        let mut cmd = self.command(command, env);
        let start = std::time::Instant::now();
        let output = match tokio::time::timeout(self.timeout(), cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(%name, "run_command: command timed out");
                return Err(PipelineError::Timeout(self.timeout()));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        info!(%name, exit_code, duration_ms = start.elapsed().as_millis() as u64, "Pipeline command finished");
        if !output.status.success() {
            return Err(PipelineError::Command {
                command: command.to_string(),
                exit_code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn input_env(inputs: &PipelineInputs) -> Result<Vec<(&'static str, String)>, PipelineError> {
        Ok(vec![
            (ENV_FEEDBACK, inputs.feedback().to_string()),
            (ENV_INPUTS, serde_json::to_string(inputs)?),
        ])
    }
}

/// Classify replay output: an evaluation object, an `{"artifact": ...}`
/// object, or raw artifact text
pub fn parse_replay_output(stdout: &str) -> StageOutput {
    debug!(stdout_len = stdout.len(), "parse_replay_output: called");
    if let Ok(report) = parse_evaluation(stdout) {
        return StageOutput::Evaluation(report);
    }
    if let Ok(wrapped) = parse_json_output::<ArtifactOutput>(stdout, "replay output") {
        return StageOutput::Artifact(wrapped.artifact);
    }
    StageOutput::Artifact(stdout.trim_end_matches('\n').to_string())
}

#[async_trait]
impl Pipeline for CommandPipeline {
    async fn run_pipeline(&self, inputs: &PipelineInputs) -> Result<PipelineOutcome, PipelineError> {
        debug!("CommandPipeline::run_pipeline: called");
        let env = Self::input_env(inputs)?;
        let stdout = self.run_command("run", &self.config.run, &env).await?;

        let output: RunOutput = parse_json_output(&stdout, "run output")?;

        Ok(PipelineOutcome {
            artifact: output.artifact,
            evaluation: output.evaluation,
            stage_ids: None,
        })
    }

    async fn replay_stage(
        &self,
        stage_id: &StageId,
        inputs: Option<&PipelineInputs>,
    ) -> Result<StageOutput, PipelineError> {
        debug!(%stage_id, "CommandPipeline::replay_stage: called");
        let mut env = match inputs {
            Some(inputs) => Self::input_env(inputs)?,
            None => Vec::new(),
        };
        env.push((ENV_STAGE_ID, stage_id.to_string()));

        let stdout = self.run_command("replay", &self.config.replay, &env).await?;
        Ok(parse_replay_output(&stdout))
    }

    async fn execution_log(&self) -> Result<Vec<String>, PipelineError> {
        debug!("CommandPipeline::execution_log: called");
        let stdout = self.run_command("log", &self.config.log, &[]).await?;
        Ok(stdout.lines().map(String::from).collect())
    }
}

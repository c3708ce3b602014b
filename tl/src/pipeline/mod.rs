//! Pipeline invocation interface
//!
//! The control loop never talks to LLMs or external tools itself. It drives a
//! [`Pipeline`]: one call that runs every stage and returns the artifact plus
//! its evaluation, and one call that replays a single stage by identifier.
//!
//! Two implementations ship with the crate:
//! - [`StagedPipeline`] runs a [`PipelineDefinition`] stage by stage through
//!   an [`LlmClient`](crate::llm::LlmClient) and returns the stage
//!   identifiers structurally.
//! - [`CommandPipeline`] (legacy) shells out to an external pipeline and
//!   leaves identifier lookup to the log resolver.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod command;
pub mod definition;
mod error;
pub mod staged;
pub mod store;

pub use command::CommandPipeline;
pub use definition::{PipelineDefinition, PipelineLoader, StageDefinition, stage_marker};
pub use error::PipelineError;
pub use staged::StagedPipeline;
pub use store::{RunRecord, RunStore, StageRecord};

use crate::config::{Config, PipelineKind};
use crate::domain::{EvaluationReport, StageId, StageIds};
use crate::r#loop::StageResolver;

/// Key the control loop uses to pass evaluator feedback
pub const FEEDBACK_KEY: &str = "feedback";

/// String inputs handed to a pipeline run or stage replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineInputs(BTreeMap<String, String>);

impl PipelineInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inputs carrying only a feedback entry
    pub fn with_feedback(feedback: impl Into<String>) -> Self {
        let mut inputs = Self::new();
        inputs.insert(FEEDBACK_KEY, feedback);
        inputs
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Feedback text, empty when absent
    pub fn feedback(&self) -> &str {
        self.get(FEEDBACK_KEY).unwrap_or_default()
    }

    /// Overlay `other` on top of these inputs
    pub fn merge(&mut self, other: &PipelineInputs) {
        debug!(count = other.0.len(), "PipelineInputs::merge: called");
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Result of one full pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// Output of the generation stage
    pub artifact: String,

    /// Raw output of the evaluation stage
    pub evaluation: EvaluationReport,

    /// Identifiers for targeted replay; `None` when the pipeline cannot
    /// report them and the execution log must be scraped instead
    pub stage_ids: Option<StageIds>,
}

/// Result of replaying one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    /// Text output, e.g. a regenerated artifact
    Artifact(String),
    /// Evaluation output
    Evaluation(EvaluationReport),
}

/// External collaborator the control loop drives
///
/// Implementations own all run context; the loop only holds the opaque
/// identifiers they hand out.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Run every stage once and return the artifact and its evaluation
    async fn run_pipeline(&self, inputs: &PipelineInputs) -> Result<PipelineOutcome, PipelineError>;

    /// Re-execute exactly one stage of the run that issued `stage_id`,
    /// substituting `inputs` and reusing every other stage's stored output
    async fn replay_stage(&self, stage_id: &StageId, inputs: Option<&PipelineInputs>)
    -> Result<StageOutput, PipelineError>;

    /// Line-oriented execution log of the latest run
    async fn execution_log(&self) -> Result<Vec<String>, PipelineError>;
}

/// Candidate JSON objects in free-form model output, best first
///
/// Fenced ```json blocks come first, last block first, followed by the span
/// from the first `{` to the last `}`.
pub fn json_candidates(text: &str) -> Result<Vec<&str>, PipelineError> {
    debug!(text_len = text.len(), "json_candidates: called");
    let fence =
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").map_err(|e| PipelineError::Malformed(e.to_string()))?;
    let mut candidates: Vec<&str> = fence
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    candidates.reverse();
    debug!(fenced = candidates.len(), "json_candidates: fenced blocks");

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}'))
        && start < end
    {
        let span = &text[start..=end];
        if !candidates.contains(&span) {
            candidates.push(span);
        }
    }
    Ok(candidates)
}

/// Deserialize the first candidate object in `text` that fits `T`
///
/// `what` names the output in the error when nothing fits.
pub fn parse_json_output<T: DeserializeOwned>(text: &str, what: &str) -> Result<T, PipelineError> {
    let mut last_error = None;
    for candidate in json_candidates(text)? {
        match serde_json::from_str(candidate) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => PipelineError::Malformed(format!("{}: {}", what, e)),
        None => PipelineError::Malformed(format!("{}: no JSON object", what)),
    })
}

/// Parse evaluation stage output into its wire shape
pub fn parse_evaluation(text: &str) -> Result<EvaluationReport, PipelineError> {
    debug!(text_len = text.len(), "parse_evaluation: called");
    parse_json_output(text, "evaluation output")
}

/// Build the configured pipeline and the resolver matching its log format
///
/// `definition` overrides `pipeline.definition` from the config.
pub fn create_pipeline(config: &Config, definition: Option<&str>) -> eyre::Result<(Arc<dyn Pipeline>, StageResolver)> {
    debug!(kind = ?config.pipeline.kind, ?definition, "create_pipeline: called");
    match config.pipeline.kind {
        PipelineKind::Staged => {
            let name = definition.unwrap_or(&config.pipeline.definition);
            let loader = PipelineLoader::new(&config.pipeline)?;
            let definition = loader.get(name).cloned().ok_or_else(|| {
                let available: Vec<&str> = loader.definitions().map(|d| d.name.as_str()).collect();
                eyre::eyre!("Unknown pipeline '{}'. Available: {}", name, available.join(", "))
            })?;
            let resolver = StageResolver::for_definition(&definition)?;
            let llm = crate::llm::create_client(&config.llm)?;
            let pipeline = StagedPipeline::new(
                llm,
                definition,
                RunStore::new(&config.storage.dir),
                config.pipeline.output_dir.clone(),
                config.llm.max_tokens,
                config.pipeline.run_ttl_secs.map(std::time::Duration::from_secs),
            )?;
            Ok((Arc::new(pipeline), resolver))
        }
        PipelineKind::Command => {
            let resolver = StageResolver::new(&config.resolver.generation_marker, &config.resolver.evaluation_marker);
            Ok((Arc::new(CommandPipeline::new(config.pipeline.command.clone())), resolver))
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted pipeline for control-loop tests
    ///
    /// Returns queued results in order and records every replay request.
    #[derive(Default)]
    pub struct MockPipeline {
        outcomes: Mutex<VecDeque<Result<PipelineOutcome, PipelineError>>>,
        replays: Mutex<VecDeque<Result<StageOutput, PipelineError>>>,
        log: Mutex<Vec<String>>,
        delay: Option<Duration>,
        run_calls: AtomicUsize,
        replay_calls: AtomicUsize,
        log_calls: AtomicUsize,
        replayed: Mutex<Vec<(StageId, Option<PipelineInputs>)>>,
    }

    impl MockPipeline {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_outcome(self, outcome: Result<PipelineOutcome, PipelineError>) -> Self {
            if let Ok(mut q) = self.outcomes.lock() {
                q.push_back(outcome);
            }
            self
        }

        pub fn with_replay(self, output: Result<StageOutput, PipelineError>) -> Self {
            if let Ok(mut q) = self.replays.lock() {
                q.push_back(output);
            }
            self
        }

        pub fn with_log(self, lines: &[&str]) -> Self {
            if let Ok(mut log) = self.log.lock() {
                *log = lines.iter().map(|l| l.to_string()).collect();
            }
            self
        }

        /// Sleep this long inside every call
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn run_calls(&self) -> usize {
            self.run_calls.load(Ordering::SeqCst)
        }

        pub fn replay_calls(&self) -> usize {
            self.replay_calls.load(Ordering::SeqCst)
        }

        pub fn log_calls(&self) -> usize {
            self.log_calls.load(Ordering::SeqCst)
        }

        /// Every replay request, in order
        pub fn replayed(&self) -> Vec<(StageId, Option<PipelineInputs>)> {
            self.replayed.lock().map(|r| r.clone()).unwrap_or_default()
        }

        async fn pause(&self) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Outcome without structured ids
    pub fn outcome(artifact: &str, coverage: i64, verdict: &str, feedback: &str) -> PipelineOutcome {
        PipelineOutcome {
            artifact: artifact.to_string(),
            evaluation: EvaluationReport::new(coverage, verdict, feedback),
            stage_ids: None,
        }
    }

    pub fn evaluation(coverage: i64, verdict: &str, feedback: &str) -> StageOutput {
        StageOutput::Evaluation(EvaluationReport::new(coverage, verdict, feedback))
    }

    #[async_trait]
    impl Pipeline for MockPipeline {
        async fn run_pipeline(&self, _inputs: &PipelineInputs) -> Result<PipelineOutcome, PipelineError> {
            debug!("MockPipeline::run_pipeline: called");
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            self.outcomes
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or_else(|| Err(PipelineError::Malformed("no more mock outcomes".to_string())))
        }

        async fn replay_stage(
            &self,
            stage_id: &StageId,
            inputs: Option<&PipelineInputs>,
        ) -> Result<StageOutput, PipelineError> {
            debug!(%stage_id, "MockPipeline::replay_stage: called");
            self.replay_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut r) = self.replayed.lock() {
                r.push((stage_id.clone(), inputs.cloned()));
            }
            self.pause().await;
            self.replays
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or_else(|| Err(PipelineError::Malformed("no more mock replays".to_string())))
        }

        async fn execution_log(&self) -> Result<Vec<String>, PipelineError> {
            debug!("MockPipeline::execution_log: called");
            self.log_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.log.lock().map(|l| l.clone()).unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_json() {
        let report = parse_evaluation(r#"{"expected_coverage": 64, "feedback": "x", "pass_fail": "FAIL"}"#).unwrap();
        assert_eq!(report, EvaluationReport::new(64, "FAIL", "x"));
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let text = "Here is my analysis.\n```json\n{\"expected_coverage\": 91, \"feedback\": \"ok\", \"pass_fail\": \"PASS\"}\n```\nDone {really}.";
        let report = parse_evaluation(text).unwrap();
        assert_eq!(report.expected_coverage, 91);
        assert_eq!(report.pass_fail, "PASS");
    }

    #[test]
    fn test_parse_unfenced_json_with_prose() {
        let text = "Result: {\"expected_coverage\": 70, \"pass_fail\": \"FAIL\"} end";
        let report = parse_evaluation(text).unwrap();
        assert_eq!(report.expected_coverage, 70);
        assert!(report.feedback.is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let err = parse_evaluation(r#"{"feedback": "no numbers"}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));
    }

    #[test]
    fn test_parse_skips_example_block_before_answer() {
        let text = "An evaluation looks like:\n```json\n{\"example\": true}\n```\nMy verdict:\n```json\n{\"expected_coverage\": 80, \"feedback\": \"add a timeout test\", \"pass_fail\": \"FAIL\"}\n```";
        let report = parse_evaluation(text).unwrap();
        assert_eq!(report, EvaluationReport::new(80, "FAIL", "add a timeout test"));
    }

    #[test]
    fn test_parse_falls_back_to_earlier_block() {
        let text = "Draft:\n```json\n{\"expected_coverage\": 40, \"pass_fail\": \"FAIL\"}\n```\nRevised:\n```json\n{\"expected_coverage\": 85, \"pass_fail\": \"PASS\", \"feedback\": {\"nested\": 1}}\n```";
        // the revised block carries a non-string feedback, so the draft is used
        let report = parse_evaluation(text).unwrap();
        assert_eq!(report.expected_coverage, 40);
    }

    #[test]
    fn test_json_candidates_order() {
        let text = "```json\n{\"a\": {\"b\": 1}}\n```\n```\n{\"c\": 2}\n```";
        let candidates = json_candidates(text).unwrap();
        assert_eq!(candidates[0], "{\"c\": 2}");
        assert_eq!(candidates[1], "{\"a\": {\"b\": 1}}");
    }

    #[test]
    fn test_parse_rejects_plain_text() {
        assert!(matches!(parse_evaluation("looks good to me"), Err(PipelineError::Malformed(_))));
    }

    #[test]
    fn test_inputs_merge_overrides() {
        let mut inputs = PipelineInputs::with_feedback(" ");
        inputs.insert("source_path", "auth.js");
        inputs.merge(&PipelineInputs::with_feedback("add logout tests"));
        assert_eq!(inputs.feedback(), "add logout tests");
        assert_eq!(inputs.get("source_path"), Some("auth.js"));
    }

    #[test]
    fn test_inputs_serialize_as_map() {
        let inputs = PipelineInputs::with_feedback("f");
        assert_eq!(serde_json::to_string(&inputs).unwrap(), r#"{"feedback":"f"}"#);
    }

    #[test]
    fn test_command_pipeline_needs_no_api_key() {
        let mut config = Config::default();
        config.pipeline.kind = PipelineKind::Command;
        let (_, resolver) = create_pipeline(&config, None).unwrap();
        assert_eq!(resolver.markers(), ("Task 4:", "Task 5:"));
    }

    #[test]
    fn test_unknown_definition_rejected() {
        let mut config = Config::default();
        config.pipeline.paths = vec!["builtin".to_string()];
        let err = create_pipeline(&config, Some("pytest")).err().unwrap();
        assert!(err.to_string().contains("Unknown pipeline 'pytest'"));
    }
}

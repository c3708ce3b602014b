//! testloop - coverage-gated feedback loop for generated test suites
//!
//! A multi-stage pipeline writes a test suite and a companion evaluation.
//! When the evaluation is weak (low coverage AND a FAIL verdict) the loop
//! replays only the generation stage with the evaluator's feedback, then the
//! evaluation stage, and gates again.
//!
//! # Modules
//!
//! - [`domain`] - Session state, coverage/verdict contract, stage identifiers
//! - [`pipeline`] - Pipeline invocation trait plus staged (LLM) and command (legacy) pipelines
//! - [`r#loop`] - Control loop engine, quality gate, stage resolver, cancellation
//! - [`llm`] - LLM client trait with Anthropic and OpenAI implementations
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod llm;
pub mod pipeline;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use config::Config;
pub use domain::{Coverage, SessionState, StageId, StageIds, StageRole, Verdict};
pub use pipeline::{Pipeline, PipelineError, PipelineInputs, PipelineOutcome, StageOutput};
pub use r#loop::{CancelHandle, LoopConfig, LoopEngine, QualityGate, SessionError, StageResolver};

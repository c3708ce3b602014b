//! LoopEngine - drives one feedback session to acceptance
//!
//! ```text
//! GENERATING -> EVALUATING -> GATING -+-> ACCEPTED
//!                               ^     |
//!                               |     +-> RESOLVING -> RETARGETING -> RE_EVALUATING
//!                               +-----------------------------------------+
//! ```
//!
//! The first pass is a single `run_pipeline` call. Every retry cycle resolves
//! the two stage identifiers, replays the generation stage with the latest
//! feedback, then replays the evaluation stage. Pipeline calls are the only
//! suspension points; each one is checked against the cancel signal, the
//! per-call timeout and the session budget.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cancel::CancelSignal;
use super::config::{Linkage, LoopConfig};
use super::gate::{GateDecision, QualityGate};
use super::resolver::{ResolveError, StageResolver};
use crate::domain::{ContractError, Coverage, EvaluationReport, SessionState, StageIds, StageRole, Verdict};
use crate::pipeline::{Pipeline, PipelineError, PipelineInputs, StageOutput};

/// Control-loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Generating,
    Evaluating,
    Gating,
    Resolving,
    Retargeting,
    ReEvaluating,
    Accepted,
}

/// Events that move the loop between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopEvent {
    ArtifactProduced,
    EvaluationProduced,
    Accept,
    Retry,
    StagesResolved,
}

impl LoopState {
    /// Transition table; `None` marks an impossible transition
    pub fn next(self, event: LoopEvent) -> Option<LoopState> {
        use LoopEvent::*;
        use LoopState::*;
        match (self, event) {
            (Generating, ArtifactProduced) => Some(Evaluating),
            (Evaluating, EvaluationProduced) => Some(Gating),
            (Gating, Accept) => Some(Accepted),
            (Gating, Retry) => Some(Resolving),
            (Resolving, StagesResolved) => Some(Retargeting),
            (Retargeting, ArtifactProduced) => Some(ReEvaluating),
            (ReEvaluating, EvaluationProduced) => Some(Gating),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LoopState::Accepted
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Generating => "GENERATING",
            Self::Evaluating => "EVALUATING",
            Self::Gating => "GATING",
            Self::Resolving => "RESOLVING",
            Self::Retargeting => "RETARGETING",
            Self::ReEvaluating => "RE_EVALUATING",
            Self::Accepted => "ACCEPTED",
        };
        write!(f, "{}", name)
    }
}

/// Which limit ended a session that never passed the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Iterations(u32),
    Budget(Duration),
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iterations(n) => write!(f, "{} retry cycles", n),
            Self::Budget(d) => write!(f, "the {:?} session budget", d),
        }
    }
}

/// Terminal session failures
///
/// Every variant carries the last known session state for diagnosis.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Pipeline call failed in {state} (iteration {iteration}): {source}")]
    Pipeline {
        state: LoopState,
        iteration: u32,
        #[source]
        source: PipelineError,
        last: Box<SessionState>,
    },

    #[error("Stage resolution failed (iteration {iteration}): {source}")]
    StageNotFound {
        iteration: u32,
        #[source]
        source: ResolveError,
        last: Box<SessionState>,
    },

    #[error("Quality gate did not accept within {limit} ({iterations} retry cycles run)")]
    MaxIterationsExceeded {
        iterations: u32,
        limit: Limit,
        last: Box<SessionState>,
    },

    #[error("Evaluator contract violated (iteration {iteration}): {source}")]
    Contract {
        iteration: u32,
        #[source]
        source: ContractError,
        last: Box<SessionState>,
    },

    #[error("Session cancelled in {state} (iteration {iteration})")]
    Cancelled {
        state: LoopState,
        iteration: u32,
        last: Box<SessionState>,
    },

    #[error("Invalid transition from {from} on {event:?}")]
    InvalidTransition {
        from: LoopState,
        event: LoopEvent,
        iteration: u32,
        last: Box<SessionState>,
    },
}

impl SessionError {
    /// Everything except an exhausted limit is fatal to the caller
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MaxIterationsExceeded { .. })
    }

    pub fn last_state(&self) -> &SessionState {
        match self {
            Self::Pipeline { last, .. }
            | Self::StageNotFound { last, .. }
            | Self::MaxIterationsExceeded { last, .. }
            | Self::Contract { last, .. }
            | Self::Cancelled { last, .. }
            | Self::InvalidTransition { last, .. } => last,
        }
    }

    /// Retry cycles started when the session ended
    pub fn iteration(&self) -> u32 {
        match self {
            Self::Pipeline { iteration, .. }
            | Self::StageNotFound { iteration, .. }
            | Self::Contract { iteration, .. }
            | Self::Cancelled { iteration, .. }
            | Self::InvalidTransition { iteration, .. } => *iteration,
            Self::MaxIterationsExceeded { iterations, .. } => *iterations,
        }
    }
}

/// One gate decision, kept for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateRecord {
    pub iteration: u32,
    pub coverage: Coverage,
    pub verdict: Verdict,
    pub decision: GateDecision,
}

/// Control loop for a single session
///
/// Owns its [`SessionState`] exclusively. Sessions share nothing but the
/// injected pipeline, so several engines may run concurrently.
pub struct LoopEngine {
    pub session_id: String,
    pipeline: Arc<dyn Pipeline>,
    resolver: StageResolver,
    gate: QualityGate,
    config: LoopConfig,
    cancel: CancelSignal,
    state: SessionState,
    loop_state: LoopState,
    iteration: u32,
    history: Vec<GateRecord>,
    started: Instant,
}

impl LoopEngine {
    pub fn new(pipeline: Arc<dyn Pipeline>, resolver: StageResolver, config: LoopConfig) -> Self {
        let session_id = uuid::Uuid::now_v7().to_string();
        debug!(%session_id, ?config, "LoopEngine::new: called");
        Self {
            session_id,
            pipeline,
            resolver,
            gate: QualityGate::new(config.coverage_threshold),
            config,
            cancel: CancelSignal::never(),
            state: SessionState::new(),
            loop_state: LoopState::Generating,
            iteration: 0,
            history: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn history(&self) -> &[GateRecord] {
        &self.history
    }

    /// Run the session until the gate accepts or a limit or failure ends it
    ///
    /// Once accepted, further calls return the frozen state without touching
    /// the pipeline. Calling again after a failure starts a fresh session.
    pub async fn run(&mut self, inputs: &PipelineInputs) -> Result<SessionState, SessionError> {
        debug!(session = %self.session_id, loop_state = %self.loop_state, "LoopEngine::run: called");
        if self.loop_state.is_terminal() {
            debug!("LoopEngine::run: already accepted");
            return Ok(self.state.clone());
        }
        self.reset();
        info!(
            session = %self.session_id,
            max_iterations = self.config.max_iterations,
            threshold = self.gate.threshold(),
            "Starting session"
        );

        let outcome = self.guarded(self.pipeline.run_pipeline(inputs)).await?;
        self.state.apply_artifact(outcome.artifact);
        self.transition(LoopEvent::ArtifactProduced)?;
        self.apply_report(&outcome.evaluation)?;
        self.transition(LoopEvent::EvaluationProduced)?;

        let structured = match self.config.linkage {
            Linkage::Structured => outcome.stage_ids,
            Linkage::Log => None,
        };

        loop {
            let (coverage, verdict) = self.state.evaluation().map_err(|e| self.contract_error(e))?;
            let decision = self.gate.decide(coverage, verdict);
            self.history.push(GateRecord {
                iteration: self.iteration,
                coverage,
                verdict,
                decision,
            });

            if decision == GateDecision::Accept {
                self.transition(LoopEvent::Accept)?;
                info!(session = %self.session_id, iteration = self.iteration, %coverage, %verdict, "Session accepted");
                return Ok(self.state.clone());
            }
            self.transition(LoopEvent::Retry)?;

            if self.iteration >= self.config.max_iterations {
                warn!(session = %self.session_id, iterations = self.iteration, "Retry cap reached");
                return Err(SessionError::MaxIterationsExceeded {
                    iterations: self.iteration,
                    limit: Limit::Iterations(self.config.max_iterations),
                    last: Box::new(self.state.clone()),
                });
            }
            self.iteration += 1;
            info!(session = %self.session_id, iteration = self.iteration, %coverage, %verdict, "Retrying");

            let ids = self.resolve(structured.as_ref()).await?;
            self.state.set_stage_ids(ids.generation.clone(), ids.evaluation.clone());
            self.transition(LoopEvent::StagesResolved)?;

            let feedback = PipelineInputs::with_feedback(self.state.feedback.clone());
            let regenerated = self.guarded(self.pipeline.replay_stage(&ids.generation, Some(&feedback))).await?;
            match regenerated {
                StageOutput::Artifact(artifact) => self.state.apply_artifact(artifact),
                StageOutput::Evaluation(_) => {
                    return Err(self.pipeline_error(PipelineError::UnexpectedOutput {
                        stage_id: ids.generation,
                        expected: StageRole::Generation,
                    }));
                }
            }
            self.transition(LoopEvent::ArtifactProduced)?;

            let reevaluated = self.guarded(self.pipeline.replay_stage(&ids.evaluation, None)).await?;
            match reevaluated {
                StageOutput::Evaluation(report) => self.apply_report(&report)?,
                StageOutput::Artifact(_) => {
                    return Err(self.pipeline_error(PipelineError::UnexpectedOutput {
                        stage_id: ids.evaluation,
                        expected: StageRole::Evaluation,
                    }));
                }
            }
            self.transition(LoopEvent::EvaluationProduced)?;
        }
    }

    fn reset(&mut self) {
        debug!("LoopEngine::reset: called");
        self.state = SessionState::new();
        self.loop_state = LoopState::Generating;
        self.iteration = 0;
        self.history.clear();
        self.started = Instant::now();
    }

    /// Stage identifiers for the next retry cycle
    async fn resolve(&self, structured: Option<&StageIds>) -> Result<StageIds, SessionError> {
        if let Some(ids) = structured {
            debug!("LoopEngine::resolve: using structured stage ids");
            return Ok(ids.clone());
        }

        debug!("LoopEngine::resolve: scraping execution log");
        let log = self.guarded(self.pipeline.execution_log()).await?;
        self.resolver
            .resolve(&log)
            .map_err(|source| SessionError::StageNotFound {
                iteration: self.iteration,
                source,
                last: Box::new(self.state.clone()),
            })
    }

    fn apply_report(&mut self, report: &EvaluationReport) -> Result<(), SessionError> {
        let evaluation = report.validate().map_err(|e| self.contract_error(e))?;
        self.state.apply_evaluation(evaluation);
        Ok(())
    }

    fn transition(&mut self, event: LoopEvent) -> Result<(), SessionError> {
        let from = self.loop_state;
        match from.next(event) {
            Some(to) => {
                info!(session = %self.session_id, iteration = self.iteration, %from, %to, "Session transition");
                self.loop_state = to;
                Ok(())
            }
            None => Err(SessionError::InvalidTransition {
                from,
                event,
                iteration: self.iteration,
                last: Box::new(self.state.clone()),
            }),
        }
    }

    /// Remaining wall-clock budget, or an error once it is spent
    fn remaining_budget(&self) -> Result<Option<Duration>, SessionError> {
        let Some(budget) = self.config.budget() else {
            return Ok(None);
        };
        match budget.checked_sub(self.started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => Ok(Some(remaining)),
            _ => Err(self.budget_exceeded(budget)),
        }
    }

    /// Await one pipeline call under cancellation, timeout and budget
    async fn guarded<T>(&self, call: impl Future<Output = Result<T, PipelineError>>) -> Result<T, SessionError> {
        if self.cancel.is_cancelled() {
            debug!(loop_state = %self.loop_state, "LoopEngine::guarded: cancelled before call");
            return Err(self.cancelled());
        }

        let call_timeout = self.config.call_timeout();
        let (timeout, budget_bound) = match self.remaining_budget()? {
            Some(remaining) if remaining < call_timeout => (remaining, true),
            _ => (call_timeout, false),
        };

        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(loop_state = %self.loop_state, "LoopEngine::guarded: cancelled during call");
                Err(self.cancelled())
            }
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(self.pipeline_error(e)),
                Err(_) if budget_bound => {
                    let budget = self.config.budget().unwrap_or(timeout);
                    Err(self.budget_exceeded(budget))
                }
                Err(_) => {
                    debug!(?timeout, "LoopEngine::guarded: call timed out");
                    Err(self.pipeline_error(PipelineError::Timeout(timeout)))
                }
            }
        }
    }

    fn pipeline_error(&self, source: PipelineError) -> SessionError {
        SessionError::Pipeline {
            state: self.loop_state,
            iteration: self.iteration,
            source,
            last: Box::new(self.state.clone()),
        }
    }

    fn contract_error(&self, source: ContractError) -> SessionError {
        SessionError::Contract {
            iteration: self.iteration,
            source,
            last: Box::new(self.state.clone()),
        }
    }

    fn cancelled(&self) -> SessionError {
        SessionError::Cancelled {
            state: self.loop_state,
            iteration: self.iteration,
            last: Box::new(self.state.clone()),
        }
    }

    fn budget_exceeded(&self, budget: Duration) -> SessionError {
        warn!(session = %self.session_id, ?budget, "Session budget spent");
        SessionError::MaxIterationsExceeded {
            iterations: self.iteration,
            limit: Limit::Budget(budget),
            last: Box::new(self.state.clone()),
        }
    }
}

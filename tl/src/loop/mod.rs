//! Feedback control loop
//!
//! The engine runs the pipeline once, gates the result on coverage and
//! verdict, and on retry replays only the generation and evaluation stages
//! with the evaluator's feedback until the gate accepts or a limit is hit.

mod cancel;
mod config;
mod engine;
mod gate;
mod resolver;

pub use cancel::{CancelHandle, CancelSignal};
pub use config::{Linkage, LoopConfig};
pub use engine::{GateRecord, Limit, LoopEngine, LoopEvent, LoopState, SessionError};
pub use gate::{GateDecision, QualityGate};
pub use resolver::{ResolveError, StageResolver};

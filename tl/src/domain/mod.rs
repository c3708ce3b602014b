//! Domain types for testloop
//!
//! - [`SessionState`]: the mutable record threaded through one control-loop session
//! - [`Coverage`] / [`Verdict`] / [`Evaluation`]: validated evaluator output
//! - [`StageId`] / [`StageRole`] / [`StageIds`]: opaque handles for targeted replay

mod session;
mod stage;

pub use session::{ContractError, Coverage, Evaluation, EvaluationReport, SessionState, Verdict};
pub use stage::{StageId, StageIds, StageRole};

//! Planning and execution.
//!
//! This module compares declarations with the recorded snapshot, previews
//! the resulting actions, and runs them batch by batch against a backend.

mod convergence;
mod executor;
mod plan;

pub use convergence::{ConvergencePolicy, Decision, Orphan, OrphanReason};
pub use executor::{
    CancelFlag, DEFAULT_CALL_TIMEOUT, PlanExecutor, ResourceAction, ResourceOutcome,
    ResourceStatus, RunReport,
};
pub use plan::{ActionType, DeploymentPlan, PlannedAction};

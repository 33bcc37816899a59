//! Planning and execution.
//!
//! This module compares the declared topology against recorded state,
//! produces an ordered plan of operations, and applies that plan in waves.

mod build;
mod diff;
mod executor;
mod plan;
mod retry;

pub use build::{has_unknowns, Planner};
pub use diff::{DiffEngine, ResourceDiff};
pub use executor::PlanExecutor;
pub use plan::{
    AttributeChange, OperationKind, Plan, PlanSummary, PlannedOperation, ReplaceStrategy,
};
pub use retry::{RetryOutcome, RetryPolicy};

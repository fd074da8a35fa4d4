//! Resource dependency graph.
//!
//! This module provides:
//! - `Stack`: validated declarations and their reference edges
//! - `Scheduler`: depth-ordered batches (`ExecutionPlan`)
//! - `NodeTable`: mutable per-run node state

mod builder;
mod node;
mod scheduler;

pub use builder::Stack;
pub use node::{LookupFailure, NodeState, NodeTable, ResourceNode};
pub use scheduler::{ExecutionPlan, Scheduler};

//! Resource model: typed declarations, values and references.
//!
//! This module defines what a stack is made of:
//! - Resource kinds with their input/output schemas
//! - Input values, including references to other resources' outputs
//! - Declarations and stack-level outputs

mod declaration;
mod kind;
mod value;

pub use declaration::{ResourceDeclaration, StackOutput};
pub use kind::{InputSpec, KindSchema, ResourceKind, ValueType};
pub use value::{Outputs, Reference, ResolvedInputs, Segment, Value};

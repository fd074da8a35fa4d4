//! Stack output resolution.
//!
//! Stack outputs are references into resource outputs. They are read-only
//! and resolve lazily: an output is available as soon as the resource it
//! points at is provisioned.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::OutputError;
use crate::graph::{LookupFailure, NodeState, NodeTable, Stack};
use crate::resource::StackOutput;
use crate::state::StackSnapshot;

/// Resolves stack outputs against a node table.
pub struct OutputResolver;

impl OutputResolver {
    /// Resolves one stack output by name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownOutput` if no output has this name, and
    /// `UnresolvedOutput` if its resource is not provisioned.
    pub fn resolve_one(stack: &Stack, table: &NodeTable, name: &str) -> Result<JsonValue, OutputError> {
        let output = stack
            .outputs()
            .iter()
            .find(|output| output.name == name)
            .ok_or_else(|| OutputError::UnknownOutput {
                name: name.to_string(),
            })?;
        Self::resolve_output(table, output)
    }

    /// Resolves every stack output.
    ///
    /// # Errors
    ///
    /// Returns the first `UnresolvedOutput`.
    pub fn resolve_all(stack: &Stack, table: &NodeTable) -> Result<BTreeMap<String, JsonValue>, OutputError> {
        stack
            .outputs()
            .iter()
            .map(|output| Self::resolve_output(table, output).map(|value| (output.name.clone(), value)))
            .collect()
    }

    /// Resolves every stack output, keeping failures alongside values.
    #[must_use]
    pub fn resolve_each(stack: &Stack, table: &NodeTable) -> Vec<(String, Result<JsonValue, OutputError>)> {
        stack
            .outputs()
            .iter()
            .map(|output| (output.name.clone(), Self::resolve_output(table, output)))
            .collect()
    }

    /// Resolves outputs from a saved snapshot.
    #[must_use]
    pub fn from_snapshot(stack: &Stack, snapshot: &StackSnapshot) -> Vec<(String, Result<JsonValue, OutputError>)> {
        let mut table = NodeTable::from_stack(stack);
        table.restore_from(snapshot);
        Self::resolve_each(stack, &table)
    }

    fn resolve_output(table: &NodeTable, output: &StackOutput) -> Result<JsonValue, OutputError> {
        let reference = &output.value;
        table.output(reference).cloned().map_err(|failure| {
            let state = match failure {
                LookupFailure::NotProvisioned(state) => state.to_string(),
                LookupFailure::UnknownResource => "undeclared".to_string(),
                LookupFailure::MissingOutput => {
                    format!("{} without output '{}'", NodeState::Provisioned, reference.output)
                }
            };
            OutputError::UnresolvedOutput {
                name: output.name.clone(),
                resource: reference.resource.clone(),
                state,
            }
        })
    }
}

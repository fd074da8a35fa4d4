//! Per-run node state.
//!
//! The `Stack` is immutable; everything that changes during a run lives in a
//! `NodeTable`. Each node is written by exactly one task.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use super::builder::Stack;
use crate::error::ExecutionError;
use crate::resource::{Outputs, Reference, ResolvedInputs, ResourceDeclaration};
use crate::state::StackSnapshot;

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Not yet started.
    Pending,
    /// Inputs are being resolved or the backend call is in flight.
    Resolving,
    /// Provisioned, outputs recorded.
    Provisioned,
    /// The backend call failed.
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Resolving => write!(f, "Resolving"),
            Self::Provisioned => write!(f, "Provisioned"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A resource and its run state.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// The declaration this node tracks.
    pub declaration: ResourceDeclaration,
    /// Physical identifier, once known.
    pub physical_id: Option<String>,
    /// Inputs with all references substituted.
    pub resolved_inputs: Option<ResolvedInputs>,
    /// Outputs recorded after provisioning.
    pub outputs: Outputs,
    /// Current state.
    pub state: NodeState,
    /// Failure message, if any.
    pub error: Option<String>,
}

impl ResourceNode {
    /// Creates a pending node.
    #[must_use]
    pub fn new(declaration: ResourceDeclaration) -> Self {
        Self {
            declaration,
            physical_id: None,
            resolved_inputs: None,
            outputs: Outputs::new(),
            state: NodeState::Pending,
            error: None,
        }
    }

    /// Marks the node as resolving with its substituted inputs.
    pub fn mark_resolving(&mut self, inputs: ResolvedInputs) {
        self.resolved_inputs = Some(inputs);
        self.state = NodeState::Resolving;
    }

    /// Marks the node as provisioned.
    pub fn mark_provisioned(&mut self, physical_id: String, outputs: Outputs) {
        self.physical_id = Some(physical_id);
        self.outputs = outputs;
        self.state = NodeState::Provisioned;
        self.error = None;
    }

    /// Marks the node as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = NodeState::Failed;
        self.error = Some(error.into());
    }

    /// Returns true if the node is provisioned.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.state == NodeState::Provisioned
    }
}

/// Why an output could not be read from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFailure {
    /// No node with this id.
    UnknownResource,
    /// The node exists but is not provisioned.
    NotProvisioned(NodeState),
    /// The node is provisioned but did not record this output.
    MissingOutput,
}

/// All nodes of one run, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    nodes: BTreeMap<String, ResourceNode>,
}

impl NodeTable {
    /// Creates a table with every stack resource pending.
    #[must_use]
    pub fn from_stack(stack: &Stack) -> Self {
        Self {
            nodes: stack
                .declarations()
                .map(|decl| (decl.id.clone(), ResourceNode::new(decl.clone())))
                .collect(),
        }
    }

    /// Marks nodes provisioned from a snapshot's records.
    ///
    /// Records whose kind no longer matches the declaration are skipped.
    pub fn restore_from(&mut self, snapshot: &StackSnapshot) {
        for (id, node) in &mut self.nodes {
            if let Some(record) = snapshot.resources.get(id) {
                if record.kind == node.declaration.kind {
                    node.resolved_inputs = Some(record.resolved_inputs.clone());
                    node.mark_provisioned(record.physical_id.clone(), record.outputs.clone());
                }
            }
        }
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Looks up a node mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut ResourceNode> {
        self.nodes.get_mut(id)
    }

    /// Returns the state of a node.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|node| node.state)
    }

    /// Iterates over nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Reads a recorded output.
    ///
    /// # Errors
    ///
    /// Returns why the output is not available yet.
    pub fn output(&self, reference: &Reference) -> Result<&JsonValue, LookupFailure> {
        let node = self
            .nodes
            .get(&reference.resource)
            .ok_or(LookupFailure::UnknownResource)?;
        if !node.is_provisioned() {
            return Err(LookupFailure::NotProvisioned(node.state));
        }
        node.outputs
            .get(&reference.output)
            .ok_or(LookupFailure::MissingOutput)
    }

    /// Substitutes every reference in a declaration's inputs.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` if a referenced resource is not provisioned.
    pub fn resolve_inputs(
        &self,
        declaration: &ResourceDeclaration,
    ) -> Result<ResolvedInputs, ExecutionError> {
        let lookup = |reference: &Reference| {
            self.output(reference)
                .cloned()
                .map_err(|_| ExecutionError::OrderingViolation {
                    resource: declaration.id.clone(),
                    dependency: reference.to_string(),
                })
        };

        declaration
            .inputs
            .iter()
            .map(|(name, value)| value.resolve(&lookup).map(|v| (name.clone(), v)))
            .collect()
    }
}

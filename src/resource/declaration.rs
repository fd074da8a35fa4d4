//! Resource declarations and stack outputs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::kind::{KindSchema, ResourceKind};
use super::value::{Reference, Value};

/// A declared unit of infrastructure.
///
/// Declarations are authored once and never mutated after the stack graph
/// is built. Dependencies are inferred from the references in `inputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    /// Unique id within the stack.
    pub id: String,
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Declared inputs.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

/// A named value exposed by the stack once its source resource is provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    /// Output name.
    pub name: String,
    /// The resource output it exposes.
    pub value: Reference,
    /// Optional description shown by `thot outputs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ResourceDeclaration {
    /// Creates a declaration with no inputs.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            inputs: BTreeMap::new(),
        }
    }

    /// Adds an input.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    /// Returns the schema of this declaration's kind.
    #[must_use]
    pub const fn schema(&self) -> &'static KindSchema {
        self.kind.schema()
    }

    /// Returns every `(input name, reference)` pair, in input order.
    #[must_use]
    pub fn references(&self) -> Vec<(&str, &Reference)> {
        self.inputs
            .iter()
            .flat_map(|(name, value)| {
                value
                    .references()
                    .into_iter()
                    .map(move |reference| (name.as_str(), reference))
            })
            .collect()
    }

    /// Returns the ids of the resources this declaration depends on.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.references()
            .into_iter()
            .map(|(_, reference)| reference.resource.as_str())
            .collect()
    }
}

impl StackOutput {
    /// Creates a stack output.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Reference) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_are_inferred_from_references() {
        let policy = ResourceDeclaration::new("p1", ResourceKind::BucketPolicy)
            .with_input("bucket", Value::reference("b1", "bucketName"))
            .with_input("principal", Value::reference("i1", "canonicalUserId"))
            .with_input(
                "resources",
                Value::List(vec![Value::parse("${b1.arn}/*").unwrap()]),
            )
            .with_input("actions", Value::List(vec![Value::literal("s3:GetObject")]));

        let deps: Vec<&str> = policy.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["b1", "i1"]);
        assert_eq!(policy.references().len(), 3);
    }

    #[test]
    fn test_declaration_parses_from_yaml() {
        let yaml = r"
id: site-bucket
kind: bucket
inputs:
  bucketName: thot-site.com
  publicReadAccess: true
";
        let decl: ResourceDeclaration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decl.kind, ResourceKind::Bucket);
        assert_eq!(decl.inputs["publicReadAccess"], Value::Bool(true));
        assert!(decl.dependencies().is_empty());
    }

    #[test]
    fn test_stack_output_requires_reference() {
        let ok: Result<StackOutput, _> = serde_yaml::from_str("name: TheUrl\nvalue: ${api-url.url}\n");
        assert_eq!(ok.unwrap().value, Reference::new("api-url", "url"));

        let bad: Result<StackOutput, _> = serde_yaml::from_str("name: TheUrl\nvalue: plain\n");
        assert!(bad.is_err());
    }
}

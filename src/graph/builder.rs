//! Stack graph construction.
//!
//! Turns a set of resource declarations into a validated dependency graph.
//! Every reference found in a declaration's inputs adds an edge from the
//! referenced resource to the declaring resource.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::GraphError;
use crate::resource::{Reference, ResourceDeclaration, StackOutput};

/// A validated, acyclic stack of resources.
///
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct Stack {
    /// Declarations by id.
    declarations: BTreeMap<String, ResourceDeclaration>,
    /// Edges as `(dependency, dependent)`.
    edges: BTreeSet<(String, String)>,
    /// Stack-level outputs.
    outputs: Vec<StackOutput>,
}

impl Stack {
    /// Builds and validates a stack graph.
    ///
    /// Checks run in this order: duplicate ids, input schemas, references
    /// (including stack outputs), then cycles.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResourceId`, `UnknownInput`, `MissingInput`,
    /// `InputTypeMismatch`, `DanglingReference` or `CyclicDependency`.
    pub fn build(
        declarations: Vec<ResourceDeclaration>,
        outputs: Vec<StackOutput>,
    ) -> Result<Self, GraphError> {
        let mut by_id = BTreeMap::new();
        for decl in declarations {
            if by_id.contains_key(&decl.id) {
                return Err(GraphError::DuplicateResourceId { id: decl.id });
            }
            by_id.insert(decl.id.clone(), decl);
        }

        for decl in by_id.values() {
            check_schema(decl)?;
        }

        let mut edges = BTreeSet::new();
        for decl in by_id.values() {
            for (input, reference) in decl.references() {
                check_reference(&by_id, &decl.id, input, reference)?;
                edges.insert((reference.resource.clone(), decl.id.clone()));
            }
        }

        for output in &outputs {
            check_reference(&by_id, "outputs", &output.name, &output.value)?;
        }

        let mut adjacency: BTreeMap<&str, BTreeSet<&str>> =
            by_id.keys().map(|id| (id.as_str(), BTreeSet::new())).collect();
        for (from, to) in &edges {
            adjacency.entry(from.as_str()).or_default().insert(to.as_str());
        }
        if let Some(cycle) = find_cycle(&adjacency) {
            return Err(GraphError::CyclicDependency { cycle });
        }

        debug!(
            "Built stack graph with {} resources and {} edges",
            by_id.len(),
            edges.len()
        );

        Ok(Self {
            declarations: by_id,
            edges,
            outputs,
        })
    }

    /// Returns the declarations in id order.
    pub fn declarations(&self) -> impl Iterator<Item = &ResourceDeclaration> {
        self.declarations.values()
    }

    /// Looks up a declaration by id.
    #[must_use]
    pub fn declaration(&self, id: &str) -> Option<&ResourceDeclaration> {
        self.declarations.get(id)
    }

    /// Returns true if the stack declares this id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.declarations.contains_key(id)
    }

    /// Returns all edges as `(dependency, dependent)`.
    #[must_use]
    pub const fn edges(&self) -> &BTreeSet<(String, String)> {
        &self.edges
    }

    /// Returns the ids `id` depends on.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> BTreeSet<&str> {
        self.edges
            .iter()
            .filter(|(_, to)| to == id)
            .map(|(from, _)| from.as_str())
            .collect()
    }

    /// Returns the ids that depend on `id`.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> BTreeSet<&str> {
        self.edges
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, to)| to.as_str())
            .collect()
    }

    /// Returns a map of every id to the ids it depends on.
    #[must_use]
    pub fn dependency_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut map: BTreeMap<String, BTreeSet<String>> = self
            .declarations
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (from, to) in &self.edges {
            map.entry(to.clone()).or_default().insert(from.clone());
        }
        map
    }

    /// Returns the stack outputs.
    #[must_use]
    pub fn outputs(&self) -> &[StackOutput] {
        &self.outputs
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Returns true if the stack declares no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

/// Validates a declaration's inputs against its kind schema.
fn check_schema(decl: &ResourceDeclaration) -> Result<(), GraphError> {
    let schema = decl.schema();

    for (name, value) in &decl.inputs {
        let Some(spec) = schema.input(name) else {
            return Err(GraphError::UnknownInput {
                resource: decl.id.clone(),
                kind: decl.kind.to_string(),
                input: name.clone(),
            });
        };
        if !spec.ty.accepts(value) {
            return Err(GraphError::InputTypeMismatch {
                resource: decl.id.clone(),
                input: name.clone(),
                expected: spec.ty.name().to_string(),
                found: value.type_name().to_string(),
            });
        }
    }

    if let Some(missing) = schema
        .required_inputs()
        .find(|spec| !decl.inputs.contains_key(spec.name))
    {
        return Err(GraphError::MissingInput {
            resource: decl.id.clone(),
            kind: decl.kind.to_string(),
            input: missing.name.to_string(),
        });
    }

    Ok(())
}

/// Checks that a reference targets a declared resource and a guaranteed output.
fn check_reference(
    declarations: &BTreeMap<String, ResourceDeclaration>,
    holder: &str,
    input: &str,
    reference: &Reference,
) -> Result<(), GraphError> {
    let dangling = |reason: String| GraphError::DanglingReference {
        resource: holder.to_string(),
        input: input.to_string(),
        reference: reference.to_string(),
        reason,
    };

    let target = declarations
        .get(&reference.resource)
        .ok_or_else(|| dangling(format!("no resource with id '{}'", reference.resource)))?;

    if !target.schema().has_output(&reference.output) {
        return Err(dangling(format!(
            "{} resources have no output '{}'",
            target.kind, reference.output
        )));
    }

    Ok(())
}

/// Depth-first search with a recursion stack.
///
/// Returns the first cycle found, as a path whose last element repeats the
/// first. Nodes and neighbours are visited in lexicographic order so the
/// reported cycle is deterministic.
pub(crate) fn find_cycle(adjacency: &BTreeMap<&str, BTreeSet<&str>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        adjacency: &BTreeMap<&'a str, BTreeSet<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Visiting);
        path.push(node);

        if let Some(next) = adjacency.get(node) {
            for &neighbour in next {
                match marks.get(neighbour) {
                    Some(Mark::Visiting) => {
                        let start = path.iter().position(|&n| n == neighbour).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|n| (*n).to_string()).collect();
                        cycle.push(neighbour.to_string());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        if let Some(cycle) = visit(neighbour, adjacency, marks, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    let mut path = Vec::new();
    for &node in adjacency.keys() {
        if !marks.contains_key(node) {
            if let Some(cycle) = visit(node, adjacency, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceKind, Value};

    fn bucket(id: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(id, ResourceKind::Bucket).with_input("bucketName", Value::literal(id))
    }

    fn identity(id: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(id, ResourceKind::OriginAccessIdentity)
    }

    fn function_url(id: &str, function: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(id, ResourceKind::FunctionUrl)
            .with_input("function", Value::reference(function, "urlId"))
    }

    #[test]
    fn test_edges_follow_references() {
        let policy = ResourceDeclaration::new("p1", ResourceKind::BucketPolicy)
            .with_input("bucket", Value::reference("b1", "bucketName"))
            .with_input("principal", Value::reference("i1", "canonicalUserId"))
            .with_input("actions", Value::List(vec![Value::literal("s3:GetObject")]))
            .with_input("resources", Value::List(vec![Value::parse("${b1.arn}/*").unwrap()]));

        let stack = Stack::build(vec![policy, bucket("b1"), identity("i1")], vec![]).unwrap();

        assert_eq!(stack.len(), 3);
        assert_eq!(stack.dependencies_of("p1").into_iter().collect::<Vec<_>>(), vec!["b1", "i1"]);
        assert_eq!(stack.dependents_of("b1").into_iter().collect::<Vec<_>>(), vec!["p1"]);
        assert!(stack.dependencies_of("b1").is_empty());
    }

    #[test]
    fn test_isolated_resource_is_valid() {
        let stack = Stack::build(vec![identity("lonely")], vec![]).unwrap();
        assert!(stack.edges().is_empty());
        assert!(stack.contains("lonely"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = Stack::build(vec![bucket("b1"), bucket("b1")], vec![]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateResourceId { id: "b1".into() });
    }

    #[test]
    fn test_reference_to_missing_resource_is_dangling() {
        let url = ResourceDeclaration::new("u1", ResourceKind::FunctionUrl)
            .with_input("function", Value::reference("nope", "functionName"));
        let err = Stack::build(vec![url], vec![]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { ref reference, .. } if reference == "nope.functionName"));
    }

    #[test]
    fn test_reference_to_missing_output_is_dangling() {
        let policy = ResourceDeclaration::new("p1", ResourceKind::BucketPolicy)
            .with_input("bucket", Value::reference("b1", "websiteUrl"))
            .with_input("principal", Value::literal("*"))
            .with_input("actions", Value::List(vec![]))
            .with_input("resources", Value::List(vec![]));
        let err = Stack::build(vec![bucket("b1"), policy], vec![]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { ref input, .. } if input == "bucket"));
    }

    #[test]
    fn test_stack_output_reference_is_checked() {
        let err = Stack::build(
            vec![bucket("b1")],
            vec![StackOutput::new("TheUrl", Reference::new("b1", "url"))],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { ref resource, .. } if resource == "outputs"));
    }

    #[test]
    fn test_cycle_is_detected_and_named() {
        let err = Stack::build(vec![function_url("a", "b"), function_url("b", "a")], vec![]).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = Stack::build(vec![function_url("a", "a")], vec![]).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { .. }));
    }

    #[test]
    fn test_schema_violations() {
        let unknown = bucket("b1").with_input("colour", Value::literal("blue"));
        assert!(matches!(
            Stack::build(vec![unknown], vec![]).unwrap_err(),
            GraphError::UnknownInput { .. }
        ));

        let missing = ResourceDeclaration::new("b1", ResourceKind::Bucket);
        assert!(matches!(
            Stack::build(vec![missing], vec![]).unwrap_err(),
            GraphError::MissingInput { .. }
        ));

        let mistyped = bucket("b1").with_input("publicReadAccess", Value::literal("yes"));
        assert!(matches!(
            Stack::build(vec![mistyped], vec![]).unwrap_err(),
            GraphError::InputTypeMismatch { .. }
        ));
    }
}

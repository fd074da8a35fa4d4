//! Topological scheduling of a stack into ordered batches.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::builder::{Stack, find_cycle};
use crate::config::ConfigHasher;
use crate::error::GraphError;

/// Ordered batches of resource ids.
///
/// No edge connects two ids of the same batch, and every dependency sits in
/// a strictly earlier batch than its dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    batches: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Returns the batches in execution order.
    #[must_use]
    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Returns the number of batches.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Returns the total number of scheduled resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Returns the index of the batch holding `id`.
    #[must_use]
    pub fn batch_of(&self, id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|candidate| candidate == id))
    }

    /// Iterates over all ids in execution order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().flatten().map(String::as_str)
    }

    /// Returns the same batches in reverse order, for teardown.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            batches: self.batches.iter().rev().cloned().collect(),
        }
    }

    /// Returns a sha256 fingerprint of the batches.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        ConfigHasher::hash_plan(&self.batches)
    }

    #[cfg(test)]
    pub(crate) fn from_batches(batches: Vec<Vec<&str>>) -> Self {
        Self {
            batches: batches
                .into_iter()
                .map(|batch| batch.into_iter().map(str::to_string).collect())
                .collect(),
        }
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, batch) in self.batches.iter().enumerate() {
            writeln!(f, "batch {index}: [{}]", batch.join(", "))?;
        }
        Ok(())
    }
}

/// Builds execution plans.
pub struct Scheduler;

impl Scheduler {
    /// Schedules a validated stack.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the edges are not acyclic. A `Stack` is
    /// checked at build time, so this only fires for hand-made inputs.
    pub fn schedule(stack: &Stack) -> Result<ExecutionPlan, GraphError> {
        Self::schedule_dependencies(&stack.dependency_map())
    }

    /// Schedules an arbitrary map of `id -> ids it depends on`.
    ///
    /// Dependencies that are not keys of the map are ignored, which lets a
    /// subset of a stack (for example a set of orphans) be scheduled on its own.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` naming a cycle if one exists.
    pub fn schedule_dependencies(
        dependencies: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<ExecutionPlan, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (id, deps) in dependencies {
            let known: Vec<&str> = deps
                .iter()
                .map(String::as_str)
                .filter(|dep| dependencies.contains_key(*dep))
                .collect();
            in_degree.insert(id.as_str(), known.len());
            dependents.entry(id.as_str()).or_default();
            for dep in known {
                dependents.entry(dep).or_default().insert(id.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        let mut visited = 0usize;

        while let Some(id) = ready.pop_first() {
            visited += 1;
            let level = *depth.entry(id).or_insert(0);

            for &next in dependents.get(id).into_iter().flatten() {
                let next_level = depth.entry(next).or_insert(0);
                *next_level = (*next_level).max(level + 1);

                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if visited < dependencies.len() {
            let remaining: BTreeMap<&str, BTreeSet<&str>> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| {
                    let next = dependents
                        .get(id)
                        .map(|set| {
                            set.iter()
                                .copied()
                                .filter(|n| in_degree.get(n).is_some_and(|d| *d > 0))
                                .collect::<BTreeSet<&str>>()
                        })
                        .unwrap_or_default();
                    (*id, next)
                })
                .collect();
            let cycle = find_cycle(&remaining)
                .unwrap_or_else(|| remaining.keys().map(|id| (*id).to_string()).collect());
            return Err(GraphError::CyclicDependency { cycle });
        }

        let mut grouped: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (id, level) in depth {
            grouped.entry(level).or_default().push(id.to_string());
        }
        let batches = grouped
            .into_values()
            .map(|mut batch| {
                batch.sort();
                batch
            })
            .collect();

        Ok(ExecutionPlan { batches })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceDeclaration, ResourceKind, Value};

    fn scenario() -> Vec<ResourceDeclaration> {
        vec![
            ResourceDeclaration::new("dep1", ResourceKind::BucketDeployment)
                .with_input("source", "./public")
                .with_input("destinationBucket", Value::reference("b1", "bucketName"))
                .with_input("distributionId", Value::reference("d1", "distributionId")),
            ResourceDeclaration::new("d1", ResourceKind::Distribution)
                .with_input("originDomainName", Value::reference("b1", "regionalDomainName"))
                .with_input("originAccessIdentity", Value::reference("i1", "identityId"))
                .with_input("certificateArn", "arn:aws:acm:us-east-1:123:certificate/x"),
            ResourceDeclaration::new("p1", ResourceKind::BucketPolicy)
                .with_input("bucket", Value::reference("b1", "bucketName"))
                .with_input("principal", Value::reference("i1", "canonicalUserId"))
                .with_input("actions", Value::List(vec![Value::literal("s3:GetObject")]))
                .with_input("resources", Value::List(vec![Value::parse("${b1.arn}/*").unwrap()])),
            ResourceDeclaration::new("i1", ResourceKind::OriginAccessIdentity),
            ResourceDeclaration::new("b1", ResourceKind::Bucket).with_input("bucketName", "thot-site.com"),
        ]
    }

    fn ids(batches: &[Vec<String>]) -> Vec<Vec<&str>> {
        batches
            .iter()
            .map(|batch| batch.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_scenario_batches() {
        let stack = Stack::build(scenario(), vec![]).unwrap();
        let plan = Scheduler::schedule(&stack).unwrap();

        assert_eq!(
            ids(plan.batches()),
            vec![vec!["b1", "i1"], vec!["d1", "p1"], vec!["dep1"]]
        );
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.batch_of("dep1"), Some(2));
    }

    #[test]
    fn test_every_edge_goes_forward() {
        let stack = Stack::build(scenario(), vec![]).unwrap();
        let plan = Scheduler::schedule(&stack).unwrap();

        for (from, to) in stack.edges() {
            assert!(plan.batch_of(from).unwrap() < plan.batch_of(to).unwrap(), "{from} -> {to}");
        }
    }

    #[test]
    fn test_plan_is_deterministic() {
        let first = Scheduler::schedule(&Stack::build(scenario(), vec![]).unwrap()).unwrap();
        let mut shuffled = scenario();
        shuffled.reverse();
        let second = Scheduler::schedule(&Stack::build(shuffled, vec![]).unwrap()).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_depth_is_longest_path() {
        // a -> b -> c and a -> c: c must land at depth 2, not 1.
        let mut deps = BTreeMap::new();
        deps.insert("a".to_string(), BTreeSet::new());
        deps.insert("b".to_string(), BTreeSet::from(["a".to_string()]));
        deps.insert("c".to_string(), BTreeSet::from(["a".to_string(), "b".to_string()]));

        let plan = Scheduler::schedule_dependencies(&deps).unwrap();
        assert_eq!(ids(plan.batches()), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_unknown_dependencies_are_ignored() {
        let mut deps = BTreeMap::new();
        deps.insert("x".to_string(), BTreeSet::from(["gone".to_string()]));
        let plan = Scheduler::schedule_dependencies(&deps).unwrap();
        assert_eq!(ids(plan.batches()), vec![vec!["x"]]);
    }

    #[test]
    fn test_cycle_in_raw_map_is_reported() {
        let mut deps = BTreeMap::new();
        deps.insert("a".to_string(), BTreeSet::from(["b".to_string()]));
        deps.insert("b".to_string(), BTreeSet::from(["a".to_string()]));
        deps.insert("c".to_string(), BTreeSet::new());

        let err = Scheduler::schedule_dependencies(&deps).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { ref cycle } if cycle.len() == 3));
    }

    #[test]
    fn test_reversed_and_display() {
        let stack = Stack::build(scenario(), vec![]).unwrap();
        let plan = Scheduler::schedule(&stack).unwrap();
        let reversed = plan.reversed();

        assert_eq!(ids(reversed.batches())[0], vec!["dep1"]);
        assert_eq!(plan.to_string().lines().next(), Some("batch 0: [b1, i1]"));
    }
}

//! Convergence policy.
//!
//! Decides, per resource, whether a run must create it, update it in place,
//! or leave it alone, by comparing resolved inputs with the prior snapshot.
//! Recorded resources that no longer match a declaration are orphans; they
//! are reported and only removed on explicit request.

use serde::Serialize;
use std::fmt;

use crate::graph::Stack;
use crate::resource::ResourceKind;
use crate::state::{ResourceRecord, StackSnapshot};

/// What a run does with one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// No usable prior record: create.
    Create,
    /// Resolved inputs changed: update the existing resource.
    Update {
        /// Physical id of the existing resource.
        physical_id: String,
    },
    /// Resolved inputs unchanged: reuse the recorded outputs.
    NoOp,
}

/// Why a recorded resource is orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// The id is no longer declared.
    RemovedFromStack,
    /// The id is declared with a different kind and gets a new resource.
    KindChanged,
}

/// A recorded resource with no matching declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Orphan {
    /// Resource id.
    pub id: String,
    /// Recorded kind.
    pub kind: ResourceKind,
    /// Backend identifier.
    pub physical_id: String,
    /// Why it is orphaned.
    pub reason: OrphanReason,
}

/// Stateless convergence rules.
pub struct ConvergencePolicy;

impl ConvergencePolicy {
    /// Decides what to do with a resource given its prior record.
    #[must_use]
    pub fn decide(prior: Option<&ResourceRecord>, kind: ResourceKind, inputs_hash: &str) -> Decision {
        match prior {
            None => Decision::Create,
            Some(record) if record.kind != kind => Decision::Create,
            Some(record) if record.inputs_hash == inputs_hash => Decision::NoOp,
            Some(record) => Decision::Update {
                physical_id: record.physical_id.clone(),
            },
        }
    }

    /// Lists every orphan of `snapshot` with respect to `stack`.
    ///
    /// Includes records already retired by an earlier kind change.
    #[must_use]
    pub fn orphans(stack: &Stack, snapshot: &StackSnapshot) -> Vec<Orphan> {
        let live = snapshot.resources.values().filter_map(|record| {
            let reason = match stack.declaration(&record.id) {
                None => OrphanReason::RemovedFromStack,
                Some(decl) if decl.kind != record.kind => OrphanReason::KindChanged,
                Some(_) => return None,
            };
            Some(Orphan::from_record(record, reason))
        });

        let retired = snapshot
            .retired
            .iter()
            .map(|record| Orphan::from_record(record, OrphanReason::KindChanged));

        live.chain(retired).collect()
    }
}

impl Orphan {
    fn from_record(record: &ResourceRecord, reason: OrphanReason) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind,
            physical_id: record.physical_id.clone(),
            reason,
        }
    }
}

impl fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemovedFromStack => write!(f, "removed from stack"),
            Self::KindChanged => write!(f, "kind changed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Outputs, ResolvedInputs, ResourceDeclaration};
    use crate::test_support::scenario_stack;
    use std::collections::BTreeSet;

    fn record(id: &str, kind: ResourceKind, hash_source: &str) -> ResourceRecord {
        let mut inputs = ResolvedInputs::new();
        inputs.insert("k".into(), serde_json::json!(hash_source));
        ResourceRecord::new(id, kind, format!("{id}-phys"), inputs, Outputs::new(), BTreeSet::new())
    }

    #[test]
    fn test_decisions() {
        let prior = record("b1", ResourceKind::Bucket, "a");

        assert_eq!(ConvergencePolicy::decide(None, ResourceKind::Bucket, "x"), Decision::Create);
        assert_eq!(
            ConvergencePolicy::decide(Some(&prior), ResourceKind::Bucket, &prior.inputs_hash),
            Decision::NoOp
        );
        assert_eq!(
            ConvergencePolicy::decide(Some(&prior), ResourceKind::Bucket, "different"),
            Decision::Update {
                physical_id: "b1-phys".into()
            }
        );
        assert_eq!(
            ConvergencePolicy::decide(Some(&prior), ResourceKind::Function, &prior.inputs_hash),
            Decision::Create
        );
    }

    #[test]
    fn test_orphans() {
        let stack = scenario_stack();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        snapshot.record(record("b1", ResourceKind::Bucket, "a"));
        snapshot.record(record("old-fn", ResourceKind::Function, "a"));
        snapshot.record(record("i1", ResourceKind::Certificate, "a"));
        snapshot.record(record("gone", ResourceKind::FunctionUrl, "a"));
        snapshot.retire("gone");

        let orphans = ConvergencePolicy::orphans(&stack, &snapshot);
        let summary: Vec<(&str, OrphanReason)> =
            orphans.iter().map(|o| (o.id.as_str(), o.reason)).collect();

        assert_eq!(
            summary,
            vec![
                ("i1", OrphanReason::KindChanged),
                ("old-fn", OrphanReason::RemovedFromStack),
                ("gone", OrphanReason::KindChanged),
            ]
        );
    }

    #[test]
    fn test_no_orphans_when_snapshot_matches() {
        let stack = Stack::build(
            vec![ResourceDeclaration::new("i1", ResourceKind::OriginAccessIdentity)],
            vec![],
        )
        .unwrap();
        let mut snapshot = StackSnapshot::new("s", "dev");
        snapshot.record(record("i1", ResourceKind::OriginAccessIdentity, "a"));
        assert!(ConvergencePolicy::orphans(&stack, &snapshot).is_empty());
    }
}

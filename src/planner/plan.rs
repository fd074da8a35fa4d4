//! Plan preview.
//!
//! A `DeploymentPlan` says what an apply would do without calling the
//! backend: one action per resource, in batch order, plus the orphans.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

use super::convergence::{ConvergencePolicy, Decision, Orphan};
use crate::config::ConfigHasher;
use crate::graph::{ExecutionPlan, NodeTable, Stack};
use crate::resource::{ResolvedInputs, ResourceDeclaration, ResourceKind};
use crate::state::StackSnapshot;

/// A previewed deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the declarations this plan was built from.
    pub config_hash: String,
    /// Fingerprint of the batch layout.
    pub fingerprint: String,
    /// Execution batches.
    pub batches: ExecutionPlan,
    /// One action per declared resource, in execution order.
    pub actions: Vec<PlannedAction>,
    /// Recorded resources no longer matching a declaration.
    pub orphans: Vec<Orphan>,
}

/// A single previewed action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Resource id.
    pub resource: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Batch the resource runs in.
    pub batch: usize,
    /// What will happen.
    pub action_type: ActionType,
    /// Existing physical id, for updates and no-ops.
    pub physical_id: Option<String>,
    /// Human-readable reason.
    pub reason: String,
    /// Inputs whose resolved value changed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_inputs: Vec<String>,
}

/// Types of previewed actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource.
    Create,
    /// Update an existing resource.
    Update,
    /// Nothing to do.
    NoOp,
}

impl DeploymentPlan {
    /// Builds the preview of applying `stack` over `snapshot`.
    ///
    /// Resources downstream of a create or update are shown as updates when
    /// their inputs cannot be known until the upstream call returns.
    #[must_use]
    pub fn build(stack: &Stack, plan: &ExecutionPlan, snapshot: Option<&StackSnapshot>) -> Self {
        let mut table = NodeTable::from_stack(stack);
        if let Some(snapshot) = snapshot {
            table.restore_from(snapshot);
        }

        let mut changing: BTreeSet<&str> = BTreeSet::new();
        let mut actions = Vec::with_capacity(plan.len());

        for (batch, ids) in plan.batches().iter().enumerate() {
            for id in ids {
                let Some(decl) = stack.declaration(id) else {
                    continue;
                };
                let prior = snapshot.and_then(|s| s.get(id));
                let upstream_changing = stack
                    .dependencies_of(id)
                    .iter()
                    .any(|dep| changing.contains(dep));

                let action = match prior {
                    None => PlannedAction::new(decl, batch, ActionType::Create, "new resource"),
                    Some(record) if record.kind != decl.kind => PlannedAction::new(
                        decl,
                        batch,
                        ActionType::Create,
                        format!("kind changed from {}", record.kind),
                    ),
                    Some(record) if upstream_changing => PlannedAction {
                        physical_id: Some(record.physical_id.clone()),
                        ..PlannedAction::new(
                            decl,
                            batch,
                            ActionType::Update,
                            "inputs known after apply",
                        )
                    },
                    Some(record) => match table.resolve_inputs(decl) {
                        Ok(inputs) => {
                            let hash = ConfigHasher::hash_inputs(&inputs);
                            match ConvergencePolicy::decide(Some(record), decl.kind, &hash) {
                                Decision::NoOp => PlannedAction {
                                    physical_id: Some(record.physical_id.clone()),
                                    ..PlannedAction::new(decl, batch, ActionType::NoOp, "unchanged")
                                },
                                Decision::Update { physical_id } => {
                                    let changed = changed_inputs(&record.resolved_inputs, &inputs);
                                    PlannedAction {
                                        physical_id: Some(physical_id),
                                        reason: format!("changed: {}", changed.join(", ")),
                                        changed_inputs: changed,
                                        ..PlannedAction::new(decl, batch, ActionType::Update, "")
                                    }
                                }
                                Decision::Create => {
                                    PlannedAction::new(decl, batch, ActionType::Create, "new resource")
                                }
                            }
                        }
                        Err(_) => PlannedAction {
                            physical_id: Some(record.physical_id.clone()),
                            ..PlannedAction::new(
                                decl,
                                batch,
                                ActionType::Update,
                                "inputs known after apply",
                            )
                        },
                    },
                };

                if action.action_type != ActionType::NoOp {
                    changing.insert(id.as_str());
                }
                actions.push(action);
            }
        }

        let declarations: Vec<ResourceDeclaration> = stack.declarations().cloned().collect();
        Self {
            created_at: Utc::now(),
            config_hash: ConfigHasher::hash_declarations(&declarations, stack.outputs()),
            fingerprint: plan.fingerprint(),
            batches: plan.clone(),
            actions,
            orphans: snapshot.map_or_else(Vec::new, |s| ConvergencePolicy::orphans(stack, s)),
        }
    }

    /// Returns true if applying would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.action_type != ActionType::NoOp)
    }

    /// Counts actions of one type.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Looks up the action for a resource.
    #[must_use]
    pub fn action(&self, resource: &str) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| a.resource == resource)
    }

    /// Returns a one-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Plan: {} to create, {} to update, {} unchanged, {} orphaned",
            self.count(ActionType::Create),
            self.count(ActionType::Update),
            self.count(ActionType::NoOp),
            self.orphans.len()
        )
    }
}

impl PlannedAction {
    fn new(
        decl: &ResourceDeclaration,
        batch: usize,
        action_type: ActionType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            resource: decl.id.clone(),
            kind: decl.kind,
            batch,
            action_type,
            physical_id: None,
            reason: reason.into(),
            changed_inputs: Vec::new(),
        }
    }
}

fn changed_inputs(before: &ResolvedInputs, after: &ResolvedInputs) -> Vec<String> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    names
        .into_iter()
        .filter(|name| before.get(*name) != after.get(*name))
        .cloned()
        .collect()
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for action in &self.actions {
            writeln!(
                f,
                "[{}] {:<8} {} ({}): {}",
                action.batch, action.action_type, action.resource, action.kind, action.reason
            )?;
        }
        for orphan in &self.orphans {
            writeln!(
                f,
                "    ORPHAN   {} ({}): {}",
                orphan.id, orphan.kind, orphan.reason
            )?;
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Scheduler;
    use crate::resource::{Outputs, ResourceDeclaration};
    use crate::state::ResourceRecord;
    use crate::test_support::{scenario, scenario_outputs, scenario_stack};
    use serde_json::json;

    fn preview(stack: &Stack, snapshot: Option<&StackSnapshot>) -> DeploymentPlan {
        let plan = Scheduler::schedule(stack).unwrap();
        DeploymentPlan::build(stack, &plan, snapshot)
    }

    fn oai_record(comment: &str) -> ResourceRecord {
        let mut inputs = ResolvedInputs::new();
        inputs.insert("comment".into(), json!(comment));
        let mut outputs = Outputs::new();
        outputs.insert("identityId".into(), json!("EOAI"));
        outputs.insert("canonicalUserId".into(), json!("canon"));
        ResourceRecord::new(
            "i1",
            ResourceKind::OriginAccessIdentity,
            "EOAI".into(),
            inputs,
            outputs,
            BTreeSet::new(),
        )
    }

    #[test]
    fn test_fresh_plan_creates_everything_in_batch_order() {
        let plan = preview(&scenario_stack(), None);

        assert_eq!(plan.count(ActionType::Create), 5);
        assert!(plan.has_changes());
        let order: Vec<(&str, usize)> = plan
            .actions
            .iter()
            .map(|a| (a.resource.as_str(), a.batch))
            .collect();
        assert_eq!(
            order,
            vec![("b1", 0), ("i1", 0), ("d1", 1), ("p1", 1), ("dep1", 2)]
        );
        assert!(plan.orphans.is_empty());
        assert_eq!(plan.summary(), "Plan: 5 to create, 0 to update, 0 unchanged, 0 orphaned");
    }

    #[test]
    fn test_unchanged_and_changed_inputs() {
        let stack = Stack::build(
            vec![ResourceDeclaration::new("i1", ResourceKind::OriginAccessIdentity)
                .with_input("comment", "OAI for thot-site.com")],
            vec![],
        )
        .unwrap();

        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        snapshot.record(oai_record("OAI for thot-site.com"));
        let plan = preview(&stack, Some(&snapshot));
        assert!(!plan.has_changes());
        assert_eq!(plan.action("i1").unwrap().physical_id.as_deref(), Some("EOAI"));

        snapshot.record(oai_record("old comment"));
        let plan = preview(&stack, Some(&snapshot));
        let action = plan.action("i1").unwrap();
        assert_eq!(action.action_type, ActionType::Update);
        assert_eq!(action.changed_inputs, vec!["comment".to_string()]);
    }

    #[test]
    fn test_downstream_of_a_change_is_known_after_apply() {
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        snapshot.record(oai_record("old comment"));
        let mut p1 = oai_record("x");
        p1.id = "p1".into();
        p1.kind = ResourceKind::BucketPolicy;
        snapshot.record(p1);

        let plan = preview(&scenario_stack(), Some(&snapshot));

        assert_eq!(plan.action("i1").unwrap().action_type, ActionType::Update);
        let p1 = plan.action("p1").unwrap();
        assert_eq!(p1.action_type, ActionType::Update);
        assert_eq!(p1.reason, "inputs known after apply");
        assert_eq!(plan.action("b1").unwrap().action_type, ActionType::Create);
    }

    #[test]
    fn test_kind_change_and_orphans() {
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        let mut wrong_kind = oai_record("x");
        wrong_kind.kind = ResourceKind::Certificate;
        snapshot.record(wrong_kind);
        let mut removed = oai_record("x");
        removed.id = "legacy".into();
        snapshot.record(removed);

        let stack = Stack::build(scenario(), scenario_outputs()).unwrap();
        let plan = preview(&stack, Some(&snapshot));

        let i1 = plan.action("i1").unwrap();
        assert_eq!(i1.action_type, ActionType::Create);
        assert_eq!(i1.reason, "kind changed from certificate");
        assert_eq!(plan.orphans.len(), 2);
        assert!(plan.to_string().contains("ORPHAN   legacy"));
    }

    #[test]
    fn test_plan_serializes() {
        let plan = preview(&scenario_stack(), None);
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["actions"][0]["action_type"], json!("create"));
        assert_eq!(value["batches"]["batches"][2], json!(["dep1"]));
        assert_eq!(value["fingerprint"], json!(plan.batches.fingerprint()));
    }
}

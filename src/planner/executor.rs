//! Plan execution.
//!
//! Runs an `ExecutionPlan` batch by batch. Every backend call of a batch is
//! spawned at once; the next batch starts only when all of them returned.
//! A failure lets its siblings finish and then stops the run.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::convergence::{ConvergencePolicy, Decision};
use crate::backend::{Provisioned, ProvisioningBackend};
use crate::config::ConfigHasher;
use crate::error::{ExecutionError, ProvisionError, Result, ThotError};
use crate::graph::{ExecutionPlan, NodeTable, Scheduler, Stack};
use crate::resource::{ResolvedInputs, ResourceKind};
use crate::state::{ResourceRecord, StackSnapshot};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(900);

/// Shared flag checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Batches already started run to completion.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final status of one resource in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Provisioned (created, updated or unchanged).
    Provisioned,
    /// Deleted by a teardown.
    Deleted,
    /// The backend call failed or timed out.
    Failed,
    /// Never attempted.
    NotStarted,
}

/// What the run did to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    /// Created.
    Created,
    /// Updated in place.
    Updated,
    /// Reused from the snapshot.
    Unchanged,
    /// Deleted.
    Deleted,
}

/// Outcome of one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Final status.
    pub status: ResourceStatus,
    /// What was done, when something succeeded.
    pub action: Option<ResourceAction>,
    /// Backend identifier, if known.
    pub physical_id: Option<String>,
    /// Error message for failures.
    pub error: Option<String>,
}

/// Result of an apply or teardown run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Outcomes in execution order.
    pub outcomes: Vec<ResourceOutcome>,
    /// True if the run stopped because of a cancellation request.
    pub cancelled: bool,
}

impl RunReport {
    /// Returns true if every resource reached its target status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self
                .outcomes
                .iter()
                .all(|o| matches!(o.status, ResourceStatus::Provisioned | ResourceStatus::Deleted))
    }

    /// Counts outcomes with a given status.
    #[must_use]
    pub fn count(&self, status: ResourceStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Counts outcomes with a given action.
    #[must_use]
    pub fn count_action(&self, action: ResourceAction) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action == Some(action))
            .count()
    }

    /// Looks up the outcome of a resource.
    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Ids with a given status, in execution order.
    #[must_use]
    pub fn ids_with(&self, status: ResourceStatus) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status == status)
            .map(|o| o.id.clone())
            .collect()
    }

    /// Ids the run changed (created, updated or deleted).
    #[must_use]
    pub fn changed_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.action,
                    Some(ResourceAction::Created | ResourceAction::Updated | ResourceAction::Deleted)
                )
            })
            .map(|o| o.id.clone())
            .collect()
    }

    /// The error describing an unsuccessful run, if any.
    #[must_use]
    pub fn error(&self) -> Option<ExecutionError> {
        let failed = self.ids_with(ResourceStatus::Failed);
        let not_started = self.ids_with(ResourceStatus::NotStarted);
        if !failed.is_empty() {
            Some(ExecutionError::RunFailed {
                failed,
                not_started,
            })
        } else if self.cancelled {
            Some(ExecutionError::Cancelled { not_started })
        } else {
            None
        }
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} unchanged, {} deleted, {} failed, {} not started",
            self.count_action(ResourceAction::Created),
            self.count_action(ResourceAction::Updated),
            self.count_action(ResourceAction::Unchanged),
            self.count_action(ResourceAction::Deleted),
            self.count(ResourceStatus::Failed),
            self.count(ResourceStatus::NotStarted)
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Executes plans against a provisioning backend.
pub struct PlanExecutor {
    backend: Arc<dyn ProvisioningBackend>,
    call_timeout: Duration,
    cancel: CancelFlag,
}

/// What a spawned call reports back.
struct CallResult {
    id: String,
    decision: Decision,
    inputs: ResolvedInputs,
    result: std::result::Result<Provisioned, ProvisionError>,
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self {
            backend,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cancel: CancelFlag::new(),
        }
    }

    /// Sets the timeout applied to every backend call.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Uses a shared cancellation flag.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the cancellation flag.
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Provisions `stack` following `plan`, recording results in `snapshot`.
    ///
    /// The snapshot is updated after every successful call, so it reflects
    /// reality even when the run stops part way.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` if the plan schedules a resource before
    /// one of its dependencies. Backend failures are reported in the
    /// `RunReport`, not as errors.
    pub async fn execute(
        &self,
        stack: &Stack,
        plan: &ExecutionPlan,
        snapshot: &mut StackSnapshot,
    ) -> Result<RunReport> {
        info!(
            "Executing {} resources in {} batches with the {} backend",
            plan.len(),
            plan.batch_count(),
            self.backend.name()
        );

        for decl in stack.declarations() {
            let kind_changed = snapshot
                .get(&decl.id)
                .is_some_and(|record| record.kind != decl.kind);
            if kind_changed {
                if let Some(retired) = snapshot.retire(&decl.id) {
                    warn!(
                        "Resource '{}' changed kind from {} to {}; retiring '{}'",
                        decl.id, retired.kind, decl.kind, retired.physical_id
                    );
                }
            }
        }

        let mut table = NodeTable::from_stack(stack);
        let mut outcomes: BTreeMap<String, ResourceOutcome> = BTreeMap::new();
        let mut halted = false;
        let mut cancelled = false;

        for (index, batch) in plan.batches().iter().enumerate() {
            if halted {
                break;
            }
            if self.cancel.is_cancelled() {
                warn!("Cancellation requested; not starting batch {index}");
                cancelled = true;
                break;
            }

            info!("Batch {index}: {}", batch.join(", "));

            // Every member is checked and resolved before any call is spawned.
            let mut prepared = Vec::with_capacity(batch.len());
            for id in batch {
                let decl = stack
                    .declaration(id)
                    .ok_or_else(|| ThotError::internal(format!("Plan names unknown resource '{id}'")))?;

                for dep in stack.dependencies_of(id) {
                    if !table.get(dep).is_some_and(|node| node.is_provisioned()) {
                        return Err(ExecutionError::OrderingViolation {
                            resource: id.clone(),
                            dependency: dep.to_string(),
                        }
                        .into());
                    }
                }

                let inputs = table.resolve_inputs(decl)?;
                let inputs_hash = ConfigHasher::hash_inputs(&inputs);
                let decision = ConvergencePolicy::decide(snapshot.get(id), decl.kind, &inputs_hash);
                prepared.push((id, decl.kind, decision, inputs));
            }

            let mut tasks = JoinSet::new();
            for (id, kind, decision, inputs) in prepared {
                let node = table
                    .get_mut(id)
                    .ok_or_else(|| ThotError::internal(format!("No node for '{id}'")))?;
                node.mark_resolving(inputs.clone());

                if decision == Decision::NoOp {
                    let record = snapshot
                        .get(id)
                        .ok_or_else(|| ThotError::internal(format!("No record for unchanged '{id}'")))?;
                    debug!("'{id}' unchanged, reusing '{}'", record.physical_id);
                    node.mark_provisioned(record.physical_id.clone(), record.outputs.clone());
                    outcomes.insert(
                        id.clone(),
                        ResourceOutcome::provisioned(id, kind, ResourceAction::Unchanged, &record.physical_id),
                    );
                    continue;
                }

                let backend = Arc::clone(&self.backend);
                let timeout = self.call_timeout;
                let id = id.clone();
                tasks.spawn(async move {
                    let (operation, call) = match &decision {
                        Decision::Update { physical_id } => {
                            ("update", tokio::time::timeout(timeout, backend.update(kind, physical_id, &inputs)).await)
                        }
                        _ => ("create", tokio::time::timeout(timeout, backend.create(kind, &id, &inputs)).await),
                    };
                    let result = call
                        .unwrap_or_else(|_| {
                            Err(ProvisionError::Timeout {
                                operation: operation.to_string(),
                                after_secs: timeout.as_secs(),
                            })
                        })
                        .and_then(|provisioned| check_outputs(kind, operation, provisioned));
                    CallResult {
                        id,
                        decision,
                        inputs,
                        result,
                    }
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let call = joined.map_err(|e| ThotError::internal(format!("Provisioning task failed: {e}")))?;
                let kind = stack
                    .declaration(&call.id)
                    .map(|decl| decl.kind)
                    .ok_or_else(|| ThotError::internal(format!("Unknown resource '{}'", call.id)))?;
                let node = table
                    .get_mut(&call.id)
                    .ok_or_else(|| ThotError::internal(format!("No node for '{}'", call.id)))?;

                match call.result {
                    Ok(provisioned) => {
                        let depends_on: BTreeSet<String> = stack
                            .dependencies_of(&call.id)
                            .into_iter()
                            .map(str::to_string)
                            .collect();
                        let (action, record) = match snapshot.get(&call.id) {
                            Some(prior) if matches!(call.decision, Decision::Update { .. }) => (
                                ResourceAction::Updated,
                                prior.updated(
                                    provisioned.physical_id.clone(),
                                    call.inputs,
                                    provisioned.outputs.clone(),
                                    depends_on,
                                ),
                            ),
                            _ => (
                                ResourceAction::Created,
                                ResourceRecord::new(
                                    &call.id,
                                    kind,
                                    provisioned.physical_id.clone(),
                                    call.inputs,
                                    provisioned.outputs.clone(),
                                    depends_on,
                                ),
                            ),
                        };
                        info!("{} {kind} '{}' ({})", action_verb(action), call.id, provisioned.physical_id);
                        snapshot.record(record);
                        node.mark_provisioned(provisioned.physical_id.clone(), provisioned.outputs);
                        outcomes.insert(
                            call.id.clone(),
                            ResourceOutcome::provisioned(&call.id, kind, action, &provisioned.physical_id),
                        );
                    }
                    Err(err) => {
                        error!("Failed to provision {kind} '{}': {err}", call.id);
                        node.mark_failed(err.to_string());
                        outcomes.insert(call.id.clone(), ResourceOutcome::failed(&call.id, kind, None, &err));
                        halted = true;
                    }
                }
            }
        }

        let report = RunReport {
            outcomes: plan
                .ids()
                .filter_map(|id| {
                    outcomes.remove(id).or_else(|| {
                        stack
                            .declaration(id)
                            .map(|decl| ResourceOutcome::not_started(id, decl.kind, None))
                    })
                })
                .collect(),
            cancelled,
        };

        info!("Run finished: {report}");
        Ok(report)
    }

    /// Deletes recorded resources, dependents first.
    ///
    /// Records that are not the live record for their id (retired by a kind
    /// change) are removed from the retired list instead.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the recorded dependencies form a cycle.
    pub async fn teardown(
        &self,
        records: Vec<ResourceRecord>,
        snapshot: &mut StackSnapshot,
    ) -> Result<RunReport> {
        let mut targets: BTreeMap<String, (ResourceRecord, bool)> = BTreeMap::new();
        for record in records {
            let live = snapshot
                .get(&record.id)
                .is_some_and(|current| current.physical_id == record.physical_id);
            let key = if live {
                record.id.clone()
            } else {
                format!("{}#{}", record.id, record.physical_id)
            };
            targets.insert(key, (record, live));
        }

        let dependencies: BTreeMap<String, BTreeSet<String>> = targets
            .iter()
            .map(|(key, (record, _))| (key.clone(), record.depends_on.clone()))
            .collect();
        let plan = Scheduler::schedule_dependencies(&dependencies)?.reversed();
        info!("Deleting {} resources in {} batches", plan.len(), plan.batch_count());

        let mut outcomes: BTreeMap<String, ResourceOutcome> = BTreeMap::new();
        let mut halted = false;
        let mut cancelled = false;

        for (index, batch) in plan.batches().iter().enumerate() {
            if halted {
                break;
            }
            if self.cancel.is_cancelled() {
                warn!("Cancellation requested; not starting deletion batch {index}");
                cancelled = true;
                break;
            }

            let mut tasks = JoinSet::new();
            for key in batch {
                let Some((record, _)) = targets.get(key) else {
                    continue;
                };
                let backend = Arc::clone(&self.backend);
                let timeout = self.call_timeout;
                let kind = record.kind;
                let physical_id = record.physical_id.clone();
                let key = key.clone();
                tasks.spawn(async move {
                    let result = tokio::time::timeout(timeout, backend.delete(kind, &physical_id))
                        .await
                        .unwrap_or_else(|_| {
                            Err(ProvisionError::Timeout {
                                operation: "delete".to_string(),
                                after_secs: timeout.as_secs(),
                            })
                        });
                    (key, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (key, result) =
                    joined.map_err(|e| ThotError::internal(format!("Deletion task failed: {e}")))?;
                let Some((record, live)) = targets.get(&key) else {
                    continue;
                };
                match result {
                    Ok(()) => {
                        info!("Deleted {} '{}' ({})", record.kind, record.id, record.physical_id);
                        if *live {
                            snapshot.remove(&record.id);
                        } else {
                            snapshot.remove_retired(&record.id, &record.physical_id);
                        }
                        let mut outcome = ResourceOutcome::provisioned(
                            &record.id,
                            record.kind,
                            ResourceAction::Deleted,
                            &record.physical_id,
                        );
                        outcome.status = ResourceStatus::Deleted;
                        outcomes.insert(key, outcome);
                    }
                    Err(err) => {
                        error!("Failed to delete {} '{}': {err}", record.kind, record.id);
                        outcomes.insert(
                            key,
                            ResourceOutcome::failed(&record.id, record.kind, Some(&record.physical_id), &err),
                        );
                        halted = true;
                    }
                }
            }
        }

        let report = RunReport {
            outcomes: plan
                .ids()
                .filter_map(|key| {
                    outcomes.remove(key).or_else(|| {
                        targets.get(key).map(|(record, _)| {
                            ResourceOutcome::not_started(&record.id, record.kind, Some(&record.physical_id))
                        })
                    })
                })
                .collect(),
            cancelled,
        };

        info!("Teardown finished: {report}");
        Ok(report)
    }
}

/// Rejects a result missing one of the kind's guaranteed outputs.
fn check_outputs(
    kind: ResourceKind,
    operation: &str,
    provisioned: Provisioned,
) -> std::result::Result<Provisioned, ProvisionError> {
    match kind
        .schema()
        .outputs
        .iter()
        .find(|output| !provisioned.outputs.contains_key(**output))
    {
        Some(missing) => Err(ProvisionError::rejected(format!(
            "{operation} of {kind} returned no '{missing}' output"
        ))),
        None => Ok(provisioned),
    }
}

const fn action_verb(action: ResourceAction) -> &'static str {
    match action {
        ResourceAction::Created => "Created",
        ResourceAction::Updated => "Updated",
        ResourceAction::Unchanged => "Kept",
        ResourceAction::Deleted => "Deleted",
    }
}

impl ResourceOutcome {
    fn provisioned(id: &str, kind: ResourceKind, action: ResourceAction, physical_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            status: ResourceStatus::Provisioned,
            action: Some(action),
            physical_id: Some(physical_id.to_string()),
            error: None,
        }
    }

    fn failed(id: &str, kind: ResourceKind, physical_id: Option<&str>, error: &ProvisionError) -> Self {
        Self {
            id: id.to_string(),
            kind,
            status: ResourceStatus::Failed,
            action: None,
            physical_id: physical_id.map(str::to_string),
            error: Some(error.to_string()),
        }
    }

    fn not_started(id: &str, kind: ResourceKind, physical_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            kind,
            status: ResourceStatus::NotStarted,
            action: None,
            physical_id: physical_id.map(str::to_string),
            error: None,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioned => write!(f, "Provisioned"),
            Self::Deleted => write!(f, "Deleted"),
            Self::Failed => write!(f, "Failed"),
            Self::NotStarted => write!(f, "NotStarted"),
        }
    }
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, MockProvisioningBackend, SimulatedBackend};
    use crate::resource::{ResourceDeclaration, Value};
    use crate::test_support::{fake_provisioned, scenario, scenario_outputs, scenario_stack};

    fn simulated() -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::new(BackendConfig::default()))
    }

    async fn apply(backend: Arc<dyn ProvisioningBackend>, stack: &Stack, snapshot: &mut StackSnapshot) -> RunReport {
        let plan = Scheduler::schedule(stack).unwrap();
        PlanExecutor::new(backend).execute(stack, &plan, snapshot).await.unwrap()
    }

    fn statuses(report: &RunReport) -> Vec<(&str, ResourceStatus)> {
        report.outcomes.iter().map(|o| (o.id.as_str(), o.status)).collect()
    }

    #[tokio::test]
    async fn test_scenario_provisions_everything() {
        let backend = simulated();
        let stack = scenario_stack();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");

        let report = apply(backend.clone(), &stack, &mut snapshot).await;

        assert!(report.is_success());
        assert_eq!(report.count_action(ResourceAction::Created), 5);
        assert_eq!(
            report.outcomes.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            vec!["b1", "i1", "d1", "p1", "dep1"]
        );
        assert_eq!(backend.calls().create, 5);
        assert_eq!(snapshot.resources.len(), 5);

        let p1 = snapshot.get("p1").unwrap();
        assert_eq!(p1.resolved_inputs["bucket"], serde_json::json!("thot-site.com"));
        assert_eq!(
            p1.resolved_inputs["resources"],
            serde_json::json!(["arn:aws:s3:::thot-site.com/*"])
        );
        let dep1 = snapshot.get("dep1").unwrap();
        assert_eq!(
            dep1.depends_on.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["b1", "d1"]
        );
        assert!(report.error().is_none());
    }

    #[tokio::test]
    async fn test_second_run_makes_no_backend_calls() {
        let stack = scenario_stack();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        apply(simulated(), &stack, &mut snapshot).await;
        let before = snapshot.resources.clone();

        let mut mock = MockProvisioningBackend::new();
        mock.expect_create().times(0);
        mock.expect_update().times(0);
        mock.expect_delete().times(0);
        mock.expect_name().return_const("mock");

        let report = apply(Arc::new(mock), &stack, &mut snapshot).await;

        assert!(report.is_success());
        assert_eq!(report.count_action(ResourceAction::Unchanged), 5);
        assert_eq!(snapshot.resources, before);
    }

    #[tokio::test]
    async fn test_update_only_where_inputs_change() {
        let backend = simulated();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        apply(backend.clone(), &scenario_stack(), &mut snapshot).await;

        let mut declarations = scenario();
        declarations[0] = declarations[0]
            .clone()
            .with_input("websiteIndexDocument", "home.html");
        let stack = Stack::build(declarations, scenario_outputs()).unwrap();

        let report = apply(backend.clone(), &stack, &mut snapshot).await;

        assert_eq!(report.outcome("b1").unwrap().action, Some(ResourceAction::Updated));
        assert_eq!(report.count_action(ResourceAction::Unchanged), 4);
        assert_eq!(backend.calls().update, 1);
        assert_eq!(
            snapshot.get("b1").unwrap().resolved_inputs["websiteIndexDocument"],
            serde_json::json!("home.html")
        );
    }

    #[tokio::test]
    async fn test_failure_stops_before_dependents() {
        let backend = simulated();
        backend.fail_on("i1", ProvisionError::rejected("quota exceeded"));
        let stack = scenario_stack();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");

        let report = apply(backend.clone(), &stack, &mut snapshot).await;

        assert_eq!(
            statuses(&report),
            vec![
                ("b1", ResourceStatus::Provisioned),
                ("i1", ResourceStatus::Failed),
                ("d1", ResourceStatus::NotStarted),
                ("p1", ResourceStatus::NotStarted),
                ("dep1", ResourceStatus::NotStarted),
            ]
        );
        assert_eq!(backend.calls().create, 2);
        assert_eq!(snapshot.resource_ids(), vec!["b1"]);
        assert!(report.outcome("i1").unwrap().error.as_deref().unwrap().contains("quota exceeded"));

        match report.error() {
            Some(ExecutionError::RunFailed { failed, not_started }) => {
                assert_eq!(failed, vec!["i1"]);
                assert_eq!(not_started, vec!["d1", "p1", "dep1"]);
            }
            other => panic!("expected RunFailed, got {other:?}"),
        }

        backend.clear_failure("i1");
        let report = apply(backend.clone(), &stack, &mut snapshot).await;
        assert!(report.is_success());
        assert_eq!(report.outcome("b1").unwrap().action, Some(ResourceAction::Unchanged));
        assert_eq!(report.count_action(ResourceAction::Created), 4);
    }

    #[tokio::test]
    async fn test_call_timeout_fails_the_resource() {
        let backend = Arc::new(
            SimulatedBackend::new(BackendConfig::default()).with_latency(Duration::from_millis(500)),
        );
        let stack = Stack::build(
            vec![ResourceDeclaration::new("i1", ResourceKind::OriginAccessIdentity)],
            vec![],
        )
        .unwrap();
        let plan = Scheduler::schedule(&stack).unwrap();
        let mut snapshot = StackSnapshot::new("s", "dev");

        let report = PlanExecutor::new(backend)
            .with_call_timeout(Duration::from_millis(20))
            .execute(&stack, &plan, &mut snapshot)
            .await
            .unwrap();

        let outcome = report.outcome("i1").unwrap();
        assert_eq!(outcome.status, ResourceStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("create timed out"));
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let backend = simulated();
        let stack = scenario_stack();
        let plan = Scheduler::schedule(&stack).unwrap();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        let executor = PlanExecutor::new(backend.clone());
        executor.cancel_flag().cancel();

        let report = executor.execute(&stack, &plan, &mut snapshot).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.count(ResourceStatus::NotStarted), 5);
        assert_eq!(backend.calls().create, 0);
        assert!(matches!(report.error(), Some(ExecutionError::Cancelled { ref not_started }) if not_started.len() == 5));
    }

    #[tokio::test]
    async fn test_cancel_between_batches() {
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        let mut mock = MockProvisioningBackend::new();
        mock.expect_name().return_const("mock");
        mock.expect_create().times(2).returning(move |kind, id, _| {
            flag.cancel();
            Ok(fake_provisioned(kind, id))
        });

        let stack = scenario_stack();
        let plan = Scheduler::schedule(&stack).unwrap();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        let report = PlanExecutor::new(Arc::new(mock))
            .with_cancel_flag(cancel)
            .execute(&stack, &plan, &mut snapshot)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.ids_with(ResourceStatus::Provisioned), vec!["b1", "i1"]);
        assert_eq!(report.ids_with(ResourceStatus::NotStarted), vec!["d1", "p1", "dep1"]);
        assert_eq!(snapshot.resources.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_guaranteed_output_is_rejected() {
        let mut mock = MockProvisioningBackend::new();
        mock.expect_name().return_const("mock");
        mock.expect_create().returning(|_, _, _| {
            Ok(Provisioned {
                physical_id: "E123".into(),
                outputs: crate::resource::Outputs::new(),
            })
        });
        let stack = Stack::build(
            vec![ResourceDeclaration::new("i1", ResourceKind::OriginAccessIdentity)],
            vec![],
        )
        .unwrap();
        let mut snapshot = StackSnapshot::new("s", "dev");

        let report = apply(Arc::new(mock), &stack, &mut snapshot).await;

        let outcome = report.outcome("i1").unwrap();
        assert_eq!(outcome.status, ResourceStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("'identityId'"));
    }

    #[tokio::test]
    async fn test_plan_that_breaks_ordering_is_refused() {
        let stack = scenario_stack();
        let bad = ExecutionPlan::from_batches(vec![vec!["p1"], vec!["b1", "i1"]]);
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        let backend = simulated();

        let err = PlanExecutor::new(backend.clone())
            .execute(&stack, &bad, &mut snapshot)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ThotError::Execution(ExecutionError::OrderingViolation { ref resource, ref dependency })
                if resource == "p1" && dependency == "b1"
        ));
        assert_eq!(backend.calls().create, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ordering_violation_spawns_nothing_from_the_batch() {
        let stack = scenario_stack();
        let bad = ExecutionPlan::from_batches(vec![vec!["b1", "p1"], vec!["i1"]]);
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        let backend = simulated();

        let err = PlanExecutor::new(backend.clone())
            .execute(&stack, &bad, &mut snapshot)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ThotError::Execution(ExecutionError::OrderingViolation { ref resource, ref dependency })
                if resource == "p1" && dependency == "b1"
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.calls().create, 0);
        assert_eq!(backend.resource_count(), 0);
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_batch_members_run_concurrently() {
        let latency = Duration::from_millis(200);
        let backend = Arc::new(SimulatedBackend::new(BackendConfig::default()).with_latency(latency));
        let stack = Stack::build(
            vec![
                ResourceDeclaration::new("i1", ResourceKind::OriginAccessIdentity),
                ResourceDeclaration::new("i2", ResourceKind::OriginAccessIdentity),
            ],
            vec![],
        )
        .unwrap();
        let plan = Scheduler::schedule(&stack).unwrap();
        assert_eq!(plan.batch_count(), 1);
        let mut snapshot = StackSnapshot::new("s", "dev");

        let started = tokio::time::Instant::now();
        let report = PlanExecutor::new(backend.clone())
            .execute(&stack, &plan, &mut snapshot)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(report.is_success());
        assert_eq!(backend.calls().create, 2);
        assert!(elapsed >= latency, "{elapsed:?}");
        assert!(elapsed < latency * 2, "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_kind_change_retires_old_record() {
        let backend = simulated();
        let mut snapshot = StackSnapshot::new("s", "dev");
        let first = Stack::build(
            vec![ResourceDeclaration::new("x", ResourceKind::OriginAccessIdentity)],
            vec![],
        )
        .unwrap();
        apply(backend.clone(), &first, &mut snapshot).await;
        let old_physical = snapshot.get("x").unwrap().physical_id.clone();

        let second = Stack::build(
            vec![ResourceDeclaration::new("x", ResourceKind::Certificate)
                .with_input("domainName", Value::literal("thot-site.com"))],
            vec![],
        )
        .unwrap();
        let report = apply(backend.clone(), &second, &mut snapshot).await;

        assert_eq!(report.outcome("x").unwrap().action, Some(ResourceAction::Created));
        assert_eq!(snapshot.get("x").unwrap().kind, ResourceKind::Certificate);
        assert_eq!(snapshot.retired.len(), 1);
        assert_eq!(snapshot.retired[0].physical_id, old_physical);
        assert!(backend.contains(ResourceKind::OriginAccessIdentity, &old_physical));
    }

    #[tokio::test]
    async fn test_teardown_deletes_dependents_first() {
        let backend = simulated();
        let stack = scenario_stack();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        apply(backend.clone(), &stack, &mut snapshot).await;

        let records: Vec<ResourceRecord> = snapshot.resources.values().cloned().collect();
        let report = PlanExecutor::new(backend.clone())
            .teardown(records, &mut snapshot)
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(
            report.outcomes.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            vec!["dep1", "d1", "p1", "b1", "i1"]
        );
        assert_eq!(report.count(ResourceStatus::Deleted), 5);
        assert!(snapshot.is_empty());
        assert_eq!(backend.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_failure_keeps_dependencies() {
        let backend = simulated();
        let stack = scenario_stack();
        let mut snapshot = StackSnapshot::new("thot-site", "dev");
        apply(backend.clone(), &stack, &mut snapshot).await;
        backend.fail_on("d1", ProvisionError::unavailable("throttled"));

        let records: Vec<ResourceRecord> = snapshot.resources.values().cloned().collect();
        let report = PlanExecutor::new(backend.clone())
            .teardown(records, &mut snapshot)
            .await
            .unwrap();

        assert_eq!(
            statuses(&report),
            vec![
                ("dep1", ResourceStatus::Deleted),
                ("d1", ResourceStatus::Failed),
                ("p1", ResourceStatus::Deleted),
                ("b1", ResourceStatus::NotStarted),
                ("i1", ResourceStatus::NotStarted),
            ]
        );
        assert_eq!(snapshot.resource_ids(), vec!["b1", "d1", "i1"]);
    }

    #[tokio::test]
    async fn test_teardown_of_retired_record() {
        let backend = simulated();
        let mut snapshot = StackSnapshot::new("s", "dev");
        let first = Stack::build(
            vec![ResourceDeclaration::new("x", ResourceKind::OriginAccessIdentity)],
            vec![],
        )
        .unwrap();
        apply(backend.clone(), &first, &mut snapshot).await;
        let second = Stack::build(
            vec![ResourceDeclaration::new("x", ResourceKind::Certificate)
                .with_input("domainName", "thot-site.com")],
            vec![],
        )
        .unwrap();
        apply(backend.clone(), &second, &mut snapshot).await;

        let retired = snapshot.retired.clone();
        let report = PlanExecutor::new(backend.clone())
            .teardown(retired, &mut snapshot)
            .await
            .unwrap();

        assert_eq!(report.count(ResourceStatus::Deleted), 1);
        assert!(snapshot.retired.is_empty());
        assert_eq!(snapshot.get("x").unwrap().kind, ResourceKind::Certificate);
    }
}

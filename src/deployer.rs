//! Stack deployer.
//!
//! Ties a parsed stack, a state store and a provisioning backend together:
//! plan, apply, prune, destroy, drift detection and output lookup. Every
//! mutating operation holds the state lock for its whole duration.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendProvider, HttpBackend, ProvisioningBackend, SimulatedBackend};
use crate::config::{StackConfig, StateBackend};
use crate::error::{ConfigError, OutputError, Result, StateError};
use crate::graph::{Scheduler, Stack};
use crate::outputs::OutputResolver;
use crate::planner::{CancelFlag, ConvergencePolicy, DeploymentPlan, Orphan, PlanExecutor, RunReport};
use crate::resource::ResourceKind;
use crate::state::{
    HistoryEntry, LocalStateStore, ResourceRecord, S3StateStore, STATE_DIR, StackOperation,
    StackSnapshot, StateStore, state_key,
};

/// Stack outputs paired with their resolution result.
pub type ResolvedOutputs = Vec<(String, std::result::Result<JsonValue, OutputError>)>;

/// Orchestrates operations on one stack.
pub struct Deployer<S: StateStore> {
    /// Parsed stack file.
    config: StackConfig,
    /// Validated resource graph.
    stack: Stack,
    /// Snapshot storage.
    store: S,
    /// Provisioning backend.
    backend: Arc<dyn ProvisioningBackend>,
    /// Shared cancellation flag.
    cancel: CancelFlag,
}

/// Result of an apply.
#[derive(Debug, Serialize)]
pub struct ApplyOutcome {
    /// Per-resource results.
    pub report: RunReport,
    /// Stack outputs after the run.
    #[serde(serialize_with = "serialize_outputs")]
    pub outputs: ResolvedOutputs,
    /// Orphans left in the snapshot.
    pub orphans: Vec<Orphan>,
}

/// Drift status of one recorded resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    /// The backend reports the recorded outputs.
    InSync,
    /// The backend no longer knows the resource.
    Missing,
    /// The backend reports different outputs.
    Changed {
        /// Output names whose values differ.
        outputs: Vec<String>,
    },
    /// The read call failed.
    Unreadable {
        /// Error message.
        error: String,
    },
}

/// Drift of one recorded resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Resource id.
    pub id: String,
    /// Recorded kind.
    pub kind: ResourceKind,
    /// Recorded physical id.
    pub physical_id: String,
    /// What the backend reported.
    #[serde(flatten)]
    pub status: DriftStatus,
}

/// Report of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// One entry per recorded resource.
    pub entries: Vec<DriftEntry>,
}

impl<S: StateStore> Deployer<S> {
    /// Creates a deployer, building and validating the stack graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the declarations are invalid.
    pub fn new(config: StackConfig, store: S, backend: Arc<dyn ProvisioningBackend>) -> Result<Self> {
        let stack = config.build_stack()?;
        Ok(Self {
            config,
            stack,
            store,
            backend,
            cancel: CancelFlag::new(),
        })
    }

    /// Uses a shared cancellation flag.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the stack configuration.
    #[must_use]
    pub const fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Returns the validated stack.
    #[must_use]
    pub const fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Returns the state store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Loads the snapshot, or an empty one for a first run.
    ///
    /// # Errors
    ///
    /// Returns a state error if the snapshot cannot be read or belongs to
    /// another stack.
    pub async fn load_snapshot(&self) -> Result<StackSnapshot> {
        let name = &self.config.stack.name;
        let environment = &self.config.stack.environment;
        match self.load_existing().await? {
            Some(snapshot) => Ok(snapshot),
            None => {
                debug!("No snapshot yet for {name}/{environment}");
                Ok(StackSnapshot::new(name, environment))
            }
        }
    }

    /// Loads the saved snapshot, checking that it belongs to this stack.
    async fn load_existing(&self) -> Result<Option<StackSnapshot>> {
        let name = &self.config.stack.name;
        let environment = &self.config.stack.environment;
        match self.store.load().await? {
            Some(snapshot) if snapshot.stack != *name || snapshot.environment != *environment => {
                Err(StateError::Corrupted {
                    message: format!(
                        "snapshot at {} belongs to {}/{}, not {name}/{environment}",
                        self.store.location(),
                        snapshot.stack,
                        snapshot.environment
                    ),
                }
                .into())
            }
            loaded => Ok(loaded),
        }
    }

    /// Previews an apply without side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded.
    pub async fn plan(&self) -> Result<DeploymentPlan> {
        let snapshot = self.load_existing().await?;
        let plan = Scheduler::schedule(&self.stack)?;
        let preview = DeploymentPlan::build(&self.stack, &plan, snapshot.as_ref());
        info!("{}", preview.summary());
        Ok(preview)
    }

    /// Provisions the stack and saves the snapshot.
    ///
    /// The snapshot is saved even when resources failed; the outcome's
    /// report says which.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired, the state cannot be
    /// saved, or the executor detects an ordering violation.
    pub async fn apply(&self) -> Result<ApplyOutcome> {
        let lock = self.store.acquire_lock("").await?;
        let result = self.apply_locked().await;
        self.release(&lock.lock_id).await;
        result
    }

    async fn apply_locked(&self) -> Result<ApplyOutcome> {
        info!(
            "Applying stack {}/{}",
            self.config.stack.name, self.config.stack.environment
        );
        let mut snapshot = self.load_snapshot().await?;
        let plan = Scheduler::schedule(&self.stack)?;
        let config_hash = self.config.config_hash();

        let run = self
            .executor()
            .execute(&self.stack, &plan, &mut snapshot)
            .await;

        let report = match run {
            Ok(report) => report,
            Err(err) => {
                snapshot.add_history(HistoryEntry::failed(
                    StackOperation::Apply,
                    &config_hash,
                    vec![],
                    &err.to_string(),
                ));
                self.store.save(&snapshot).await?;
                return Err(err);
            }
        };

        let outputs = OutputResolver::from_snapshot(&self.stack, &snapshot);
        snapshot.outputs = outputs
            .iter()
            .filter_map(|(name, value)| value.as_ref().ok().map(|v| (name.clone(), v.clone())))
            .collect();
        for (name, value) in &outputs {
            if let Err(err) = value {
                warn!("Stack output '{name}' unresolved: {err}");
            }
        }

        let entry = match report.error() {
            None => {
                snapshot.config_hash.clone_from(&config_hash);
                HistoryEntry::new(StackOperation::Apply, &config_hash, report.changed_ids())
            }
            Some(err) => {
                error!("Apply incomplete: {err}");
                HistoryEntry::failed(
                    StackOperation::Apply,
                    &config_hash,
                    report.changed_ids(),
                    &err.to_string(),
                )
            }
        };
        snapshot.add_history(entry);
        self.store.save(&snapshot).await?;

        let orphans = ConvergencePolicy::orphans(&self.stack, &snapshot);
        for orphan in &orphans {
            warn!(
                "Orphaned {} '{}' ({}): {}; run with --prune to delete it",
                orphan.kind, orphan.id, orphan.physical_id, orphan.reason
            );
        }

        Ok(ApplyOutcome {
            report,
            outputs,
            orphans,
        })
    }

    /// Lists orphans of the saved snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded.
    pub async fn orphans(&self) -> Result<Vec<Orphan>> {
        let snapshot = self.load_snapshot().await?;
        Ok(ConvergencePolicy::orphans(&self.stack, &snapshot))
    }

    /// Deletes every orphan, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired or the state cannot
    /// be saved.
    pub async fn prune(&self) -> Result<RunReport> {
        let lock = self.store.acquire_lock("").await?;
        let result = self.prune_locked().await;
        self.release(&lock.lock_id).await;
        result
    }

    async fn prune_locked(&self) -> Result<RunReport> {
        let mut snapshot = self.load_snapshot().await?;
        let orphans = ConvergencePolicy::orphans(&self.stack, &snapshot);
        if orphans.is_empty() {
            info!("No orphans to prune");
            return Ok(RunReport::default());
        }

        let records: Vec<ResourceRecord> = orphans
            .iter()
            .filter_map(|orphan| {
                snapshot
                    .get(&orphan.id)
                    .filter(|record| record.physical_id == orphan.physical_id)
                    .or_else(|| {
                        snapshot
                            .retired
                            .iter()
                            .find(|r| r.id == orphan.id && r.physical_id == orphan.physical_id)
                    })
                    .cloned()
            })
            .collect();

        info!("Pruning {} orphaned resources", records.len());
        self.teardown_and_save(records, &mut snapshot, StackOperation::Prune)
            .await
    }

    /// Deletes every recorded resource, dependents first.
    ///
    /// The snapshot is deleted once nothing is left.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired or the state cannot
    /// be saved.
    pub async fn destroy(&self) -> Result<RunReport> {
        let lock = self.store.acquire_lock("").await?;
        let result = self.destroy_locked().await;
        self.release(&lock.lock_id).await;
        result
    }

    async fn destroy_locked(&self) -> Result<RunReport> {
        let Some(mut snapshot) = self.load_existing().await? else {
            info!("No state found, nothing to destroy");
            return Ok(RunReport::default());
        };

        let records: Vec<ResourceRecord> = snapshot
            .resources
            .values()
            .chain(snapshot.retired.iter())
            .cloned()
            .collect();
        warn!(
            "Destroying {} resources of {}/{}",
            records.len(),
            snapshot.stack,
            snapshot.environment
        );

        let report = self
            .teardown_and_save(records, &mut snapshot, StackOperation::Destroy)
            .await?;

        if snapshot.is_empty() {
            info!("All resources deleted, removing state");
            self.store.delete().await?;
        }
        Ok(report)
    }

    async fn teardown_and_save(
        &self,
        records: Vec<ResourceRecord>,
        snapshot: &mut StackSnapshot,
        operation: StackOperation,
    ) -> Result<RunReport> {
        let hash = snapshot.config_hash.clone();
        let result = self.executor().teardown(records, snapshot).await;

        let entry = match &result {
            Ok(report) => match report.error() {
                None => HistoryEntry::new(operation, &hash, report.changed_ids()),
                Some(err) => HistoryEntry::failed(operation, &hash, report.changed_ids(), &err.to_string()),
            },
            Err(err) => HistoryEntry::failed(operation, &hash, vec![], &err.to_string()),
        };
        snapshot.add_history(entry);
        let remaining: BTreeSet<String> = snapshot.resources.keys().cloned().collect();
        let declared = self.stack.outputs();
        snapshot.outputs.retain(|name, _| {
            declared
                .iter()
                .any(|output| output.name == *name && remaining.contains(&output.value.resource))
        });
        self.store.save(snapshot).await?;
        result
    }

    /// Reads every recorded resource back from the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.config.stack.name, self.config.stack.environment
        );
        let snapshot = self.load_snapshot().await?;
        let timeout = self.config.call_timeout();
        let mut entries = Vec::with_capacity(snapshot.resources.len());

        for record in snapshot.resources.values() {
            let read = tokio::time::timeout(timeout, self.backend.read(record.kind, &record.physical_id)).await;
            let status = match read {
                Err(_) => DriftStatus::Unreadable {
                    error: format!("read timed out after {}s", timeout.as_secs()),
                },
                Ok(Err(err)) => DriftStatus::Unreadable {
                    error: err.to_string(),
                },
                Ok(Ok(None)) => DriftStatus::Missing,
                Ok(Ok(Some(current))) => {
                    let changed: Vec<String> = record
                        .outputs
                        .keys()
                        .chain(current.outputs.keys())
                        .filter(|name| record.outputs.get(*name) != current.outputs.get(*name))
                        .cloned()
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    if changed.is_empty() {
                        DriftStatus::InSync
                    } else {
                        DriftStatus::Changed { outputs: changed }
                    }
                }
            };

            if status != DriftStatus::InSync {
                warn!("Drift on {} '{}': {:?}", record.kind, record.id, status);
            }
            entries.push(DriftEntry {
                id: record.id.clone(),
                kind: record.kind,
                physical_id: record.physical_id.clone(),
                status,
            });
        }

        Ok(DriftReport { entries })
    }

    /// Resolves stack outputs from the saved snapshot.
    ///
    /// # Errors
    ///
    /// Returns `UnknownOutput` if `name` is given and not declared.
    pub async fn outputs(&self, name: Option<&str>) -> Result<ResolvedOutputs> {
        let snapshot = self.load_snapshot().await?;
        let resolved = OutputResolver::from_snapshot(&self.stack, &snapshot);
        match name {
            None => Ok(resolved),
            Some(name) => resolved
                .into_iter()
                .find(|(candidate, _)| candidate == name)
                .map(|entry| vec![entry])
                .ok_or_else(|| OutputError::UnknownOutput { name: name.to_string() }.into()),
        }
    }

    fn executor(&self) -> PlanExecutor {
        PlanExecutor::new(Arc::clone(&self.backend))
            .with_call_timeout(self.config.call_timeout())
            .with_cancel_flag(self.cancel.clone())
    }

    async fn release(&self, lock_id: &str) {
        if let Err(err) = self.store.release_lock(lock_id).await {
            warn!("Failed to release state lock: {err}");
        }
    }
}

fn serialize_outputs<Ser: serde::Serializer>(
    outputs: &ResolvedOutputs,
    serializer: Ser,
) -> std::result::Result<Ser::Ok, Ser::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(outputs.len()))?;
    for (name, value) in outputs {
        match value {
            Ok(value) => map.serialize_entry(name, value)?,
            Err(err) => map.serialize_entry(name, &serde_json::json!({ "unresolved": err.to_string() }))?,
        }
    }
    map.end()
}

impl DriftReport {
    /// Returns true if any resource drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.entries.iter().any(|e| e.status != DriftStatus::InSync)
    }

    /// Returns the drifted entries.
    pub fn drifted(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries.iter().filter(|e| e.status != DriftStatus::InSync)
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => write!(f, "in sync"),
            Self::Missing => write!(f, "missing"),
            Self::Changed { outputs } => write!(f, "changed: {}", outputs.join(", ")),
            Self::Unreadable { error } => write!(f, "unreadable: {error}"),
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift() {
            writeln!(f, "Drift detected:")?;
            for entry in self.drifted() {
                writeln!(f, "  - {} ({}): {}", entry.id, entry.kind, entry.status)?;
            }
        } else {
            write!(f, "No drift detected - {} resources in sync", self.entries.len())?;
        }
        Ok(())
    }
}

/// Local state directory: `state.path`, or `<base_dir>/.thot` by default.
fn local_state_dir(config: &StackConfig, base_dir: &Path) -> PathBuf {
    config
        .state
        .path
        .as_ref()
        .map_or_else(|| base_dir.join(STATE_DIR), |path| base_dir.join(path))
}

/// Creates the state store configured for a stack.
///
/// # Errors
///
/// Returns a validation error if S3 state has no bucket.
pub async fn create_state_store(config: &StackConfig, base_dir: &Path) -> Result<Box<dyn StateStore>> {
    let stack = &config.stack.name;
    let environment = &config.stack.environment;
    match config.state.backend {
        StateBackend::Local => Ok(Box::new(LocalStateStore::new(
            local_state_dir(config, base_dir),
            stack,
            environment,
        ))),
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 bucket name is required", "state.bucket"))?;
            let region = config
                .state
                .region
                .as_deref()
                .or(Some(config.backend.region.as_str()));
            Ok(Box::new(
                S3StateStore::new(bucket, config.state.prefix.as_deref(), region, stack, environment).await,
            ))
        }
    }
}

/// Creates the provisioning backend configured for a stack.
///
/// The simulated backend keeps its resources in
/// `<state dir>/<stack>-<env>.simulated.json` so that they outlive the
/// process, like the snapshot that records them.
///
/// # Errors
///
/// Returns an error if the HTTP backend endpoint is invalid or the simulated
/// resource file cannot be read.
pub async fn create_backend(
    config: &StackConfig,
    base_dir: &Path,
    token: Option<String>,
) -> Result<Arc<dyn ProvisioningBackend>> {
    match config.backend.provider {
        BackendProvider::Simulated => {
            let path = local_state_dir(config, base_dir).join(format!(
                "{}.simulated.json",
                state_key(&config.stack.name, &config.stack.environment)
            ));
            Ok(Arc::new(SimulatedBackend::persistent(config.backend.clone(), path).await?))
        }
        BackendProvider::Http => Ok(Arc::new(HttpBackend::new(config.backend.clone(), token)?)),
    }
}

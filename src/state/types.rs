//! Persisted stack snapshot.
//!
//! A snapshot records, for every provisioned resource, the resolved inputs
//! it was last provisioned with and the outputs the backend returned. The
//! convergence policy compares the next run against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ConfigHasher;
use crate::resource::{Outputs, ResolvedInputs, ResourceKind};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete recorded state of one stack in one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSnapshot {
    /// State format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied declaration set.
    pub config_hash: String,
    /// Provisioned resources by id.
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Records replaced because their kind changed, awaiting removal.
    #[serde(default)]
    pub retired: Vec<ResourceRecord>,
    /// Stack outputs resolved by the last apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, JsonValue>,
    /// When the snapshot was last updated.
    pub last_updated: DateTime<Utc>,
    /// Operation history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// What was provisioned for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Backend identifier.
    pub physical_id: String,
    /// Hash of `resolved_inputs`.
    pub inputs_hash: String,
    /// Inputs the resource was provisioned with.
    pub resolved_inputs: ResolvedInputs,
    /// Outputs returned by the backend.
    pub outputs: Outputs,
    /// Ids this resource depended on when provisioned.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the operation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation ran.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: StackOperation,
    /// Declaration hash at the time.
    pub config_hash: String,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StackOperation {
    /// Provisioning run.
    Apply,
    /// Removal of confirmed orphans.
    Prune,
    /// Full teardown.
    Destroy,
}

impl StackSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            retired: Vec::new(),
            outputs: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Returns the storage key, `<stack>-<environment>`.
    #[must_use]
    pub fn key(&self) -> String {
        state_key(&self.stack, &self.environment)
    }

    /// Looks up a record by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceRecord> {
        self.resources.get(id)
    }

    /// Adds or replaces a record.
    pub fn record(&mut self, record: ResourceRecord) {
        self.resources.insert(record.id.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by id.
    pub fn remove(&mut self, id: &str) -> Option<ResourceRecord> {
        let removed = self.resources.remove(id);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Moves a record to the retired list.
    pub fn retire(&mut self, id: &str) -> Option<&ResourceRecord> {
        let record = self.remove(id)?;
        self.retired.push(record);
        self.retired.last()
    }

    /// Drops a retired record once it has been deleted.
    pub fn remove_retired(&mut self, id: &str, physical_id: &str) -> bool {
        let before = self.retired.len();
        self.retired
            .retain(|record| !(record.id == id && record.physical_id == physical_id));
        let removed = self.retired.len() != before;
        if removed {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Returns true if nothing is recorded, live or retired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.retired.is_empty()
    }

    /// Returns all recorded resource ids.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Adds a history entry, keeping only the most recent ones.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

/// Builds the storage key for a stack and environment.
#[must_use]
pub fn state_key(stack: &str, environment: &str) -> String {
    format!("{stack}-{environment}")
}

impl ResourceRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(
        id: &str,
        kind: ResourceKind,
        physical_id: String,
        resolved_inputs: ResolvedInputs,
        outputs: Outputs,
        depends_on: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            kind,
            physical_id,
            inputs_hash: ConfigHasher::hash_inputs(&resolved_inputs),
            resolved_inputs,
            outputs,
            depends_on,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a copy updated in place, keeping the creation time.
    #[must_use]
    pub fn updated(
        &self,
        physical_id: String,
        resolved_inputs: ResolvedInputs,
        outputs: Outputs,
        depends_on: BTreeSet<String>,
    ) -> Self {
        Self {
            created_at: self.created_at,
            ..Self::new(&self.id, self.kind, physical_id, resolved_inputs, outputs, depends_on)
        }
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: StackOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: StackOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Prune => "prune",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

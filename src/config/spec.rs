//! Stack file types.
//!
//! This module defines the structs that map to `thot.stack.yaml`. A stack
//! file fully describes the desired infrastructure; nothing in it is
//! imperative.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::hash::ConfigHasher;
use crate::backend::BackendConfig;
use crate::error::GraphError;
use crate::graph::Stack;
use crate::resource::{ResourceDeclaration, StackOutput};

/// The root of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Stack identity.
    pub stack: StackMeta,
    /// Provisioning backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    /// Stack outputs.
    #[serde(default)]
    pub outputs: Vec<StackOutput>,
}

/// Stack identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackMeta {
    /// Stack name.
    pub name: String,
    /// Environment (e.g. "dev", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// Bucket name (s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// Key prefix (s3 backend).
    #[serde(default)]
    pub prefix: Option<String>,
    /// Region (s3 backend, AWS default if unset).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Timeout for each backend call, in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
        }
    }
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_call_timeout() -> u64 {
    900
}

impl StackConfig {
    /// Builds the validated stack graph.
    ///
    /// # Errors
    ///
    /// Returns the first graph error found.
    pub fn build_stack(&self) -> Result<Stack, GraphError> {
        Stack::build(self.resources.clone(), self.outputs.clone())
    }

    /// Returns the hash of the declarations and outputs.
    #[must_use]
    pub fn config_hash(&self) -> String {
        ConfigHasher::hash_declarations(&self.resources, &self.outputs)
    }

    /// Returns the per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.call_timeout_secs)
    }

    /// Looks up a resource declaration by id.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceDeclaration> {
        self.resources.iter().find(|r| r.id == id)
    }
}

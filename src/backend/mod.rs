//! Provisioning backends.
//!
//! The engine never talks to a cloud directly. It calls an injected
//! `ProvisioningBackend` with fully resolved inputs and records whatever
//! outputs the backend returns.

mod http;
mod simulated;

pub use http::HttpBackend;
pub use simulated::{CallCounts, SimulatedBackend};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::resource::{Outputs, ResolvedInputs, ResourceKind};

/// Result of a successful create, update or read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provisioned {
    /// Backend identifier of the resource.
    pub physical_id: String,
    /// Outputs exposed by the resource.
    #[serde(default)]
    pub outputs: Outputs,
}

/// Capability the executor drives.
///
/// Implementations must be safe to call concurrently for distinct resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Creates a resource.
    async fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        inputs: &ResolvedInputs,
    ) -> Result<Provisioned, ProvisionError>;

    /// Updates an existing resource in place.
    async fn update(
        &self,
        kind: ResourceKind,
        physical_id: &str,
        inputs: &ResolvedInputs,
    ) -> Result<Provisioned, ProvisionError>;

    /// Deletes a resource. Deleting a missing resource succeeds.
    async fn delete(&self, kind: ResourceKind, physical_id: &str) -> Result<(), ProvisionError>;

    /// Reads a resource's current outputs, `None` if it no longer exists.
    async fn read(
        &self,
        kind: ResourceKind,
        physical_id: &str,
    ) -> Result<Option<Provisioned>, ProvisionError>;

    /// Short backend name for logs and reports.
    fn name(&self) -> &'static str;
}

/// Which backend implementation to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProvider {
    /// In-process simulation.
    #[default]
    Simulated,
    /// Remote provisioning service over HTTP.
    Http,
}

impl std::fmt::Display for BackendProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Account and region context handed to a backend constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend implementation.
    #[serde(default)]
    pub provider: BackendProvider,
    /// Service endpoint (HTTP backend only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Target region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Target account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Per-request timeout in seconds (HTTP backend only).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_region() -> String {
    String::from("us-east-1")
}

const fn default_request_timeout() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: BackendProvider::default(),
            endpoint: None,
            region: default_region(),
            account: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl BackendConfig {
    /// Returns the account, or a placeholder when none is configured.
    #[must_use]
    pub fn account_or_default(&self) -> &str {
        self.account.as_deref().unwrap_or("000000000000")
    }
}

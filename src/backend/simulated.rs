//! In-process simulated backend.
//!
//! Produces deterministic, kind-specific outputs so that plans, convergence
//! and stack outputs can be exercised end to end without a cloud account.
//! A persistent backend keeps its resources in a JSON file so that later
//! runs see what earlier runs created.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use super::{BackendConfig, Provisioned, ProvisioningBackend};
use crate::config::ConfigHasher;
use crate::error::{ProvisionError, Result as ThotResult, StateError};
use crate::resource::{Outputs, ResolvedInputs, ResourceKind};

/// Number of calls made per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `create` calls.
    pub create: usize,
    /// `update` calls.
    pub update: usize,
    /// `delete` calls.
    pub delete: usize,
    /// `read` calls.
    pub read: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulatedResource {
    logical_id: String,
    inputs: ResolvedInputs,
    outputs: Outputs,
}

/// One entry of the persisted resource file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredResource {
    kind: ResourceKind,
    physical_id: String,
    #[serde(flatten)]
    resource: SimulatedResource,
}

/// Simulated provisioning backend.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    config: BackendConfig,
    resources: Mutex<BTreeMap<(ResourceKind, String), SimulatedResource>>,
    failures: Mutex<BTreeMap<String, ProvisionError>>,
    latency: Option<Duration>,
    store_path: Option<PathBuf>,
    save_lock: tokio::sync::Mutex<()>,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    reads: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedBackend {
    /// Creates a simulated backend for the given account and region.
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Creates a backend whose resources survive across runs in `path`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the file exists but cannot be read or parsed.
    pub async fn persistent(config: BackendConfig, path: impl Into<PathBuf>) -> ThotResult<Self> {
        let path = path.into();
        let mut resources = BTreeMap::new();

        if path.exists() {
            let content = fs::read_to_string(&path).await.map_err(|e| StateError::Corrupted {
                message: format!("Failed to read {}: {e}", path.display()),
            })?;
            let stored: Vec<StoredResource> =
                serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
                    message: format!("Failed to parse {}: {e}", path.display()),
                })?;
            for entry in stored {
                resources.insert((entry.kind, entry.physical_id), entry.resource);
            }
            debug!("Loaded {} simulated resources from {}", resources.len(), path.display());
        }

        Ok(Self {
            config,
            resources: Mutex::new(resources),
            store_path: Some(path),
            ..Self::default()
        })
    }

    /// Adds artificial latency before every mutating call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every call for `logical_id` fail with `error`.
    pub fn fail_on(&self, logical_id: impl Into<String>, error: ProvisionError) {
        lock(&self.failures).insert(logical_id.into(), error);
    }

    /// Removes an injected failure.
    pub fn clear_failure(&self, logical_id: &str) {
        lock(&self.failures).remove(logical_id);
    }

    /// Removes a resource behind the engine's back.
    pub fn forget(&self, kind: ResourceKind, physical_id: &str) {
        lock(&self.resources).remove(&(kind, physical_id.to_string()));
    }

    /// Overwrites one output of an existing resource behind the engine's back.
    pub fn tamper(&self, kind: ResourceKind, physical_id: &str, output: &str, value: JsonValue) {
        if let Some(resource) = lock(&self.resources).get_mut(&(kind, physical_id.to_string())) {
            resource.outputs.insert(output.to_string(), value);
        }
    }

    /// Returns the call counters.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            create: self.creates.load(Ordering::SeqCst),
            update: self.updates.load(Ordering::SeqCst),
            delete: self.deletes.load(Ordering::SeqCst),
            read: self.reads.load(Ordering::SeqCst),
        }
    }

    /// Returns the number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        lock(&self.resources).len()
    }

    /// Returns true if a resource with this physical id exists.
    #[must_use]
    pub fn contains(&self, kind: ResourceKind, physical_id: &str) -> bool {
        lock(&self.resources).contains_key(&(kind, physical_id.to_string()))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Writes the resource map to the backing file, if any.
    async fn save(&self) -> Result<(), ProvisionError> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;

        let stored: Vec<StoredResource> = lock(&self.resources)
            .iter()
            .map(|((kind, physical_id), resource)| StoredResource {
                kind: *kind,
                physical_id: physical_id.clone(),
                resource: resource.clone(),
            })
            .collect();
        let content = serde_json::to_string_pretty(&stored).map_err(|e| {
            ProvisionError::unavailable(format!("Failed to serialize simulated resources: {e}"))
        })?;
        write_atomic(path, &content).await.map_err(|e| {
            ProvisionError::unavailable(format!("Failed to save {}: {e}", path.display()))
        })
    }

    fn injected_failure(&self, logical_id: &str) -> Result<(), ProvisionError> {
        match lock(&self.failures).get(logical_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Derives the physical id and outputs for a resource.
    fn derive(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        inputs: &ResolvedInputs,
    ) -> Result<(String, Outputs), ProvisionError> {
        let region = self.config.region.as_str();
        let account = self.config.account_or_default();
        let seed = ConfigHasher::hash_str(&format!("{account}/{region}/{}/{logical_id}", kind.as_str()));
        let content = ConfigHasher::hash_str(&format!("{seed}/{}", ConfigHasher::hash_inputs(inputs)));
        let upper = |hash: &str, len: usize| hash[..len].to_ascii_uppercase();

        let mut outputs = Outputs::new();
        let physical_id = match kind {
            ResourceKind::Bucket => {
                let name = required_str(inputs, "bucketName")?;
                outputs.insert("arn".into(), json!(format!("arn:aws:s3:::{name}")));
                outputs.insert("bucketName".into(), json!(name));
                outputs.insert(
                    "websiteEndpoint".into(),
                    json!(format!("http://{name}.s3-website-{region}.amazonaws.com")),
                );
                outputs.insert(
                    "regionalDomainName".into(),
                    json!(format!("{name}.s3.{region}.amazonaws.com")),
                );
                name.to_string()
            }
            ResourceKind::Certificate => {
                let id = format!("{}-{}-{}", &seed[..8], &seed[8..12], &seed[12..16]);
                let arn = format!("arn:aws:acm:{region}:{account}:certificate/{id}");
                outputs.insert("certificateId".into(), json!(id));
                outputs.insert("arn".into(), json!(arn));
                arn
            }
            ResourceKind::OriginAccessIdentity => {
                let id = format!("E{}", upper(&seed, 13));
                outputs.insert("identityId".into(), json!(id));
                outputs.insert("canonicalUserId".into(), json!(ConfigHasher::hash_str(&id)));
                id
            }
            ResourceKind::BucketPolicy => {
                let bucket = required_str(inputs, "bucket")?;
                let id = format!("{bucket}-policy-{}", &seed[..8]);
                outputs.insert("policyId".into(), json!(id));
                id
            }
            ResourceKind::Distribution => {
                let id = format!("E{}", upper(&seed, 13));
                let domain = format!("d{}.cloudfront.net", &seed[..13]);
                outputs.insert("distributionId".into(), json!(id));
                outputs.insert("url".into(), json!(format!("https://{domain}")));
                outputs.insert("domainName".into(), json!(domain));
                id
            }
            ResourceKind::BucketDeployment => {
                let id = format!("deploy-{}", &content[..12]);
                let invalidation = if inputs.contains_key("distributionId") {
                    json!(format!("I{}", upper(&content, 13)))
                } else {
                    JsonValue::Null
                };
                outputs.insert("deploymentId".into(), json!(id));
                outputs.insert("invalidationId".into(), invalidation);
                id
            }
            ResourceKind::Function => {
                let name = inputs
                    .get("functionName")
                    .and_then(JsonValue::as_str)
                    .map_or_else(|| format!("{logical_id}-{}", &seed[..8]), str::to_string);
                outputs.insert(
                    "arn".into(),
                    json!(format!("arn:aws:lambda:{region}:{account}:function:{name}")),
                );
                outputs.insert("functionName".into(), json!(name));
                name
            }
            ResourceKind::FunctionUrl => {
                let id = seed[..32].to_string();
                outputs.insert(
                    "url".into(),
                    json!(format!("https://{id}.lambda-url.{region}.on.aws/")),
                );
                outputs.insert("urlId".into(), json!(id));
                id
            }
        };

        Ok((physical_id, outputs))
    }
}

async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await?;
    }
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await
}

fn required_str<'a>(inputs: &'a ResolvedInputs, name: &str) -> Result<&'a str, ProvisionError> {
    inputs
        .get(name)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ProvisionError::rejected(format!("input '{name}' must be a string")))
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    async fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        inputs: &ResolvedInputs,
    ) -> Result<Provisioned, ProvisionError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.injected_failure(logical_id)?;

        let (physical_id, outputs) = self.derive(kind, logical_id, inputs)?;
        {
            let mut resources = lock(&self.resources);
            let key = (kind, physical_id.clone());
            if resources.contains_key(&key) {
                return Err(ProvisionError::rejected(format!(
                    "{kind} '{physical_id}' already exists"
                )));
            }
            resources.insert(
                key,
                SimulatedResource {
                    logical_id: logical_id.to_string(),
                    inputs: inputs.clone(),
                    outputs: outputs.clone(),
                },
            );
        }
        self.save().await?;
        debug!("Simulated create of {kind} '{logical_id}' as '{physical_id}'");

        Ok(Provisioned {
            physical_id,
            outputs,
        })
    }

    async fn update(
        &self,
        kind: ResourceKind,
        physical_id: &str,
        inputs: &ResolvedInputs,
    ) -> Result<Provisioned, ProvisionError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let key = (kind, physical_id.to_string());
        let logical_id = lock(&self.resources)
            .get(&key)
            .map(|resource| resource.logical_id.clone())
            .ok_or_else(|| ProvisionError::rejected(format!("{kind} '{physical_id}' not found")))?;
        self.injected_failure(&logical_id)?;

        let (new_physical_id, outputs) = self.derive(kind, &logical_id, inputs)?;
        {
            let mut resources = lock(&self.resources);
            resources.remove(&key);
            resources.insert(
                (kind, new_physical_id.clone()),
                SimulatedResource {
                    logical_id,
                    inputs: inputs.clone(),
                    outputs: outputs.clone(),
                },
            );
        }
        self.save().await?;

        Ok(Provisioned {
            physical_id: new_physical_id,
            outputs,
        })
    }

    async fn delete(&self, kind: ResourceKind, physical_id: &str) -> Result<(), ProvisionError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let key = (kind, physical_id.to_string());
        let logical_id = lock(&self.resources)
            .get(&key)
            .map(|resource| resource.logical_id.clone());
        if let Some(logical_id) = logical_id {
            self.injected_failure(&logical_id)?;
            lock(&self.resources).remove(&key);
            self.save().await?;
        }
        Ok(())
    }

    async fn read(
        &self,
        kind: ResourceKind,
        physical_id: &str,
    ) -> Result<Option<Provisioned>, ProvisionError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        Ok(lock(&self.resources)
            .get(&(kind, physical_id.to_string()))
            .map(|resource| {
                debug!(
                    "Simulated read of {kind} '{physical_id}' ({} inputs)",
                    resource.inputs.len()
                );
                Provisioned {
                    physical_id: physical_id.to_string(),
                    outputs: resource.outputs.clone(),
                }
            }))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, JsonValue)]) -> ResolvedInputs {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_outputs_are_deterministic_and_complete() {
        let a = SimulatedBackend::new(BackendConfig::default());
        let b = SimulatedBackend::new(BackendConfig::default());

        for kind in ResourceKind::ALL {
            let inputs = inputs(&[
                ("bucketName", json!("thot-site.com")),
                ("bucket", json!("thot-site.com")),
            ]);
            let first = a.create(kind, "res", &inputs).await.unwrap();
            let second = b.create(kind, "res", &inputs).await.unwrap();
            assert_eq!(first, second, "{kind}");

            for output in kind.schema().outputs {
                assert!(first.outputs.contains_key(*output), "{kind} missing {output}");
            }
            assert_eq!(
                first.outputs[kind.schema().id_output],
                json!(first.physical_id),
                "{kind}"
            );
        }
        assert_eq!(a.calls().create, ResourceKind::ALL.len());
    }

    #[tokio::test]
    async fn test_bucket_outputs_follow_region() {
        let backend = SimulatedBackend::new(BackendConfig {
            region: "eu-west-3".into(),
            ..BackendConfig::default()
        });
        let created = backend
            .create(
                ResourceKind::Bucket,
                "site-bucket",
                &inputs(&[("bucketName", json!("thot-site.com"))]),
            )
            .await
            .unwrap();

        assert_eq!(created.physical_id, "thot-site.com");
        assert_eq!(
            created.outputs["websiteEndpoint"],
            json!("http://thot-site.com.s3-website-eu-west-3.amazonaws.com")
        );
    }

    #[tokio::test]
    async fn test_failure_injection_and_delete() {
        let backend = SimulatedBackend::new(BackendConfig::default());
        backend.fail_on("oai", ProvisionError::unavailable("throttled"));

        let err = backend
            .create(ResourceKind::OriginAccessIdentity, "oai", &ResolvedInputs::new())
            .await
            .unwrap_err();
        assert_eq!(err, ProvisionError::unavailable("throttled"));
        assert_eq!(backend.resource_count(), 0);

        backend.clear_failure("oai");
        let created = backend
            .create(ResourceKind::OriginAccessIdentity, "oai", &ResolvedInputs::new())
            .await
            .unwrap();
        backend
            .delete(ResourceKind::OriginAccessIdentity, &created.physical_id)
            .await
            .unwrap();
        backend
            .delete(ResourceKind::OriginAccessIdentity, &created.physical_id)
            .await
            .unwrap();
        assert!(
            backend
                .read(ResourceKind::OriginAccessIdentity, &created.physical_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_persistent_resources_survive_a_new_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("site-dev.simulated.json");
        let bucket = inputs(&[("bucketName", json!("thot-site.com"))]);

        let first = SimulatedBackend::persistent(BackendConfig::default(), &path)
            .await
            .unwrap();
        let created = first.create(ResourceKind::Bucket, "site-bucket", &bucket).await.unwrap();
        let oai = first
            .create(ResourceKind::OriginAccessIdentity, "site-oai", &ResolvedInputs::new())
            .await
            .unwrap();
        drop(first);

        let second = SimulatedBackend::persistent(BackendConfig::default(), &path)
            .await
            .unwrap();
        assert_eq!(second.resource_count(), 2);
        let read = second
            .read(ResourceKind::Bucket, &created.physical_id)
            .await
            .unwrap();
        assert_eq!(read, Some(created.clone()));

        let changed = inputs(&[
            ("bucketName", json!("thot-site.com")),
            ("websiteIndexDocument", json!("home.html")),
        ]);
        let updated = second
            .update(ResourceKind::Bucket, &created.physical_id, &changed)
            .await
            .unwrap();
        assert_eq!(updated.physical_id, created.physical_id);
        second
            .delete(ResourceKind::OriginAccessIdentity, &oai.physical_id)
            .await
            .unwrap();

        let third = SimulatedBackend::persistent(BackendConfig::default(), &path)
            .await
            .unwrap();
        assert_eq!(third.resource_count(), 1);
        assert!(!third.contains(ResourceKind::OriginAccessIdentity, &oai.physical_id));
    }

    #[tokio::test]
    async fn test_corrupted_resource_file_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.simulated.json");
        std::fs::write(&path, "not json").unwrap();

        let err = SimulatedBackend::persistent(BackendConfig::default(), &path)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken.simulated.json"));
    }

    #[tokio::test]
    async fn test_update_of_unknown_resource_is_rejected() {
        let backend = SimulatedBackend::new(BackendConfig::default());
        let err = backend
            .update(ResourceKind::Function, "ghost", &ResolvedInputs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::BackendRejected { .. }));
    }
}

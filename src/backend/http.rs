//! HTTP provisioning service backend.
//!
//! Forwards every call to a remote provisioning service. Transient failures
//! (429, 5xx, connection errors) are retried here with a linear backoff; the
//! engine above never retries.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url, header};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{BackendConfig, Provisioned, ProvisioningBackend};
use crate::error::ProvisionError;
use crate::resource::{ResolvedInputs, ResourceKind};

/// Maximum number of attempts for retryable failures.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Header carrying the target region.
const REGION_HEADER: &str = "x-thot-region";

/// Header carrying the target account.
const ACCOUNT_HEADER: &str = "x-thot-account";

/// Client for a remote provisioning service.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// HTTP client.
    client: Client,
    /// Service base URL.
    endpoint: Url,
    /// Bearer token, if any.
    token: Option<String>,
    /// Account and region context.
    config: BackendConfig,
    /// Base delay between retries.
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    kind: ResourceKind,
    logical_id: &'a str,
    inputs: &'a ResolvedInputs,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    inputs: &'a ResolvedInputs,
}

impl HttpBackend {
    /// Creates a backend from its configuration and an optional bearer token.
    ///
    /// # Errors
    ///
    /// Returns `BackendRejected` if the endpoint is missing or invalid, or
    /// `BackendUnavailable` if the HTTP client cannot be created.
    pub fn new(config: BackendConfig, token: Option<String>) -> Result<Self, ProvisionError> {
        let raw = config
            .endpoint
            .as_deref()
            .ok_or_else(|| ProvisionError::rejected("HTTP backend requires an endpoint"))?;
        let endpoint = Url::parse(raw)
            .map_err(|e| ProvisionError::rejected(format!("Invalid endpoint '{raw}': {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProvisionError::unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token,
            config,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Overrides the base retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Builds `{endpoint}/v1/resources[/kind/physical_id]`.
    fn resource_url(&self, target: Option<(ResourceKind, &str)>) -> Result<Url, ProvisionError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| ProvisionError::rejected("Endpoint cannot be a base URL"))?;
            segments.pop_if_empty().extend(["v1", "resources"]);
            if let Some((kind, physical_id)) = target {
                segments.extend([kind.as_str(), physical_id]);
            }
        }
        Ok(url)
    }

    /// Adds authentication and context headers.
    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request.header(REGION_HEADER, &self.config.region);
        if let Some(account) = &self.config.account {
            request = request.header(ACCOUNT_HEADER, account);
        }
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        request
    }

    /// Sends a request, retrying retryable failures.
    ///
    /// A 404 is returned to the caller as a response so it can decide what
    /// a missing resource means for the operation.
    async fn send<F>(&self, operation: &str, build: F) -> Result<Response, ProvisionError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {operation}");
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            match self.send_once(operation, self.decorate(build())).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!("{operation} failed, will retry: {e}");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProvisionError::unavailable("Max retries exceeded")))
    }

    async fn send_once(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<Response, ProvisionError> {
        trace!("Sending {operation} request");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProvisionError::Timeout {
                    operation: operation.to_string(),
                    after_secs: self.config.request_timeout_secs,
                }
            } else {
                ProvisionError::unavailable(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(operation, status, body, self.config.request_timeout_secs))
    }

    async fn parse(response: Response) -> Result<Provisioned, ProvisionError> {
        response
            .json::<Provisioned>()
            .await
            .map_err(|e| ProvisionError::rejected(format!("Invalid response body: {e}")))
    }
}

/// Maps a non-success status to a provisioning error.
fn classify(operation: &str, status: StatusCode, body: String, timeout_secs: u64) -> ProvisionError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    match status.as_u16() {
        408 => ProvisionError::Timeout {
            operation: operation.to_string(),
            after_secs: timeout_secs,
        },
        429 | 500..=599 => ProvisionError::unavailable(message),
        _ => ProvisionError::rejected(message),
    }
}

#[async_trait]
impl ProvisioningBackend for HttpBackend {
    async fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        inputs: &ResolvedInputs,
    ) -> Result<Provisioned, ProvisionError> {
        let url = self.resource_url(None)?;
        let body = CreateRequest {
            kind,
            logical_id,
            inputs,
        };
        let response = self
            .send("create", || self.client.post(url.clone()).json(&body))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProvisionError::rejected("Resource endpoint not found"));
        }
        Self::parse(response).await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        physical_id: &str,
        inputs: &ResolvedInputs,
    ) -> Result<Provisioned, ProvisionError> {
        let url = self.resource_url(Some((kind, physical_id)))?;
        let body = UpdateRequest { inputs };
        let response = self
            .send("update", || self.client.put(url.clone()).json(&body))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProvisionError::rejected(format!(
                "{kind} '{physical_id}' not found"
            )));
        }
        Self::parse(response).await
    }

    async fn delete(&self, kind: ResourceKind, physical_id: &str) -> Result<(), ProvisionError> {
        let url = self.resource_url(Some((kind, physical_id)))?;
        let response = self
            .send("delete", || self.client.delete(url.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("{kind} '{physical_id}' was already gone");
        }
        Ok(())
    }

    async fn read(
        &self,
        kind: ResourceKind,
        physical_id: &str,
    ) -> Result<Option<Provisioned>, ProvisionError> {
        let url = self.resource_url(Some((kind, physical_id)))?;
        let response = self.send("read", || self.client.get(url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse(response).await.map(Some)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

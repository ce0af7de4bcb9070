//! HTTP implementation of the provider client
//!
//! Speaks the provider's JSON control API under a single base URL with a
//! bearer token. Checkpoint creation is a streaming endpoint: the provider
//! emits NDJSON progress events and the checkpoint id arrives only in the
//! terminal event.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::{
    with_retries, DeployStatus, ExecResult, Provider, ProviderError, ServiceSummary,
};

const EXEC_RETRIES: u32 = 3;
const EXEC_RETRY_DELAY: Duration = Duration::from_millis(250);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct CreateServiceRequest<'a> {
    name: &'a str,
    env: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct ServiceCreated {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceInfo {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    environment_ids: Vec<String>,
    latest_deploy_status: Option<String>,
}

#[derive(Deserialize)]
struct ServiceListing {
    services: Vec<ServiceInfo>,
}

#[derive(Deserialize)]
struct DomainCreated {
    fqdn: String,
}

#[derive(Deserialize)]
struct DomainListing {
    domains: Vec<DomainCreated>,
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    script: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecResponse {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    name: &'a str,
    command: &'a str,
    restart_on_wake: bool,
}

#[derive(Serialize)]
struct CheckpointRequest<'a> {
    label: &'a str,
}

/// One NDJSON event from the checkpoint stream
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointEvent {
    event: String,
    checkpoint_id: Option<String>,
    message: Option<String>,
}

/// Client for the provider's JSON control API
pub struct HttpProvider {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpProvider {
    /// Create a new provider client
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the control API, no trailing slash
    /// * `token` - Bearer token for the provider account
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Convert a non-2xx response into the matching error kind
    async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound)
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(ProviderError::Transient(format!("{}: {}", status, body)))
        } else {
            Err(ProviderError::Fatal(format!("{}: {}", status, body)))
        }
    }

    async fn exec_once(&self, service_id: &str, script: &str) -> Result<ExecResult, ProviderError> {
        let res = self
            .client
            .post(self.url(&format!("/v1/services/{}/exec", service_id)))
            .bearer_auth(&self.token)
            .timeout(EXEC_TIMEOUT)
            .json(&ExecRequest { script })
            .send()
            .await?;
        let res = Self::check_status(res).await?;
        let body: ExecResponse = res
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("bad exec response: {}", e)))?;
        Ok(ExecResult {
            stdout: body.stdout,
            stderr: body.stderr,
            exit_code: body.exit_code,
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create_service(
        &self,
        name: &str,
        env: &HashMap<String, String>,
    ) -> Result<String, ProviderError> {
        let res = self
            .client
            .post(self.url("/v1/services"))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .json(&CreateServiceRequest { name, env })
            .send()
            .await?;
        let res = Self::check_status(res).await?;
        let created: ServiceCreated = res
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("bad create response: {}", e)))?;

        // The provider kicks off a build the moment a service exists. Kill it
        // so the only deployment is the controlled one issued afterwards.
        self.cancel_deployments(&created.id).await?;

        Ok(created.id)
    }

    async fn deploy(&self, service_id: &str) -> Result<(), ProviderError> {
        let res = self
            .client
            .post(self.url(&format!("/v1/services/{}/deployments", service_id)))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check_status(res).await?;
        Ok(())
    }

    async fn cancel_deployments(&self, service_id: &str) -> Result<(), ProviderError> {
        let res = self
            .client
            .delete(self.url(&format!("/v1/services/{}/deployments", service_id)))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        match Self::check_status(res).await {
            Ok(_) | Err(ProviderError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_domain(&self, service_id: &str) -> Result<String, ProviderError> {
        let res = self
            .client
            .post(self.url(&format!("/v1/services/{}/domains", service_id)))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let res = Self::check_status(res).await?;
        let created: DomainCreated = res
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("bad domain response: {}", e)))?;
        Ok(format!("https://{}", created.fqdn))
    }

    async fn service_url(&self, service_id: &str) -> Result<Option<String>, ProviderError> {
        let res = self
            .client
            .get(self.url(&format!("/v1/services/{}/domains", service_id)))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let res = match Self::check_status(res).await {
            Ok(res) => res,
            Err(ProviderError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let listing: DomainListing = res
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("bad domain listing: {}", e)))?;
        Ok(listing
            .domains
            .into_iter()
            .next()
            .map(|d| format!("https://{}", d.fqdn)))
    }

    async fn list_services(&self) -> Result<Vec<ServiceSummary>, ProviderError> {
        let res = self
            .client
            .get(self.url("/v1/services"))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let res = Self::check_status(res).await?;
        let listing: ServiceListing = res
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("bad service listing: {}", e)))?;
        Ok(listing
            .services
            .into_iter()
            .map(|svc| ServiceSummary {
                id: svc.id,
                name: svc.name,
                created_at: svc.created_at,
                environment_ids: svc.environment_ids,
                deploy_status: svc.latest_deploy_status.as_deref().map(DeployStatus::parse),
            })
            .collect())
    }

    async fn delete_service(&self, service_id: &str) -> Result<(), ProviderError> {
        let res = self
            .client
            .delete(self.url(&format!("/v1/services/{}", service_id)))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .query(&[("purge_volumes", "true")])
            .send()
            .await?;
        match Self::check_status(res).await {
            // Already gone counts as deleted
            Ok(_) | Err(ProviderError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename_service(&self, service_id: &str, name: &str) -> Result<(), ProviderError> {
        let res = self
            .client
            .patch(self.url(&format!("/v1/services/{}", service_id)))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Self::check_status(res).await?;
        Ok(())
    }

    async fn exec(&self, service_id: &str, script: &str) -> Result<ExecResult, ProviderError> {
        with_retries(EXEC_RETRIES, EXEC_RETRY_DELAY, || {
            self.exec_once(service_id, script)
        })
        .await
    }

    async fn start_detached(
        &self,
        service_id: &str,
        name: &str,
        command: &str,
    ) -> Result<(), ProviderError> {
        let res = self
            .client
            .post(self.url(&format!("/v1/services/{}/processes", service_id)))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .json(&ProcessRequest {
                name,
                command,
                restart_on_wake: true,
            })
            .send()
            .await?;
        Self::check_status(res).await?;
        Ok(())
    }

    async fn create_checkpoint(
        &self,
        service_id: &str,
        label: &str,
    ) -> Result<String, ProviderError> {
        let res = self
            .client
            .post(self.url(&format!("/v1/services/{}/checkpoints", service_id)))
            .bearer_auth(&self.token)
            .timeout(EXEC_TIMEOUT)
            .json(&CheckpointRequest { label })
            .send()
            .await?;
        let res = Self::check_status(res).await?;

        // NDJSON event stream; chunks may split lines, so buffer on newlines
        // and parse each complete line as one event.
        let mut stream = res.bytes_stream();
        let mut buffer = String::new();
        let mut checkpoint_id = None;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(ProviderError::from)?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<CheckpointEvent>(&line) {
                    Ok(event) => match event.event.as_str() {
                        "complete" => checkpoint_id = event.checkpoint_id,
                        "error" => {
                            return Err(ProviderError::Fatal(format!(
                                "checkpoint failed: {}",
                                event.message.unwrap_or_default()
                            )))
                        }
                        _ => {}
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping unparseable checkpoint event");
                    }
                }
            }
        }

        checkpoint_id.ok_or_else(|| {
            ProviderError::Fatal("checkpoint stream ended without a checkpoint id".to_string())
        })
    }

    async fn restore_checkpoint(
        &self,
        service_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), ProviderError> {
        let res = self
            .client
            .post(self.url(&format!(
                "/v1/services/{}/checkpoints/{}/restore",
                service_id, checkpoint_id
            )))
            .bearer_auth(&self.token)
            .timeout(EXEC_TIMEOUT)
            .send()
            .await?;
        Self::check_status(res).await?;
        Ok(())
    }
}

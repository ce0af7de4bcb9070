//! Remote compute provider client
//!
//! The provider hosts the actual agent instances. Everything the pool needs
//! from it fits behind the narrow [`Provider`] trait: create and destroy
//! services, read deployment status, allocate public domains, run shell
//! inside instances, and snapshot/restore filesystems.
//!
//! Failure semantics are uniform across operations:
//! - [`ProviderError::Transient`] and [`ProviderError::Timeout`] are retried
//!   by callers with bounded attempts
//! - [`ProviderError::NotFound`] is success for deletes and instance-gone
//!   everywhere else
//! - [`ProviderError::Fatal`] propagates

pub mod http;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use http::HttpProvider;

/// Deployment status as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployStatus {
    Queued,
    Waiting,
    Building,
    Deploying,
    Sleeping,
    Success,
    Failed,
    Crashed,
    Removed,
    Skipped,
    /// Any status string this client does not know about
    Unknown(String),
}

impl DeployStatus {
    /// Parse a provider status string; unknown values are preserved
    pub fn parse(raw: &str) -> Self {
        match raw {
            "QUEUED" => DeployStatus::Queued,
            "WAITING" => DeployStatus::Waiting,
            "BUILDING" => DeployStatus::Building,
            "DEPLOYING" => DeployStatus::Deploying,
            "SLEEPING" => DeployStatus::Sleeping,
            "SUCCESS" => DeployStatus::Success,
            "FAILED" => DeployStatus::Failed,
            "CRASHED" => DeployStatus::Crashed,
            "REMOVED" => DeployStatus::Removed,
            "SKIPPED" => DeployStatus::Skipped,
            other => DeployStatus::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeployStatus::Queued => "QUEUED",
            DeployStatus::Waiting => "WAITING",
            DeployStatus::Building => "BUILDING",
            DeployStatus::Deploying => "DEPLOYING",
            DeployStatus::Sleeping => "SLEEPING",
            DeployStatus::Success => "SUCCESS",
            DeployStatus::Failed => "FAILED",
            DeployStatus::Crashed => "CRASHED",
            DeployStatus::Removed => "REMOVED",
            DeployStatus::Skipped => "SKIPPED",
            DeployStatus::Unknown(raw) => raw,
        }
    }
}

impl serde::Serialize for DeployStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One service from the batched provider listing
#[derive(Debug, Clone)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub environment_ids: Vec<String>,
    /// Latest deployment status, if the service has ever deployed
    pub deploy_status: Option<DeployStatus>,
}

/// Result of a synchronous shell execution inside an instance
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Error type for provider operations
#[derive(Debug)]
pub enum ProviderError {
    /// Transport-level or 5xx failure; safe to retry with bounded attempts
    Transient(String),
    /// The referenced service or resource does not exist
    NotFound,
    /// A request exceeded its deadline
    Timeout(String),
    /// Unrecoverable failure; propagated to the caller
    Fatal(String),
}

impl ProviderError {
    /// Whether bounded retry is appropriate
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transient(msg) => write!(f, "transient provider error: {}", msg),
            ProviderError::NotFound => write!(f, "provider resource not found"),
            ProviderError::Timeout(msg) => write!(f, "provider request timed out: {}", msg),
            ProviderError::Fatal(msg) => write!(f, "fatal provider error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            ProviderError::Transient(e.to_string())
        } else {
            ProviderError::Fatal(e.to_string())
        }
    }
}

/// Narrow interface to the remote compute provider
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create a service from the fixed source and seed its environment.
    /// Suppresses any deployment the provider auto-starts as a side effect;
    /// the controlled deploy happens separately via [`Provider::deploy`].
    async fn create_service(
        &self,
        name: &str,
        env: &HashMap<String, String>,
    ) -> Result<String, ProviderError>;

    /// Issue exactly one controlled deploy from the configured commit
    async fn deploy(&self, service_id: &str) -> Result<(), ProviderError>;

    /// Cancel any in-progress deployments on the service
    async fn cancel_deployments(&self, service_id: &str) -> Result<(), ProviderError>;

    /// Allocate a public hostname for the service
    async fn create_domain(&self, service_id: &str) -> Result<String, ProviderError>;

    /// Resolve the service's public base URL, if a domain exists
    async fn service_url(&self, service_id: &str) -> Result<Option<String>, ProviderError>;

    /// Single batched listing of all services in the account.
    /// An `Err` is the "listing unavailable" signal: callers must not take
    /// destructive action on the strength of a failed listing.
    async fn list_services(&self) -> Result<Vec<ServiceSummary>, ProviderError>;

    /// Delete the service and purge any orphan volumes. Deleting a service
    /// that is already gone is success.
    async fn delete_service(&self, service_id: &str) -> Result<(), ProviderError>;

    /// Rename the service. Cosmetic only; never load-bearing.
    async fn rename_service(&self, service_id: &str, name: &str) -> Result<(), ProviderError>;

    /// Run a shell script inside the instance and wait for it to finish
    async fn exec(&self, service_id: &str, script: &str) -> Result<ExecResult, ProviderError>;

    /// Register a named long-lived process inside the instance. The provider
    /// restarts it after hibernation wake; re-registering the same name
    /// replaces the previous registration rather than duplicating it.
    async fn start_detached(
        &self,
        service_id: &str,
        name: &str,
        command: &str,
    ) -> Result<(), ProviderError>;

    /// Whether this provider supports filesystem checkpoints
    fn supports_checkpoints(&self) -> bool {
        true
    }

    /// Capture a filesystem checkpoint and return its id
    async fn create_checkpoint(
        &self,
        service_id: &str,
        label: &str,
    ) -> Result<String, ProviderError>;

    /// Reset the instance filesystem to a checkpoint; processes are killed
    async fn restore_checkpoint(
        &self,
        service_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), ProviderError>;
}

/// Retry an operation a bounded number of times on transient errors
///
/// Non-transient errors return immediately. The final transient error is
/// returned once attempts are exhausted.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::debug!(attempt, error = %e, "retrying transient provider error");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_status_parse_roundtrip() {
        for raw in [
            "QUEUED", "WAITING", "BUILDING", "DEPLOYING", "SLEEPING", "SUCCESS", "FAILED",
            "CRASHED", "REMOVED", "SKIPPED",
        ] {
            assert_eq!(DeployStatus::parse(raw).as_str(), raw);
        }
    }

    #[test]
    fn test_deploy_status_unknown_preserved() {
        let status = DeployStatus::parse("NEEDS_APPROVAL");
        assert_eq!(status, DeployStatus::Unknown("NEEDS_APPROVAL".to_string()));
        assert_eq!(status.as_str(), "NEEDS_APPROVAL");
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_on_fatal() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(3, Duration::ZERO, || {
            calls += 1;
            async { Err(ProviderError::Fatal("nope".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Fatal(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_retries_retries_transient() {
        let mut calls = 0;
        let result = with_retries(3, Duration::ZERO, || {
            calls += 1;
            let ok = calls == 3;
            async move {
                if ok {
                    Ok(42)
                } else {
                    Err(ProviderError::Transient("flaky".to_string()))
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls, 3);
    }
}

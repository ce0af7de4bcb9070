//! Instance creation cold path
//!
//! Provisioning walks a new service from nothing to a warm, checkpointed
//! instance: controlled deploy, config files, gateway registration,
//! readiness poll, clean-state audit, golden checkpoint. Any failure rolls
//! the whole thing back best-effort so a half-built instance never lingers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::metrics;
use crate::provider::{with_retries, ProviderError};

use super::{generate_instance_id, Instance, PoolManager};

/// Path of the agent config file inside each instance
const AGENT_CONFIG_PATH: &str = "/opt/agent/config.json";
/// Path of the dotenv file holding provider-specific secrets
const AGENT_ENV_PATH: &str = "/opt/agent/.env";
/// Directories that must be empty before the golden checkpoint is taken.
/// A checkpoint that captures an identity poisons every later recycle.
const IDENTITY_DIR: &str = "/opt/agent/identity";
const CONVERSATIONS_DIR: &str = "/opt/agent/conversations";
/// Name of the provider-side process slot running the gateway
pub(crate) const GATEWAY_PROCESS: &str = "gateway";
/// Command the provider restarts after hibernation wake
pub(crate) const GATEWAY_COMMAND: &str = "convos-gateway --config /opt/agent/config.json";

const STEP_RETRIES: u32 = 3;
const STEP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Error type for instance creation
#[derive(Debug)]
pub enum ProvisionError {
    Provider(ProviderError),
    /// A config or audit script exited non-zero
    ExecFailed(String),
    /// The gateway never reported ready within the create timeout
    CreateTimeout,
    /// Identity or conversation files existed before the checkpoint
    DirtyState(String),
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionError::Provider(e) => write!(f, "provider error: {}", e),
            ProvisionError::ExecFailed(msg) => write!(f, "instance script failed: {}", msg),
            ProvisionError::CreateTimeout => write!(f, "gateway never became ready"),
            ProvisionError::DirtyState(files) => {
                write!(f, "instance not clean before checkpoint: {}", files)
            }
        }
    }
}

impl std::error::Error for ProvisionError {}

impl From<ProviderError> for ProvisionError {
    fn from(e: ProviderError) -> Self {
        ProvisionError::Provider(e)
    }
}

impl PoolManager {
    /// Create, deploy, and warm a brand new instance
    ///
    /// Returns the instance id once the gateway reports ready and the golden
    /// checkpoint (where supported) is captured. The service id is held in
    /// the claim-in-progress set for the duration so the reconciler neither
    /// reinterprets nor removes the half-built entry.
    pub async fn create_instance(self: &Arc<Self>) -> Result<String, ProvisionError> {
        let started = Instant::now();
        let instance_id = generate_instance_id();
        let name = self.config.service_name(&instance_id);

        let mut env = HashMap::new();
        env.insert("CONVOS_ENV".to_string(), self.config.environment.clone());
        env.insert("CONVOPOOL_MANAGED".to_string(), "1".to_string());

        info!(instance = %instance_id, service = %name, "creating instance");
        let service_id = self.provider.create_service(&name, &env).await?;

        let _guard = self.claims.try_insert(&service_id);
        self.cache.insert(Instance::starting(
            instance_id.clone(),
            service_id.clone(),
            name,
        ));

        match self.provision(&instance_id, &service_id).await {
            Ok(()) => {
                metrics::CREATE_DURATION.observe(started.elapsed().as_secs_f64());
                info!(
                    instance = %instance_id,
                    elapsed_s = started.elapsed().as_secs(),
                    "instance ready"
                );
                Ok(instance_id)
            }
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "provisioning failed, rolling back");
                metrics::CREATE_FAILURES_TOTAL.inc();
                self.rollback(&instance_id, &service_id).await;
                Err(e)
            }
        }
    }

    async fn provision(
        self: &Arc<Self>,
        instance_id: &str,
        service_id: &str,
    ) -> Result<(), ProvisionError> {
        // The provider may have auto-started a build on create; make sure the
        // only deployment is the controlled one from the configured commit.
        self.provider.cancel_deployments(service_id).await?;
        self.provider.deploy(service_id).await?;

        let url = self.provider.create_domain(service_id).await?;
        self.cache.update(instance_id, |i| i.url = Some(url.clone()));

        // Config files must land before the gateway starts so that restart
        // and restore paths always find a valid config on disk.
        let script = self.render_config_script();
        let result = with_retries(STEP_RETRIES, STEP_RETRY_DELAY, || {
            self.provider.exec(service_id, &script)
        })
        .await?;
        if !result.success() {
            return Err(ProvisionError::ExecFailed(format!(
                "config write exited {}: {}",
                result.exit_code, result.stderr
            )));
        }

        with_retries(STEP_RETRIES, STEP_RETRY_DELAY, || {
            self.provider
                .start_detached(service_id, GATEWAY_PROCESS, GATEWAY_COMMAND)
        })
        .await?;

        self.wait_ready(&url, self.config.create_timeout).await?;

        // Pre-checkpoint audit: the golden checkpoint must capture a state
        // with no identity and no conversation on disk.
        let audit = self
            .provider
            .exec(service_id, &audit_script())
            .await?;
        let leftovers = audit.stdout.trim();
        if !leftovers.is_empty() {
            return Err(ProvisionError::DirtyState(leftovers.to_string()));
        }

        if self.provider.supports_checkpoints() {
            let checkpoint_id = self.provider.create_checkpoint(service_id, "golden").await?;
            self.cache
                .update(instance_id, |i| i.checkpoint_id = Some(checkpoint_id.clone()));
        }

        Ok(())
    }

    /// Poll the gateway until it reports ready or the deadline passes
    pub(crate) async fn wait_ready(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(probe) = self.gateway.probe(url).await {
                if probe.ready {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::CreateTimeout);
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    /// Best-effort teardown of a failed creation
    async fn rollback(&self, instance_id: &str, service_id: &str) {
        self.cache.remove(instance_id);
        if let Err(e) = self.provider.delete_service(service_id).await {
            warn!(service_id = %service_id, error = %e, "rollback delete failed");
        }
        if let Err(e) = self.store.delete(instance_id) {
            warn!(instance = %instance_id, error = %e, "rollback metadata delete failed");
        }
    }

    /// Fire-and-forget creation with circuit-breaker feedback
    pub(crate) fn spawn_create(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match manager.create_instance().await {
                Ok(_) => manager
                    .breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .record_success(),
                Err(e) => {
                    warn!(error = %e, "background instance creation failed");
                    manager
                        .breaker
                        .lock()
                        .expect("breaker lock poisoned")
                        .record_failure(Instant::now());
                }
            }
        });
    }

    /// Spawn a creation if the pool has room for one more instance
    pub(crate) fn maybe_backfill(self: &Arc<Self>) {
        if self.cache.counts().total() < self.config.max_total {
            self.spawn_create();
        }
    }

    /// Shell script that writes the agent config and dotenv into the instance
    fn render_config_script(&self) -> String {
        let agent_config = serde_json::json!({
            "channels": {
                "convos": { "enabled": true, "env": self.config.environment }
            },
            "gateway": {
                "port": self.config.gateway_port,
                "bind": "0.0.0.0",
                "authToken": generate_instance_id(),
            }
        });
        let config_json =
            serde_json::to_string_pretty(&agent_config).unwrap_or_else(|_| "{}".to_string());

        format!(
            "set -e\n\
             mkdir -p /opt/agent /workspace\n\
             cat > {config} <<'CONFIG_EOF'\n{json}\nCONFIG_EOF\n\
             cat > {env} <<'ENV_EOF'\nMODEL_API_KEY={key}\nENV_EOF\n\
             chmod 600 {env}\n",
            config = AGENT_CONFIG_PATH,
            json = config_json,
            env = AGENT_ENV_PATH,
            key = self.config.model_api_key,
        )
    }
}

/// Shell script printing any identity or conversation files present
fn audit_script() -> String {
    format!(
        "ls -A {} {} 2>/dev/null || true",
        IDENTITY_DIR, CONVERSATIONS_DIR
    )
}

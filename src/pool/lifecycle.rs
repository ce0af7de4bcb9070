//! Recycle, destroy, and cleanup primitives
//!
//! Recycle returns a claimed instance to idle without a rebuild by restoring
//! the golden checkpoint. Destroy is the unconditional teardown and the
//! fallback whenever recycle cannot run or fails partway.

use std::sync::Arc;

use tracing::{info, warn};

use crate::metrics;
use crate::provider::ProviderError;

use super::provision::{ProvisionError, GATEWAY_COMMAND, GATEWAY_PROCESS};
use super::{PoolManager, PoolState};

/// Error type for recycle/destroy operations
#[derive(Debug)]
pub enum LifecycleError {
    /// The instance is not in the cache
    NotFound,
    /// Another claim or mutation currently owns the instance
    Busy,
    /// Dismiss was called on an entry that is not crashed
    NotCrashed,
    Provider(ProviderError),
    Provision(ProvisionError),
    Store(std::io::Error),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::NotFound => write!(f, "instance not found"),
            LifecycleError::Busy => write!(f, "instance is busy with another operation"),
            LifecycleError::NotCrashed => write!(f, "instance is not in the crashed state"),
            LifecycleError::Provider(e) => write!(f, "provider error: {}", e),
            LifecycleError::Provision(e) => write!(f, "{}", e),
            LifecycleError::Store(e) => write!(f, "metadata store error: {}", e),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<ProviderError> for LifecycleError {
    fn from(e: ProviderError) -> Self {
        LifecycleError::Provider(e)
    }
}

impl From<std::io::Error> for LifecycleError {
    fn from(e: std::io::Error) -> Self {
        LifecycleError::Store(e)
    }
}

impl PoolManager {
    /// Recycle the instance if a golden checkpoint is known, destroy it
    /// otherwise. Returns whether the instance was recycled.
    pub async fn recycle_or_destroy(
        self: &Arc<Self>,
        instance_id: &str,
    ) -> Result<bool, LifecycleError> {
        let instance = self.cache.get(instance_id).ok_or(LifecycleError::NotFound)?;

        let checkpoint_id = match &instance.checkpoint_id {
            Some(id) => id.clone(),
            None => {
                info!(instance = %instance_id, "no checkpoint recorded, destroying instead");
                self.destroy(instance_id, true).await?;
                return Ok(false);
            }
        };

        match self.recycle(instance_id, &checkpoint_id).await {
            Ok(()) => Ok(true),
            Err(LifecycleError::NotFound) => Err(LifecycleError::NotFound),
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "recycle failed, destroying");
                self.destroy(instance_id, true).await?;
                Ok(false)
            }
        }
    }

    /// Reset an instance to its golden checkpoint and wait for it to warm up
    async fn recycle(
        self: &Arc<Self>,
        instance_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), LifecycleError> {
        let instance = self.cache.get(instance_id).ok_or(LifecycleError::NotFound)?;
        let _guard = self
            .claims
            .try_insert(&instance.service_id)
            .ok_or(LifecycleError::Busy)?;

        info!(instance = %instance_id, checkpoint = %checkpoint_id, "recycling instance");

        // Restore kills everything in the instance, gateway included
        self.provider
            .restore_checkpoint(&instance.service_id, checkpoint_id)
            .await?;
        self.provider
            .start_detached(&instance.service_id, GATEWAY_PROCESS, GATEWAY_COMMAND)
            .await?;

        let url = instance.url.clone().ok_or_else(|| {
            LifecycleError::Provider(ProviderError::Fatal(
                "instance has no public url".to_string(),
            ))
        })?;
        self.wait_ready(&url, self.config.recycle_ready_timeout)
            .await
            .map_err(LifecycleError::Provision)?;

        self.store.delete(instance_id)?;

        // Undo the cosmetic claim-time rename; failure does not matter
        let base_name = self.config.service_name(instance_id);
        if let Err(e) = self
            .provider
            .rename_service(&instance.service_id, &base_name)
            .await
        {
            warn!(instance = %instance_id, error = %e, "cosmetic rename failed");
        }

        self.cache.update(instance_id, |entry| {
            entry.state = PoolState::Idle;
            entry.name = base_name.clone();
            entry.agent_name = None;
            entry.claimed_at = None;
            entry.conversation_id = None;
            entry.invite_url = None;
            entry.instructions = None;
        });

        info!(instance = %instance_id, "instance recycled to idle");
        Ok(())
    }

    /// Unconditional teardown: metadata, provider service, cache entry
    pub async fn destroy(
        self: &Arc<Self>,
        instance_id: &str,
        backfill: bool,
    ) -> Result<(), LifecycleError> {
        let instance = self.cache.get(instance_id).ok_or(LifecycleError::NotFound)?;
        let _guard = self
            .claims
            .try_insert(&instance.service_id)
            .ok_or(LifecycleError::Busy)?;

        info!(instance = %instance_id, service = %instance.name, "destroying instance");

        if let Err(e) = self.store.delete(instance_id) {
            warn!(instance = %instance_id, error = %e, "metadata delete failed");
        }
        self.provider.delete_service(&instance.service_id).await?;
        self.cache.remove(instance_id);
        metrics::CLEANUPS_TOTAL.inc();

        if backfill {
            self.maybe_backfill();
        }
        Ok(())
    }

    /// Dismiss a crashed entry: delete the service and the metadata row
    pub async fn dismiss_crashed(
        self: &Arc<Self>,
        instance_id: &str,
    ) -> Result<(), LifecycleError> {
        let instance = self.cache.get(instance_id).ok_or(LifecycleError::NotFound)?;
        if instance.state != PoolState::Crashed {
            return Err(LifecycleError::NotCrashed);
        }

        info!(instance = %instance_id, "dismissing crashed instance");
        self.provider.delete_service(&instance.service_id).await?;
        if let Err(e) = self.store.delete(instance_id) {
            warn!(instance = %instance_id, error = %e, "metadata delete failed");
        }
        self.cache.remove(instance_id);
        Ok(())
    }

    /// Destroy up to `count` idle instances without backfilling
    ///
    /// Returns how many were actually drained.
    pub async fn drain(self: &Arc<Self>, count: usize) -> usize {
        let mut drained = 0;
        for instance in self.instances() {
            if drained >= count {
                break;
            }
            if instance.state != PoolState::Idle {
                continue;
            }
            match self.destroy(&instance.id, false).await {
                Ok(()) => drained += 1,
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "drain destroy failed")
                }
            }
        }
        drained
    }

    /// Shared cleanup primitive used by the heartbeat
    ///
    /// Deletes the service if it still exists, removes the metadata row, and
    /// drops the cache entry. Never fails; every error is logged and the
    /// next tick re-reconciles whatever is left.
    pub(crate) async fn cleanup_instance(self: &Arc<Self>, instance_id: &str, service_id: &str) {
        if let Err(e) = self.provider.delete_service(service_id).await {
            warn!(service_id = %service_id, error = %e, "cleanup delete failed");
        }
        if let Err(e) = self.store.delete(instance_id) {
            warn!(instance = %instance_id, error = %e, "cleanup metadata delete failed");
        }
        self.cache.remove(instance_id);
        metrics::CLEANUPS_TOTAL.inc();
    }
}

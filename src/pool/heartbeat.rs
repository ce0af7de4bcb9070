//! Hibernation heartbeat
//!
//! Providers that hibernate idle instances need more than the 30s tick to
//! notice a gateway that died in its sleep. The heartbeat pings idle and
//! claimed instances on a short cadence, tracks consecutive failures per
//! instance, and either cleans up (idle) or attempts a wake (claimed) when
//! the failure threshold is hit. It never writes derived state; it only
//! triggers the same cleanup primitives the rest of the pool uses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::provision::{GATEWAY_COMMAND, GATEWAY_PROCESS};
use super::{Instance, PoolManager, PoolState};

/// Per-instance probe failure and recovery bookkeeping
#[derive(Default)]
struct Counters {
    fails: u32,
    recoveries: u32,
}

/// Background prober for hibernating providers
pub struct Heartbeat {
    manager: Arc<PoolManager>,
    counters: Mutex<HashMap<String, Counters>>,
}

impl Heartbeat {
    pub fn new(manager: Arc<PoolManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// Start the periodic heartbeat task
    pub fn spawn(heartbeat: Arc<Heartbeat>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(heartbeat.manager.config.heartbeat_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                heartbeat.beat().await;
            }
        })
    }

    /// Probe every idle and claimed instance once
    pub async fn beat(&self) {
        let in_progress = self.manager.claims.snapshot();
        let targets: Vec<Instance> = self
            .manager
            .instances()
            .into_iter()
            .filter(|i| matches!(i.state, PoolState::Idle | PoolState::Claimed))
            .filter(|i| !in_progress.contains(&i.service_id))
            .filter(|i| i.url.is_some())
            .collect();

        let probes = join_all(targets.iter().map(|instance| {
            let manager = Arc::clone(&self.manager);
            let url = instance.url.clone().unwrap_or_default();
            async move { manager.gateway.probe(&url).await.map(|p| p.ready) }
        }))
        .await;

        for (instance, probe) in targets.iter().zip(probes) {
            match probe {
                Ok(true) => self.mark_healthy(&instance.id),
                _ => self.handle_failure(instance).await,
            }
        }

        // Forget instances that left the cache
        let live: std::collections::HashSet<String> = self
            .manager
            .instances()
            .into_iter()
            .map(|i| i.id)
            .collect();
        self.counters
            .lock()
            .expect("heartbeat lock poisoned")
            .retain(|id, _| live.contains(id));
    }

    fn mark_healthy(&self, instance_id: &str) {
        let mut counters = self.counters.lock().expect("heartbeat lock poisoned");
        if let Some(c) = counters.get_mut(instance_id) {
            // Sustained success clears the whole history
            c.fails = 0;
            c.recoveries = 0;
        }
    }

    async fn handle_failure(&self, instance: &Instance) {
        let (fails, recoveries) = {
            let mut counters = self.counters.lock().expect("heartbeat lock poisoned");
            let c = counters.entry(instance.id.clone()).or_default();
            c.fails += 1;
            (c.fails, c.recoveries)
        };

        let threshold = self.manager.config.heartbeat_failure_threshold;
        if fails < threshold {
            debug!(instance = %instance.id, fails, "heartbeat probe failed");
            return;
        }

        match instance.state {
            PoolState::Idle => {
                warn!(instance = %instance.id, fails, "idle instance unresponsive, cleaning up");
                self.manager
                    .cleanup_instance(&instance.id, &instance.service_id)
                    .await;
                self.forget(&instance.id);
            }
            PoolState::Claimed => {
                if recoveries >= self.manager.config.heartbeat_recovery_cap {
                    warn!(
                        instance = %instance.id,
                        recoveries,
                        "claimed instance exhausted recovery attempts, cleaning up"
                    );
                    self.manager
                        .cleanup_instance(&instance.id, &instance.service_id)
                        .await;
                    self.forget(&instance.id);
                    return;
                }
                self.attempt_wake(instance).await;
            }
            _ => {}
        }
    }

    /// Try to restart the gateway inside a claimed instance
    async fn attempt_wake(&self, instance: &Instance) {
        info!(instance = %instance.id, "attempting gateway wake");
        let wake = format!(
            "pkill -f '{}' 2>/dev/null || true\nnohup {} >/dev/null 2>&1 &\n",
            GATEWAY_PROCESS, GATEWAY_COMMAND
        );
        match self.manager.provider.exec(&instance.service_id, &wake).await {
            Ok(result) if result.success() => {
                let mut counters = self.counters.lock().expect("heartbeat lock poisoned");
                if let Some(c) = counters.get_mut(&instance.id) {
                    c.recoveries += 1;
                    c.fails = 0;
                }
                info!(instance = %instance.id, "gateway wake issued");
            }
            Ok(result) => {
                warn!(
                    instance = %instance.id,
                    exit_code = result.exit_code,
                    "wake script failed, cleaning up"
                );
                self.manager
                    .cleanup_instance(&instance.id, &instance.service_id)
                    .await;
                self.forget(&instance.id);
            }
            Err(e) => {
                warn!(instance = %instance.id, error = %e, "wake exec failed, cleaning up");
                self.manager
                    .cleanup_instance(&instance.id, &instance.service_id)
                    .await;
                self.forget(&instance.id);
            }
        }
    }

    fn forget(&self, instance_id: &str) {
        self.counters
            .lock()
            .expect("heartbeat lock poisoned")
            .remove(instance_id);
    }
}

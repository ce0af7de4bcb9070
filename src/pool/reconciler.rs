//! Reconciler tick loop
//!
//! One tick rebuilds the cache from a single provider listing plus parallel
//! gateway probes, schedules deletes for dead strays, and replenishes the
//! pool toward the target idle count. The listing is a consistent snapshot
//! for the duration of the tick; nothing is re-queried mid-tick.
//!
//! A failed listing short-circuits the whole tick: destructive decisions are
//! never taken on a partial view.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::gateway::ProbeResult;
use crate::metrics;
use crate::provider::{DeployStatus, ServiceSummary};

use super::{Instance, PoolManager, PoolState};

/// Circuit breaker over instance creation
///
/// Creation is the one operation that can cascade: every failed create burns
/// provider quota and a couple of minutes of polling. After a run of
/// consecutive failures the breaker opens and replenishment stays suppressed
/// for a cool-down window. Any success closes it.
#[derive(Debug)]
pub struct CreateBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
}

impl CreateBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            open_until: None,
            threshold,
            cooldown,
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        match self.open_until {
            Some(until) => now < until,
            None => false,
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.open_until = Some(now + self.cooldown);
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }
}

impl PoolManager {
    /// Start the periodic reconciler task
    ///
    /// Ticks are scheduled next-after-finish: an overrunning tick delays the
    /// following one instead of overlapping it.
    pub fn spawn_reconciler(manager: Arc<PoolManager>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                manager.tick().await;
            }
        })
    }

    /// Run one reconciliation pass
    ///
    /// Also invoked directly by `POST /pool/reconcile`; the internal lock
    /// serializes forced ticks with scheduled ones.
    pub async fn tick(self: &Arc<Self>) {
        let _tick = self.tick_lock.lock().await;
        let started = Instant::now();

        let services = match self.provider.list_services().await {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "provider listing unavailable, skipping tick");
                return;
            }
        };

        let in_scope: Vec<ServiceSummary> = services
            .into_iter()
            .filter(|svc| self.in_scope(svc))
            .collect();

        let meta_index = match self.store.index_by_service() {
            Ok(index) => index,
            Err(e) => {
                // Without the metadata view, dead instances cannot be told
                // apart from silent-delete targets. Bail like a listing outage.
                warn!(error = %e, "metadata store unreadable, skipping tick");
                return;
            }
        };

        let probes = self
            .probe_ready_services(&in_scope, &self.claims.snapshot())
            .await;

        // Re-snapshot after the probes settle: a claim that started while
        // they were in flight must not have its entry overwritten below.
        let claimed_in_progress = self.claims.snapshot();
        let now = chrono::Utc::now();
        let mut scheduled_deletes: Vec<(String, String)> = Vec::new();

        for svc in &in_scope {
            if claimed_in_progress.contains(&svc.id) {
                continue;
            }
            let Some(instance_id) = self.instance_id_from_name(&svc.name) else {
                continue;
            };

            let age = (now - svc.created_at).to_std().unwrap_or_default();
            let (url, probe) = match probes.get(&svc.id) {
                Some((url, probe)) => (url.clone(), probe.as_ref()),
                None => (None, None),
            };
            let state = super::derive_state(
                svc.deploy_status.as_ref(),
                probe,
                age,
                self.config.stuck_timeout,
            );

            if matches!(state, PoolState::Dead | PoolState::Sleeping) {
                if let Some(meta) = meta_index.get(&svc.id) {
                    // A claim happened here at some point; surface it for an
                    // explicit dismiss instead of deleting under the user.
                    let mut entry = self.entry_for(svc, &instance_id, url, PoolState::Crashed);
                    entry.enrich_from(meta);
                    self.cache.insert(entry);
                } else {
                    self.cache.retain(|i| i.service_id != svc.id);
                    if age >= self.config.orphan_grace {
                        scheduled_deletes.push((svc.id.clone(), svc.name.clone()));
                    } else {
                        debug!(service = %svc.name, "dead orphan within grace period, not deleting yet");
                    }
                }
                continue;
            }

            let mut entry = self.entry_for(svc, &instance_id, url, state);
            if let Some(meta) = meta_index.get(&svc.id) {
                entry.enrich_from(meta);
            }
            self.cache.insert(entry);
        }

        // Drop entries whose service vanished from the listing, unless a
        // claim or provision currently owns them.
        let listed: std::collections::HashSet<&str> =
            in_scope.iter().map(|s| s.id.as_str()).collect();
        self.cache.retain(|i| {
            listed.contains(i.service_id.as_str()) || claimed_in_progress.contains(&i.service_id)
        });

        for (service_id, name) in scheduled_deletes {
            match self.provider.delete_service(&service_id).await {
                Ok(()) => {
                    info!(service = %name, "deleted dead stray service");
                    metrics::CLEANUPS_TOTAL.inc();
                }
                Err(e) => warn!(service = %name, error = %e, "failed to delete stray service"),
            }
        }

        self.replenish();

        let counts = self.cache.counts();
        metrics::set_pool_counts(&counts);
        metrics::TICK_DURATION.observe(started.elapsed().as_secs_f64());
        debug!(
            starting = counts.starting,
            idle = counts.idle,
            claimed = counts.claimed,
            crashed = counts.crashed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tick complete"
        );
    }

    /// Probe `/status` on every successfully deployed in-scope service
    ///
    /// Probes run in parallel and settle together; a failed probe yields
    /// None for that service and never disturbs the others.
    async fn probe_ready_services(
        self: &Arc<Self>,
        in_scope: &[ServiceSummary],
        skip: &std::collections::HashSet<String>,
    ) -> HashMap<String, (Option<String>, Option<ProbeResult>)> {
        let targets: Vec<&ServiceSummary> = in_scope
            .iter()
            .filter(|svc| svc.deploy_status == Some(DeployStatus::Success))
            .filter(|svc| !skip.contains(&svc.id))
            .collect();

        let futures = targets.iter().map(|svc| {
            let manager = Arc::clone(self);
            let service_id = svc.id.clone();
            async move {
                let url = match manager.resolve_url(&service_id).await {
                    Some(url) => url,
                    None => return (service_id, (None, None)),
                };
                let probe = match manager.gateway.probe(&url).await {
                    Ok(probe) => Some(probe),
                    Err(e) => {
                        debug!(service_id = %service_id, error = %e, "status probe failed");
                        None
                    }
                };
                (service_id, (Some(url), probe))
            }
        });

        join_all(futures).await.into_iter().collect()
    }

    /// Public base URL from the cache, falling back to a provider lookup
    async fn resolve_url(&self, service_id: &str) -> Option<String> {
        if let Some(url) = self
            .cache
            .get_by_service(service_id)
            .and_then(|i| i.url)
        {
            return Some(url);
        }
        match self.provider.service_url(service_id).await {
            Ok(url) => url,
            Err(e) => {
                debug!(service_id = %service_id, error = %e, "url lookup failed");
                None
            }
        }
    }

    /// Build a cache entry for a listed service, carrying forward fields the
    /// listing cannot know (checkpoint id, previously resolved URL).
    fn entry_for(
        &self,
        svc: &ServiceSummary,
        instance_id: &str,
        url: Option<String>,
        state: PoolState,
    ) -> Instance {
        let previous = self.cache.get_by_service(&svc.id);

        Instance {
            id: instance_id.to_string(),
            service_id: svc.id.clone(),
            name: svc.name.clone(),
            url: url.or_else(|| previous.as_ref().and_then(|p| p.url.clone())),
            state,
            deploy_status: svc.deploy_status.clone(),
            created_at: svc.created_at,
            agent_name: None,
            claimed_at: None,
            conversation_id: None,
            invite_url: None,
            instructions: None,
            checkpoint_id: previous.and_then(|p| p.checkpoint_id),
        }
    }

    /// Create instances until the idle target is met, within the total cap
    ///
    /// Side effects are spawned, never awaited: the tick stays fast and a
    /// slow provider cannot stall reconciliation.
    fn replenish(self: &Arc<Self>) {
        let counts = self.cache.counts();
        let warm = counts.idle + counts.starting;
        if warm >= self.config.min_idle {
            return;
        }

        if self
            .breaker
            .lock()
            .expect("breaker lock poisoned")
            .is_open(Instant::now())
        {
            debug!("creation circuit breaker open, skipping replenish");
            return;
        }

        let deficit = self.config.min_idle - warm;
        let capacity = self.config.max_total.saturating_sub(counts.total());
        let to_create = deficit.min(capacity);
        if to_create == 0 {
            return;
        }

        info!(deficit, to_create, "replenishing pool");
        for _ in 0..to_create {
            self.spawn_create();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_threshold() {
        let mut breaker = CreateBreaker::new(3, Duration::from_secs(300));
        let now = Instant::now();

        breaker.record_failure(now);
        breaker.record_failure(now);
        assert!(!breaker.is_open(now));

        breaker.record_failure(now);
        assert!(breaker.is_open(now));
    }

    #[test]
    fn test_breaker_closes_after_cooldown() {
        let mut breaker = CreateBreaker::new(1, Duration::from_secs(10));
        let now = Instant::now();

        breaker.record_failure(now);
        assert!(breaker.is_open(now));
        assert!(!breaker.is_open(now + Duration::from_secs(11)));
    }

    #[test]
    fn test_breaker_success_resets() {
        let mut breaker = CreateBreaker::new(2, Duration::from_secs(300));
        let now = Instant::now();

        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        assert!(!breaker.is_open(now), "streak must restart after a success");
    }
}

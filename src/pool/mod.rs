//! Pool state machine and coordination
//!
//! The pool is a set of remote instances kept consistent with a desired
//! shape. The in-memory cache is rebuilt from the provider and gateway every
//! tick and is the authoritative view consumed by the API and dashboard;
//! nothing in it survives a restart.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  PoolManager                                                 │
//! │                                                              │
//! │  reconciler tick ──► provider listing + gateway probes       │
//! │        │                      │                              │
//! │        ▼                      ▼                              │
//! │   PoolCache  ◄───── derived states (status deriver)          │
//! │        │                                                     │
//! │   claim() ──► idle instance ──► claimed (metadata written)   │
//! │        │                                                     │
//! │   recycle()/destroy() ──► back to idle / gone, backfill      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod claim;
pub mod heartbeat;
pub mod lifecycle;
pub mod provision;
pub mod reconciler;
pub mod status;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::provider::{DeployStatus, Provider, ServiceSummary};
use crate::store::{MetadataRecord, MetadataStore};

pub use claim::{ClaimError, ClaimOutcome, ClaimRequest};
pub use heartbeat::Heartbeat;
pub use lifecycle::LifecycleError;
pub use provision::ProvisionError;
pub use reconciler::CreateBreaker;
pub use status::derive_state;

/// Derived state of one pool instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Provisioning or deploying; not yet reachable
    Starting,
    /// Warm and ready for claim
    Idle,
    /// Bound to a conversation
    Claimed,
    /// Hibernated by the provider
    Sleeping,
    /// Terminal deploy state or unreachable past the stuck timeout
    Dead,
    /// Dead or sleeping while claim metadata still exists; user-dismissible
    Crashed,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolState::Starting => "starting",
            PoolState::Idle => "idle",
            PoolState::Claimed => "claimed",
            PoolState::Sleeping => "sleeping",
            PoolState::Dead => "dead",
            PoolState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// One cache entry, the per-instance record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Stable instance id, a 12-char token embedded in the service name
    pub id: String,
    /// Provider service id backing this instance
    pub service_id: String,
    /// Provider-facing service name
    pub name: String,
    /// Public base URL, once a domain exists
    pub url: Option<String>,
    pub state: PoolState,
    /// Latest provider deploy status snapshot
    pub deploy_status: Option<DeployStatus>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl Instance {
    /// Fresh entry for a service that just started provisioning
    pub fn starting(id: String, service_id: String, name: String) -> Self {
        Self {
            id,
            service_id,
            name,
            url: None,
            state: PoolState::Starting,
            deploy_status: None,
            created_at: Utc::now(),
            agent_name: None,
            claimed_at: None,
            conversation_id: None,
            invite_url: None,
            instructions: None,
            checkpoint_id: None,
        }
    }

    /// Copy display fields from a metadata record onto this entry
    pub fn enrich_from(&mut self, meta: &MetadataRecord) {
        self.agent_name = Some(meta.agent_name.clone());
        self.claimed_at = Some(meta.claimed_at);
        self.conversation_id = meta.conversation_id.clone();
        self.invite_url = meta.invite_url.clone();
        self.instructions = Some(meta.instructions.clone());
        if meta.checkpoint_id.is_some() {
            self.checkpoint_id = meta.checkpoint_id.clone();
        }
    }
}

/// Aggregate counts over the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub starting: usize,
    pub idle: usize,
    pub claimed: usize,
    pub crashed: usize,
}

impl PoolCounts {
    /// Instances that count against the MAX_TOTAL cap
    pub fn total(&self) -> usize {
        self.starting + self.idle + self.claimed
    }
}

/// Thread-safe cache of instances keyed by instance id
///
/// The lock is never held across an await point; every method returns owned
/// data.
#[derive(Default)]
pub struct PoolCache {
    entries: RwLock<HashMap<String, Instance>>,
}

impl PoolCache {
    pub fn insert(&self, instance: Instance) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(instance.id.clone(), instance);
    }

    pub fn remove(&self, instance_id: &str) -> Option<Instance> {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .remove(instance_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<Instance> {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .get(instance_id)
            .cloned()
    }

    pub fn get_by_service(&self, service_id: &str) -> Option<Instance> {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .values()
            .find(|i| i.service_id == service_id)
            .cloned()
    }

    /// Apply a mutation to an entry if it exists; returns whether it did
    pub fn update<F: FnOnce(&mut Instance)>(&self, instance_id: &str, f: F) -> bool {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        match entries.get_mut(instance_id) {
            Some(instance) => {
                f(instance);
                true
            }
            None => false,
        }
    }

    /// Owned copy of every entry
    pub fn snapshot(&self) -> Vec<Instance> {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Remove entries whose service id satisfies the predicate
    pub fn retain<F: FnMut(&Instance) -> bool>(&self, mut keep: F) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .retain(|_, v| keep(v));
    }

    pub fn counts(&self) -> PoolCounts {
        let entries = self.entries.read().expect("cache lock poisoned");
        let mut counts = PoolCounts::default();
        for instance in entries.values() {
            match instance.state {
                PoolState::Starting => counts.starting += 1,
                PoolState::Idle => counts.idle += 1,
                PoolState::Claimed => counts.claimed += 1,
                PoolState::Crashed => counts.crashed += 1,
                PoolState::Sleeping | PoolState::Dead => {}
            }
        }
        counts
    }
}

/// In-memory set of service ids currently being mutated
///
/// An id is inserted synchronously before any awaiting I/O, and the RAII
/// [`ClaimGuard`] removes it on every exit path. While an id is present no
/// other caller may claim it and the reconciler leaves its cache entry alone.
#[derive(Default, Clone)]
pub struct ClaimSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ClaimSet {
    pub fn contains(&self, service_id: &str) -> bool {
        self.inner
            .lock()
            .expect("claim set lock poisoned")
            .contains(service_id)
    }

    /// Owned copy for use across a whole tick
    pub fn snapshot(&self) -> HashSet<String> {
        self.inner.lock().expect("claim set lock poisoned").clone()
    }

    /// Insert an id, returning a guard that removes it on drop.
    /// Returns None if the id is already being mutated.
    pub fn try_insert(&self, service_id: &str) -> Option<ClaimGuard> {
        let mut set = self.inner.lock().expect("claim set lock poisoned");
        if !set.insert(service_id.to_string()) {
            return None;
        }
        Some(ClaimGuard {
            set: Arc::clone(&self.inner),
            service_id: service_id.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("claim set lock poisoned").is_empty()
    }
}

/// Removes its service id from the claim set when dropped
pub struct ClaimGuard {
    set: Arc<Mutex<HashSet<String>>>,
    service_id: String,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("claim set lock poisoned")
            .remove(&self.service_id);
    }
}

/// Orchestrates the pool: owns the cache, the claim set, and the clients
pub struct PoolManager {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) store: MetadataStore,
    pub(crate) cache: PoolCache,
    pub(crate) claims: ClaimSet,
    pub(crate) config: Config,
    pub(crate) breaker: Mutex<CreateBreaker>,
    /// Serializes forced ticks with scheduled ones
    pub(crate) tick_lock: tokio::sync::Mutex<()>,
}

impl PoolManager {
    pub fn new(
        provider: Arc<dyn Provider>,
        gateway: Arc<dyn Gateway>,
        store: MetadataStore,
        config: Config,
    ) -> Arc<Self> {
        let breaker = CreateBreaker::new(config.create_failure_threshold, config.create_cooldown);
        Arc::new(Self {
            provider,
            gateway,
            store,
            cache: PoolCache::default(),
            claims: ClaimSet::default(),
            config,
            breaker: Mutex::new(breaker),
            tick_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counts(&self) -> PoolCounts {
        self.cache.counts()
    }

    /// Whether no claim or mutation is currently in flight
    pub fn claims_quiescent(&self) -> bool {
        self.claims.is_empty()
    }

    /// Owned copy of the whole cache, for the API and dashboard
    pub fn instances(&self) -> Vec<Instance> {
        let mut instances = self.cache.snapshot();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        instances
    }

    /// Claimed entries with display fields, for the dashboard agent list
    pub fn claimed_agents(&self) -> Vec<Instance> {
        self.instances()
            .into_iter()
            .filter(|i| i.state == PoolState::Claimed)
            .collect()
    }

    /// Whether a provider service belongs to this pool
    pub(crate) fn in_scope(&self, svc: &ServiceSummary) -> bool {
        if !svc.name.starts_with(&self.managed_prefix()) {
            return false;
        }
        if self.config.self_service_id.as_deref() == Some(svc.id.as_str()) {
            return false;
        }
        svc.environment_ids.is_empty()
            || svc
                .environment_ids
                .iter()
                .any(|e| e == &self.config.environment)
    }

    /// Name prefix of services this pool owns, environment included
    pub(crate) fn managed_prefix(&self) -> String {
        format!("{}{}-", self.config.pool_prefix, self.config.environment)
    }

    /// Recover an instance id from a managed service name
    pub(crate) fn instance_id_from_name(&self, name: &str) -> Option<String> {
        name.strip_prefix(&self.managed_prefix())
            .map(|rest| rest.split(' ').next().unwrap_or(rest).to_string())
            .filter(|id| !id.is_empty())
    }
}

/// Generate a fresh 12-char lowercase alphanumeric instance id
pub(crate) fn generate_instance_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_instance_id_shape() {
        let id = generate_instance_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_claim_set_guard_releases_on_drop() {
        let set = ClaimSet::default();
        {
            let _guard = set.try_insert("svc-A").unwrap();
            assert!(set.contains("svc-A"));
            assert!(set.try_insert("svc-A").is_none());
        }
        assert!(!set.contains("svc-A"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_counts_ignore_dead_and_sleeping() {
        let cache = PoolCache::default();
        let mut a = Instance::starting("a".into(), "svc-a".into(), "n-a".into());
        a.state = PoolState::Idle;
        let mut b = Instance::starting("b".into(), "svc-b".into(), "n-b".into());
        b.state = PoolState::Dead;
        cache.insert(a);
        cache.insert(b);

        let counts = cache.counts();
        assert_eq!(counts.idle, 1);
        assert_eq!(counts.total(), 1);
    }
}

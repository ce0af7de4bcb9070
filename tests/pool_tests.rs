//! End-to-end tests for the pool control loop
//!
//! These drive the real reconciler, claim coordinator, and lifecycle paths
//! against programmable in-memory provider and gateway fakes. No network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use convopool::gateway::{
    Conversation, ConversationGrant, Gateway, GatewayError, JoinRequest, NewConversation,
    ProbeResult,
};
use convopool::pool::{ClaimError, ClaimRequest, Heartbeat, PoolManager, PoolState};
use convopool::provider::{
    DeployStatus, ExecResult, Provider, ProviderError, ServiceSummary,
};
use convopool::{Config, MetadataStore};

// ---------------------------------------------------------------------------
// Fakes

#[derive(Clone)]
struct FakeService {
    name: String,
    created_at: DateTime<Utc>,
    environment_ids: Vec<String>,
    deploy_status: Option<DeployStatus>,
    domain: String,
}

struct FakeProvider {
    environment: String,
    services: Mutex<HashMap<String, FakeService>>,
    next_id: AtomicU64,
    listing_available: AtomicBool,
    fail_creates: AtomicBool,
    create_calls: AtomicU64,
    deleted: Mutex<Vec<String>>,
    execs: Mutex<Vec<(String, String)>>,
    restores: Mutex<Vec<(String, String)>>,
    checkpoints: AtomicU64,
    checkpoints_supported: bool,
    gateway: Arc<FakeGateway>,
}

impl FakeProvider {
    fn new(environment: &str, gateway: Arc<FakeGateway>) -> Arc<Self> {
        Arc::new(Self {
            environment: environment.to_string(),
            services: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            listing_available: AtomicBool::new(true),
            fail_creates: AtomicBool::new(false),
            create_calls: AtomicU64::new(0),
            deleted: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
            checkpoints: AtomicU64::new(0),
            checkpoints_supported: true,
            gateway,
        })
    }

    fn set_listing_available(&self, available: bool) {
        self.listing_available.store(available, Ordering::SeqCst);
    }

    fn set_deploy_status(&self, service_id: &str, status: DeployStatus) {
        let mut services = self.services.lock().unwrap();
        if let Some(svc) = services.get_mut(service_id) {
            svc.deploy_status = Some(status);
        }
    }

    /// Inject a service as if some earlier process created it
    fn inject_service(
        &self,
        id: &str,
        name: &str,
        status: Option<DeployStatus>,
        created_at: DateTime<Utc>,
    ) {
        self.services.lock().unwrap().insert(
            id.to_string(),
            FakeService {
                name: name.to_string(),
                created_at,
                environment_ids: vec![self.environment.clone()],
                deploy_status: status,
                domain: format!("https://{}.gw.test", id),
            },
        );
    }

    fn service_count(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn exec_scripts_for(&self, service_id: &str) -> Vec<String> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == service_id)
            .map(|(_, script)| script.clone())
            .collect()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn create_service(
        &self,
        name: &str,
        _env: &HashMap<String, String>,
    ) -> Result<String, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("create refused".to_string()));
        }
        let id = format!("svc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.inject_service(&id, name, None, Utc::now());
        Ok(id)
    }

    async fn deploy(&self, service_id: &str) -> Result<(), ProviderError> {
        self.set_deploy_status(service_id, DeployStatus::Success);
        Ok(())
    }

    async fn cancel_deployments(&self, _service_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn create_domain(&self, service_id: &str) -> Result<String, ProviderError> {
        self.services
            .lock()
            .unwrap()
            .get(service_id)
            .map(|svc| svc.domain.clone())
            .ok_or(ProviderError::NotFound)
    }

    async fn service_url(&self, service_id: &str) -> Result<Option<String>, ProviderError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(service_id)
            .map(|svc| svc.domain.clone()))
    }

    async fn list_services(&self) -> Result<Vec<ServiceSummary>, ProviderError> {
        if !self.listing_available.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("listing unavailable".to_string()));
        }
        Ok(self
            .services
            .lock()
            .unwrap()
            .iter()
            .map(|(id, svc)| ServiceSummary {
                id: id.clone(),
                name: svc.name.clone(),
                created_at: svc.created_at,
                environment_ids: svc.environment_ids.clone(),
                deploy_status: svc.deploy_status.clone(),
            })
            .collect())
    }

    async fn delete_service(&self, service_id: &str) -> Result<(), ProviderError> {
        self.services.lock().unwrap().remove(service_id);
        self.deleted.lock().unwrap().push(service_id.to_string());
        Ok(())
    }

    async fn rename_service(&self, service_id: &str, name: &str) -> Result<(), ProviderError> {
        let mut services = self.services.lock().unwrap();
        match services.get_mut(service_id) {
            Some(svc) => {
                svc.name = name.to_string();
                Ok(())
            }
            None => Err(ProviderError::NotFound),
        }
    }

    async fn exec(&self, service_id: &str, script: &str) -> Result<ExecResult, ProviderError> {
        self.execs
            .lock()
            .unwrap()
            .push((service_id.to_string(), script.to_string()));
        Ok(ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn start_detached(
        &self,
        _service_id: &str,
        _name: &str,
        _command: &str,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    fn supports_checkpoints(&self) -> bool {
        self.checkpoints_supported
    }

    async fn create_checkpoint(
        &self,
        _service_id: &str,
        _label: &str,
    ) -> Result<String, ProviderError> {
        let n = self.checkpoints.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("cp-{}", n))
    }

    async fn restore_checkpoint(
        &self,
        service_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), ProviderError> {
        self.restores
            .lock()
            .unwrap()
            .push((service_id.to_string(), checkpoint_id.to_string()));
        // Restoring resets the filesystem and kills the gateway; the fake
        // gateway comes back up unbound, like the real one after restart.
        if let Some(domain) = self
            .services
            .lock()
            .unwrap()
            .get(service_id)
            .map(|s| s.domain.clone())
        {
            self.gateway.reset(&domain);
        }
        Ok(())
    }
}

#[derive(Default)]
struct GatewayEndpoint {
    ready: bool,
    down: bool,
    conversation: Option<String>,
}

struct FakeGateway {
    endpoints: Mutex<HashMap<String, GatewayEndpoint>>,
    next_conversation: AtomicU64,
    fail_binds: AtomicBool,
}

impl FakeGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            next_conversation: AtomicU64::new(1),
            fail_binds: AtomicBool::new(false),
        })
    }

    fn set_down(&self, url: &str, down: bool) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let endpoint = endpoints.entry(url.to_string()).or_insert(GatewayEndpoint {
            ready: true,
            ..Default::default()
        });
        endpoint.down = down;
    }

    fn reset(&self, url: &str) {
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints.insert(
            url.to_string(),
            GatewayEndpoint {
                ready: true,
                down: false,
                conversation: None,
            },
        );
    }

    fn conversation_for(&self, url: &str) -> Option<String> {
        self.endpoints
            .lock()
            .unwrap()
            .get(url)
            .and_then(|e| e.conversation.clone())
    }

    fn bind(&self, url: &str) -> Result<String, GatewayError> {
        if self.fail_binds.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("bind refused".to_string()));
        }
        let mut endpoints = self.endpoints.lock().unwrap();
        let endpoint = endpoints.entry(url.to_string()).or_insert(GatewayEndpoint {
            ready: true,
            ..Default::default()
        });
        if endpoint.conversation.is_some() {
            return Err(GatewayError::Conflict);
        }
        let id = format!(
            "conv-{}",
            self.next_conversation.fetch_add(1, Ordering::SeqCst)
        );
        endpoint.conversation = Some(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn probe(&self, base_url: &str) -> Result<ProbeResult, GatewayError> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let endpoint = endpoints
            .entry(base_url.to_string())
            .or_insert(GatewayEndpoint {
                ready: true,
                ..Default::default()
            });
        if endpoint.down {
            return Err(GatewayError::Unavailable("connection refused".to_string()));
        }
        Ok(ProbeResult {
            ready: endpoint.ready,
            conversation: endpoint
                .conversation
                .clone()
                .map(|id| Conversation { id }),
            streaming: None,
        })
    }

    async fn create_conversation(
        &self,
        base_url: &str,
        _request: &NewConversation,
    ) -> Result<ConversationGrant, GatewayError> {
        let id = self.bind(base_url)?;
        Ok(ConversationGrant {
            conversation_id: Some(id.clone()),
            invite_url: Some(format!("https://convos.test/i={}", id)),
            status: None,
        })
    }

    async fn join(
        &self,
        base_url: &str,
        request: &JoinRequest,
    ) -> Result<ConversationGrant, GatewayError> {
        let id = self.bind(base_url)?;
        Ok(ConversationGrant {
            conversation_id: Some(id),
            invite_url: Some(request.invite_url.clone()),
            status: Some("joined".to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    manager: Arc<PoolManager>,
    provider: Arc<FakeProvider>,
    gateway: Arc<FakeGateway>,
    config: Config,
    _dir: tempfile::TempDir,
}

fn harness(min_idle: usize, max_total: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        environment: "test".to_string(),
        data_dir: dir.path().join("meta"),
        min_idle,
        max_total,
        ready_poll_interval: Duration::from_millis(5),
        create_timeout: Duration::from_secs(2),
        recycle_ready_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let gateway = FakeGateway::new();
    let provider = FakeProvider::new("test", gateway.clone());
    let store = MetadataStore::new(&config.data_dir).unwrap();
    let manager = PoolManager::new(provider.clone(), gateway.clone(), store, config.clone());
    Harness {
        manager,
        provider,
        gateway,
        config,
        _dir: dir,
    }
}

impl Harness {
    /// Open a second handle onto the same metadata directory
    fn store(&self) -> MetadataStore {
        MetadataStore::new(&self.config.data_dir).unwrap()
    }

    /// Tick, wait for spawned creations to settle, tick again to re-derive
    async fn warm(&self) {
        self.manager.tick().await;
        assert!(
            wait_until(|| self.manager.claims_quiescent() && self.provider.service_count() > 0)
                .await,
            "provisioning never settled"
        );
        self.manager.tick().await;
    }

    fn single_idle_instance(&self) -> convopool::Instance {
        let instances = self.manager.instances();
        instances
            .into_iter()
            .find(|i| i.state == PoolState::Idle)
            .expect("no idle instance")
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn claim_request(agent: &str) -> ClaimRequest {
    ClaimRequest {
        agent_name: agent.to_string(),
        instructions: "plan trips".to_string(),
        join_url: None,
    }
}

// ---------------------------------------------------------------------------
// Scenarios

/// Cold start: empty provider, MIN_IDLE=1 creates one instance which becomes
/// idle on the following tick.
#[tokio::test]
async fn test_cold_start_reaches_idle() {
    let h = harness(1, 3);

    h.manager.tick().await;
    assert!(
        wait_until(|| h.provider.service_count() == 1 && h.manager.claims_quiescent()).await,
        "creation never completed"
    );

    // Provisioned but not yet re-derived
    let counts = h.manager.counts();
    assert_eq!(counts.starting, 1);
    assert_eq!(counts.idle, 0);

    h.manager.tick().await;
    let counts = h.manager.counts();
    assert_eq!(counts.starting, 0);
    assert_eq!(counts.idle, 1);
    assert_eq!(counts.claimed, 0);
    assert_eq!(counts.crashed, 0);

    let instance = h.single_idle_instance();
    assert!(instance.url.is_some(), "idle instance must have a url");
    assert!(
        instance.checkpoint_id.is_some(),
        "golden checkpoint must be recorded"
    );
}

/// Claim happy path: instructions written, conversation created, metadata
/// persisted, cache flipped to claimed, backfill kicked off.
#[tokio::test]
async fn test_claim_happy_path() {
    let h = harness(1, 3);
    h.warm().await;
    let idle = h.single_idle_instance();

    let outcome = h.manager.claim(claim_request("tokyo")).await.unwrap();
    assert_eq!(outcome.instance_id, idle.id);
    assert_eq!(outcome.conversation_id.as_deref(), Some("conv-1"));
    assert!(outcome.invite_url.is_some());
    assert!(!outcome.joined);

    // Instructions landed before the conversation was created
    let scripts = h.provider.exec_scripts_for(&idle.service_id);
    assert!(
        scripts.iter().any(|s| s.contains("plan trips")),
        "instructions never written"
    );

    // Metadata row is durable and matches the grant
    let record = h.store().load(&idle.id).unwrap().expect("no metadata row");
    assert_eq!(record.agent_name, "tokyo");
    assert_eq!(record.conversation_id.as_deref(), Some("conv-1"));
    assert_eq!(record.service_id, idle.service_id);

    // Cache flipped without waiting for a tick
    let entry = h
        .manager
        .instances()
        .into_iter()
        .find(|i| i.id == idle.id)
        .unwrap();
    assert_eq!(entry.state, PoolState::Claimed);
    assert_eq!(entry.agent_name.as_deref(), Some("tokyo"));

    // Backfill replaces the consumed instance
    assert!(
        wait_until(|| h.provider.service_count() == 2).await,
        "backfill never created a replacement"
    );
    assert!(wait_until(|| h.manager.claims_quiescent()).await);
}

/// Two concurrent claims over a single idle instance: exactly one wins, the
/// loser sees 503-style NoIdleAvailable.
#[tokio::test]
async fn test_double_claim_race() {
    let h = harness(1, 1);
    h.warm().await;

    let (first, second) = tokio::join!(
        h.manager.claim(claim_request("alpha")),
        h.manager.claim(claim_request("beta")),
    );

    let winners = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one claim must win");
    let loser = if first.is_ok() { second } else { first };
    assert!(matches!(loser, Err(ClaimError::NoIdleAvailable)));

    // Pool is drained; a further claim also gets NoIdleAvailable
    let third = h.manager.claim(claim_request("gamma")).await;
    assert!(matches!(third, Err(ClaimError::NoIdleAvailable)));
    assert!(wait_until(|| h.manager.claims_quiescent()).await);
}

/// A claimed instance whose deploy goes FAILED is rewritten to crashed, kept
/// for the dashboard, and fully removed on dismiss.
#[tokio::test]
async fn test_crashed_while_claimed_then_dismiss() {
    let h = harness(1, 1);
    h.warm().await;
    let idle = h.single_idle_instance();

    h.manager.claim(claim_request("tokyo")).await.unwrap();
    h.provider
        .set_deploy_status(&idle.service_id, DeployStatus::Failed);

    h.manager.tick().await;
    let counts = h.manager.counts();
    assert_eq!(counts.crashed, 1);
    assert_eq!(counts.claimed, 0);

    let crashed = h
        .manager
        .instances()
        .into_iter()
        .find(|i| i.id == idle.id)
        .unwrap();
    assert_eq!(crashed.state, PoolState::Crashed);
    // Display fields survive via the metadata row
    assert_eq!(crashed.agent_name.as_deref(), Some("tokyo"));

    h.manager.dismiss_crashed(&idle.id).await.unwrap();
    assert!(h.provider.deleted_ids().contains(&idle.service_id));
    assert!(h.store().load(&idle.id).unwrap().is_none());

    h.manager.tick().await;
    assert!(h
        .manager
        .instances()
        .iter()
        .all(|i| i.id != idle.id));
}

/// The crashed rewrite never fires for a dead service without metadata; it
/// is silently deleted instead once past the orphan grace.
#[tokio::test]
async fn test_dead_stray_without_metadata_is_deleted() {
    let h = harness(0, 3);
    h.provider.inject_service(
        "svc-stray",
        "convos-agent-test-deadbeef0000",
        Some(DeployStatus::Failed),
        Utc::now() - chrono::Duration::hours(1),
    );

    h.manager.tick().await;

    assert!(h.provider.deleted_ids().contains(&"svc-stray".to_string()));
    assert_eq!(h.manager.counts().crashed, 0);
    assert!(h.manager.instances().is_empty());
}

/// A dead metadata-less orphan younger than the grace period is left on the
/// provider for a later tick.
#[tokio::test]
async fn test_young_orphan_survives_grace_period() {
    let h = harness(0, 3);
    h.provider.inject_service(
        "svc-young",
        "convos-agent-test-aaaabbbbcccc",
        Some(DeployStatus::Failed),
        Utc::now(),
    );

    h.manager.tick().await;

    assert!(h.provider.deleted_ids().is_empty());
    assert_eq!(h.provider.service_count(), 1);
    // Still out of the cache either way
    assert!(h.manager.instances().is_empty());
}

/// Listing outage: the tick takes no destructive action and creates nothing.
#[tokio::test]
async fn test_listing_outage_short_circuits_tick() {
    let h = harness(1, 3);
    h.warm().await;
    let idle = h.single_idle_instance();
    let services_before = h.provider.service_count();

    h.provider.set_listing_available(false);
    // Even a service gone terminal must not be touched during the outage
    h.provider
        .set_deploy_status(&idle.service_id, DeployStatus::Failed);

    h.manager.tick().await;

    assert!(h.provider.deleted_ids().is_empty());
    assert_eq!(h.provider.service_count(), services_before);
    let entry = h
        .manager
        .instances()
        .into_iter()
        .find(|i| i.id == idle.id)
        .unwrap();
    assert_eq!(entry.state, PoolState::Idle, "cache must be untouched");

    // Recovery: the next tick reconciles normally and drops the dead,
    // metadata-less entry from the cache (the provider delete waits out the
    // orphan grace period)
    h.provider.set_listing_available(true);
    h.manager.tick().await;
    assert!(h.manager.instances().iter().all(|i| i.id != idle.id));
    assert!(wait_until(|| h.manager.claims_quiescent()).await);
}

/// Recycle restores the golden checkpoint, clears metadata, and the same
/// provider service takes a fresh claim.
#[tokio::test]
async fn test_recycle_then_claim_same_service() {
    let h = harness(1, 1);
    h.warm().await;
    let idle = h.single_idle_instance();
    let checkpoint = idle.checkpoint_id.clone().unwrap();

    h.manager.claim(claim_request("tokyo")).await.unwrap();
    let recycled = h.manager.recycle_or_destroy(&idle.id).await.unwrap();
    assert!(recycled, "checkpoint was recorded, recycle must run");

    let restores = h.provider.restores.lock().unwrap().clone();
    assert_eq!(restores, vec![(idle.service_id.clone(), checkpoint)]);
    assert!(h.store().load(&idle.id).unwrap().is_none());

    let entry = h
        .manager
        .instances()
        .into_iter()
        .find(|i| i.id == idle.id)
        .unwrap();
    assert_eq!(entry.state, PoolState::Idle);
    assert!(entry.agent_name.is_none());

    // Exactly one metadata row ever exists per claim cycle
    let outcome = h.manager.claim(claim_request("osaka")).await.unwrap();
    assert_eq!(outcome.instance_id, idle.id);
    assert_eq!(h.store().load_all().unwrap().len(), 1);
    assert_eq!(
        h.gateway.conversation_for(idle.url.as_deref().unwrap()),
        outcome.conversation_id
    );
}

/// With MIN_IDLE=0 the reconciler never creates spontaneously.
#[tokio::test]
async fn test_min_idle_zero_creates_nothing() {
    let h = harness(0, 5);
    h.manager.tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.provider.service_count(), 0);
    assert_eq!(h.provider.create_calls.load(Ordering::SeqCst), 0);
}

/// MAX_TOTAL caps creation below the idle target.
#[tokio::test]
async fn test_max_total_caps_creation() {
    let h = harness(5, 2);

    h.manager.tick().await;
    assert!(wait_until(|| h.manager.claims_quiescent() && h.provider.service_count() == 2).await);

    h.manager.tick().await;
    assert!(wait_until(|| h.manager.claims_quiescent()).await);

    assert_eq!(h.provider.service_count(), 2);
    assert_eq!(h.provider.create_calls.load(Ordering::SeqCst), 2);
    let counts = h.manager.counts();
    assert!(counts.total() <= 2, "total {} exceeds cap", counts.total());
}

/// A gateway failure before metadata leaves the instance idle and claimable.
#[tokio::test]
async fn test_failed_bind_leaves_instance_idle() {
    let h = harness(1, 1);
    h.warm().await;
    let idle = h.single_idle_instance();

    h.gateway.fail_binds.store(true, Ordering::SeqCst);
    let result = h.manager.claim(claim_request("tokyo")).await;
    assert!(matches!(result, Err(ClaimError::Gateway(_))));
    assert!(h.manager.claims_quiescent(), "guard must release on failure");
    assert!(h.store().load(&idle.id).unwrap().is_none());

    h.manager.tick().await;
    let entry = h
        .manager
        .instances()
        .into_iter()
        .find(|i| i.id == idle.id)
        .unwrap();
    assert_eq!(entry.state, PoolState::Idle);

    h.gateway.fail_binds.store(false, Ordering::SeqCst);
    assert!(h.manager.claim(claim_request("tokyo")).await.is_ok());
}

/// An instance already bound on the gateway side aborts the claim with a
/// conflict and writes no metadata.
#[tokio::test]
async fn test_conflict_aborts_claim() {
    let h = harness(1, 1);
    h.warm().await;
    let idle = h.single_idle_instance();

    // Bind behind the pool's back
    h.gateway.bind(idle.url.as_deref().unwrap()).unwrap();

    let result = h.manager.claim(claim_request("tokyo")).await;
    assert!(matches!(result, Err(ClaimError::AlreadyBound)));
    assert!(h.store().load(&idle.id).unwrap().is_none());
    assert!(h.manager.claims_quiescent());
}

/// Drain destroys idle instances and does not backfill them.
#[tokio::test]
async fn test_drain_removes_idle_without_backfill() {
    let h = harness(2, 4);
    h.manager.tick().await;
    assert!(wait_until(|| h.manager.claims_quiescent() && h.provider.service_count() == 2).await);
    h.manager.tick().await;
    assert_eq!(h.manager.counts().idle, 2);

    let drained = h.manager.drain(2).await;
    assert_eq!(drained, 2);
    assert_eq!(h.manager.counts().idle, 0);

    // No spontaneous re-creation until the next tick replenishes
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.provider.service_count(), 0);
}

/// Replenish after the breaker opens stays suppressed until the cooldown.
#[tokio::test]
async fn test_create_breaker_suppresses_replenish() {
    let h = harness(1, 3);
    h.provider.fail_creates.store(true, Ordering::SeqCst);

    for n in 1..=3u64 {
        h.manager.tick().await;
        assert!(
            wait_until(|| h.provider.create_calls.load(Ordering::SeqCst) >= n).await,
            "creation attempt {} never ran",
            n
        );
    }
    let failures_at_open = h.provider.create_calls.load(Ordering::SeqCst);
    assert_eq!(failures_at_open, 3);

    // Breaker is open now; further ticks stop attempting creation
    h.manager.tick().await;
    assert!(wait_until(|| h.manager.claims_quiescent()).await);
    assert_eq!(
        h.provider.create_calls.load(Ordering::SeqCst),
        failures_at_open,
        "breaker must suppress creation during cooldown"
    );
}

/// Heartbeat cleans up an idle instance after repeated probe failures.
#[tokio::test]
async fn test_heartbeat_cleans_up_unresponsive_idle() {
    let h = harness(1, 1);
    h.warm().await;
    let idle = h.single_idle_instance();

    h.gateway.set_down(idle.url.as_deref().unwrap(), true);
    let heartbeat = Heartbeat::new(h.manager.clone());
    for _ in 0..3 {
        heartbeat.beat().await;
    }

    assert!(h.provider.deleted_ids().contains(&idle.service_id));
    assert!(h.manager.instances().iter().all(|i| i.id != idle.id));
}

/// Heartbeat tries to wake a claimed instance before giving up on it.
#[tokio::test]
async fn test_heartbeat_wakes_claimed_instance() {
    let h = harness(1, 1);
    h.warm().await;
    let idle = h.single_idle_instance();
    h.manager.claim(claim_request("tokyo")).await.unwrap();

    h.gateway.set_down(idle.url.as_deref().unwrap(), true);
    let heartbeat = Heartbeat::new(h.manager.clone());
    for _ in 0..3 {
        heartbeat.beat().await;
    }

    // Wake was attempted via exec, not cleanup
    let scripts = h.provider.exec_scripts_for(&idle.service_id);
    assert!(
        scripts.iter().any(|s| s.contains("convos-gateway")),
        "wake script never ran"
    );
    assert!(
        !h.provider.deleted_ids().contains(&idle.service_id),
        "claimed instance must not be cleaned up on the first recovery"
    );
}

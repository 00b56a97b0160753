//! Scenario harness: real orchestrator, mock edges.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use garm_events::{
    spawn_invalidator, Cache, ChangeEvent, ControllerContext, ControllerUrls, EventBus,
    EventFilter, EventPayload, Operation,
};
use garm_pool::{
    start_pool_manager, CreateBackoff, PoolManagerConfig, PoolManagerHandle, PoolManagerParams,
};
use garm_provider::{Dispatcher, Provider};
use garm_reconcile::{ReconcilerConfig, ReconcilerParams};
use garm_scaleset::{
    start_scale_set_coordinator, ScaleSetApi, ScaleSetCoordinatorConfig,
    ScaleSetCoordinatorHandle, ScaleSetCoordinatorParams,
};
use garm_schemas::{
    AuthKind, EntityKind, ForgeCredentials, ForgeEndpoint, ForgeEntity, ForgeKind, OsArch, OsType,
    PatCredentials, Pool, PoolBalancerType, PoolManagerStatus, RunnerStatus, ScaleSet,
    WorkflowJob, WorkflowJobAction, WorkflowJobEvent,
};
use garm_store::{MemoryStore, Store};
use uuid::Uuid;

use crate::mock_forge::{ForgeState, MockForgeFactory};
use crate::mock_provider::MockProvider;

pub const TEST_PAT: &str = "ghp_test_token_1";

/// Everything a scenario needs, wired the way the daemon wires it.
pub struct TestBed {
    pub store: Arc<MemoryStore>,
    pub bus: EventBus,
    pub cache: Arc<Cache>,
    pub ctx: Arc<ControllerContext>,
    pub provider: Arc<MockProvider>,
    pub dispatcher: Arc<Dispatcher>,
    pub forge_state: Arc<Mutex<ForgeState>>,
    pub forge_factory: Arc<MockForgeFactory>,
}

impl TestBed {
    /// Must be called from within a tokio runtime (the cache invalidator is
    /// spawned immediately).
    pub fn new() -> Self {
        Self::with_job_age_backoff(Duration::ZERO)
    }

    pub fn with_job_age_backoff(backoff: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::default();
        let cache = Cache::new(Arc::clone(&store) as Arc<dyn Store>);
        spawn_invalidator(Arc::clone(&cache), bus.subscribe(EventFilter::any()));

        let ctx = Arc::new(ControllerContext::new(
            store.controller_id(),
            ControllerUrls {
                metadata_url: "http://garm.test/api/v1/metadata".into(),
                callback_url: "http://garm.test/api/v1/callbacks".into(),
                webhook_url: "http://garm.test/webhooks".into(),
                agent_url: None,
                tools_url: None,
            },
            backoff,
        ));

        let provider = Arc::new(MockProvider::new("mock"));
        let dispatcher = Arc::new(Dispatcher::new(
            vec![Arc::clone(&provider) as Arc<dyn Provider>],
            16,
        ));

        let forge_state = ForgeState::new(TEST_PAT);
        let forge_factory = MockForgeFactory::new(Arc::clone(&forge_state));

        Self {
            store,
            bus,
            cache,
            ctx,
            provider,
            dispatcher,
            forge_state,
            forge_factory,
        }
    }

    fn dyn_store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store) as Arc<dyn Store>
    }

    // -- seeding ------------------------------------------------------------

    pub fn endpoint(&self) -> ForgeEndpoint {
        ForgeEndpoint {
            name: "github.com".into(),
            description: "mock github".into(),
            kind: ForgeKind::Github,
            base_url: "https://github.com".into(),
            api_base_url: "https://api.github.com".into(),
            upload_base_url: None,
            ca_cert_bundle: None,
        }
    }

    /// Seed endpoint + PAT credentials `c1` + a repository entity.
    pub fn seed_repo_entity(&self, owner: &str, name: &str) -> ForgeEntity {
        if self.store.get_endpoint("github.com").is_err() {
            self.store.create_endpoint(self.endpoint()).unwrap();
        }
        if self.store.get_credentials("c1").is_err() {
            self.store
                .create_credentials(ForgeCredentials {
                    id: 0,
                    name: "c1".into(),
                    description: String::new(),
                    endpoint: self.endpoint(),
                    auth_kind: AuthKind::Pat,
                    pat: Some(PatCredentials {
                        token: TEST_PAT.into(),
                    }),
                    app: None,
                })
                .unwrap();
        }
        let entity = ForgeEntity {
            id: Uuid::new_v4(),
            kind: EntityKind::Repository,
            owner: owner.into(),
            name: Some(name.into()),
            credentials_name: "c1".into(),
            endpoint_name: "github.com".into(),
            webhook_secret: "hunter2".into(),
            balancer: PoolBalancerType::RoundRobin,
            pool_manager_status: PoolManagerStatus::default(),
        };
        self.store.create_entity(entity.clone()).unwrap();
        entity
    }

    pub fn seed_pool(
        &self,
        entity: &ForgeEntity,
        min_idle: u32,
        max: u32,
        tags: &[&str],
    ) -> Pool {
        let now = Utc::now();
        let pool = Pool {
            id: Uuid::new_v4(),
            entity_id: entity.id,
            provider_name: "mock".into(),
            image: "ubuntu:22.04".into(),
            flavor: "default".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            min_idle_runners: min_idle,
            max_runners: max,
            enabled: true,
            priority: 0,
            extra_specs: serde_json::json!({}),
            runner_bootstrap_timeout_mins: 20,
            runner_prefix: "garm".into(),
            template_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_pool(pool.clone()).unwrap();
        pool
    }

    pub fn seed_scale_set(&self, entity: &ForgeEntity, id: i64, min_idle: u32, max: u32) -> ScaleSet {
        let now = Utc::now();
        let scale_set = ScaleSet {
            id,
            local_id: Uuid::new_v4(),
            entity_id: entity.id,
            name: format!("scale-set-{id}"),
            provider_name: "mock".into(),
            image: "ubuntu:22.04".into(),
            flavor: "default".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            min_idle_runners: min_idle,
            max_runners: max,
            enabled: true,
            extra_specs: serde_json::json!({}),
            runner_prefix: "garm-ss".into(),
            runner_group: String::new(),
            template_id: None,
            last_message_id: 0,
            session_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_scale_set(scale_set.clone()).unwrap();
        scale_set
    }

    // -- task startup -------------------------------------------------------

    pub fn fast_manager_config() -> PoolManagerConfig {
        PoolManagerConfig {
            tick_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(2),
            backoff: CreateBackoff {
                base: Duration::from_millis(50),
                cap: Duration::from_secs(1),
                max_attempts: 5,
                jitter: 0.0,
            },
        }
    }

    pub fn start_manager(&self, entity_id: Uuid) -> PoolManagerHandle {
        start_pool_manager(PoolManagerParams {
            entity_id,
            store: self.dyn_store(),
            cache: Arc::clone(&self.cache),
            bus: self.bus.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            forge_factory: Arc::clone(&self.forge_factory) as _,
            ctx: Arc::clone(&self.ctx),
            config: Self::fast_manager_config(),
        })
    }

    pub fn start_coordinator(
        &self,
        entity_id: Uuid,
        api: Arc<dyn ScaleSetApi>,
    ) -> ScaleSetCoordinatorHandle {
        start_scale_set_coordinator(ScaleSetCoordinatorParams {
            entity_id,
            store: self.dyn_store(),
            cache: Arc::clone(&self.cache),
            bus: self.bus.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            forge_factory: Arc::clone(&self.forge_factory) as _,
            api,
            ctx: Arc::clone(&self.ctx),
            config: ScaleSetCoordinatorConfig {
                long_poll: Duration::from_millis(100),
                max_session_failures: 5,
                shutdown_grace: Duration::from_secs(2),
            },
        })
    }

    pub fn reconciler_params(&self) -> ReconcilerParams {
        ReconcilerParams {
            store: self.dyn_store(),
            cache: Arc::clone(&self.cache),
            dispatcher: Arc::clone(&self.dispatcher),
            forge_factory: Arc::clone(&self.forge_factory) as _,
            ctx: Arc::clone(&self.ctx),
            config: ReconcilerConfig {
                interval: Duration::from_secs(600),
            },
        }
    }

    /// One reconciliation pass, synchronously.
    pub async fn reconcile_now(&self) {
        garm_reconcile::run_pass(&self.reconciler_params()).await;
    }

    // -- events -------------------------------------------------------------

    pub fn publish(&self, operation: Operation, payload: EventPayload) {
        self.bus.publish(ChangeEvent::new(operation, payload));
    }

    pub fn job_event(
        &self,
        action: WorkflowJobAction,
        job_id: i64,
        labels: &[&str],
        runner_name: Option<&str>,
    ) -> WorkflowJobEvent {
        WorkflowJobEvent {
            action,
            workflow_job: WorkflowJob {
                id: job_id,
                run_id: job_id * 10,
                name: format!("job-{job_id}"),
                status: format!("{action:?}").to_lowercase(),
                labels: labels.iter().map(|l| l.to_string()).collect(),
                runner_id: None,
                runner_name: runner_name.map(|r| r.to_string()),
                started_at: None,
                completed_at: None,
            },
            repository: None,
            organization: None,
            enterprise: None,
        }
    }

    // -- runner simulation ---------------------------------------------------

    /// What the instance callback handler does when the agent reports idle.
    pub fn simulate_runner_idle(&self, instance_name: &str) {
        self.store
            .set_instance_runner_status(instance_name, RunnerStatus::Idle)
            .unwrap();
        if let Ok(instance) = self.store.get_instance(instance_name) {
            self.publish(Operation::Update, EventPayload::Instance(instance));
        }
    }

    /// Mark every `running` instance of a pool idle.
    pub fn simulate_pool_runners_idle(&self, pool_id: Uuid) {
        for instance in self.store.list_pool_instances(pool_id) {
            if instance.status == garm_schemas::InstanceStatus::Running
                && instance.runner_status == RunnerStatus::Pending
            {
                self.simulate_runner_idle(&instance.name);
            }
        }
    }

    // -- assertions ---------------------------------------------------------

    pub fn running_count(&self, pool_id: Uuid) -> usize {
        self.store
            .list_pool_instances(pool_id)
            .iter()
            .filter(|i| i.status == garm_schemas::InstanceStatus::Running)
            .count()
    }

    pub fn idle_count(&self, pool_id: Uuid) -> usize {
        self.store
            .list_pool_instances(pool_id)
            .iter()
            .filter(|i| i.is_idle_runner())
            .count()
    }

    pub fn live_count(&self, pool_id: Uuid) -> usize {
        self.store
            .list_pool_instances(pool_id)
            .iter()
            .filter(|i| i.status.is_live())
            .count()
    }

    /// Poll until `pred` holds; panics with `what` on timeout.
    pub async fn wait_until<F>(&self, what: &str, timeout: Duration, pred: F)
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Hold `pred` true over `window`; panics the moment it flips.
    pub async fn assert_holds<F>(&self, what: &str, window: Duration, pred: F)
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + window;
        while tokio::time::Instant::now() < deadline {
            assert!(pred(), "invariant violated: {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

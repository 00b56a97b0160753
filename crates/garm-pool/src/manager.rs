//! The per-entity pool manager task.
//!
//! One manager owns every pool under one forge entity. It is driven by three
//! inputs, multiplexed in a single select loop so the entity sees one serial
//! mutation stream:
//!
//! 1. a ticker (idle maintenance, bootstrap aging, create retries, delete
//!    processing);
//! 2. a strict job queue (webhook-delivered `workflow_job` events — these
//!    must never be lost, so they bypass the lossy broadcast bus);
//! 3. the event bus (configuration changes, credentials rotation, entity
//!    deletion). A lagged bus subscription forces a full resync.
//!
//! Provider and forge work runs in spawned tasks collected in a `JoinSet`;
//! each task returns a [`TaskReport`] the manager folds into its failure
//! accounting on the next tick. Shutdown cancels the loop, then drains the
//! `JoinSet` within a grace period before aborting what is left.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use garm_events::{
    BusEvent, Cache, ChangeEvent, ControllerContext, EntityType, EventBus, EventFilter,
    EventPayload, Operation,
};
use garm_forge::{ForgeClient, ForgeClientProvider, ForgeError};
use garm_provider::Dispatcher;
use garm_schemas::{
    labels, BootstrapInstance, EventLevel, ForgeEntity, ForgeKind, Instance, InstanceParent,
    InstanceStatus, Pool, PoolBalancerType, PoolManagerStatus, RunnerStatus, StatusMessage,
    WorkflowJobAction, WorkflowJobEvent,
};
use garm_store::Store;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::CreateBackoff;
use crate::statemachine::{apply_runner_status, next_status, LifecycleEvent};

/// Consecutive transient forge failures before the manager degrades.
const MAX_TRANSIENT_FORGE_FAILURES: u32 = 3;

// ---------------------------------------------------------------------------
// Public configuration / handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    pub tick_interval: Duration,
    pub shutdown_grace: Duration,
    pub backoff: CreateBackoff,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(20),
            backoff: CreateBackoff::default(),
        }
    }
}

pub struct PoolManagerParams {
    pub entity_id: Uuid,
    pub store: Arc<dyn Store>,
    pub cache: Arc<Cache>,
    pub bus: EventBus,
    pub dispatcher: Arc<Dispatcher>,
    pub forge_factory: Arc<dyn ForgeClientProvider>,
    pub ctx: Arc<ControllerContext>,
    pub config: PoolManagerConfig,
}

/// Handle owned by the daemon's manager registry.
pub struct PoolManagerHandle {
    entity_id: Uuid,
    jobs: mpsc::UnboundedSender<WorkflowJobEvent>,
    cancel: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl PoolManagerHandle {
    pub fn entity_id(&self) -> Uuid {
        self.entity_id
    }

    /// Strict delivery of a webhook job event. Returns `false` once the
    /// manager has stopped.
    pub fn deliver_job(&self, event: WorkflowJobEvent) -> bool {
        self.jobs.send(event).is_ok()
    }

    /// Cooperative shutdown: cancel the loop and wait for the drain.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.join.await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Construct and start the manager task for one entity.
pub fn start_pool_manager(params: PoolManagerParams) -> PoolManagerHandle {
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let entity_id = params.entity_id;

    let manager = PoolManager {
        entity_id,
        entity: None,
        store: params.store,
        cache: params.cache,
        bus: params.bus,
        dispatcher: params.dispatcher,
        forge_factory: params.forge_factory,
        ctx: params.ctx,
        config: params.config,
        forge: None,
        forge_kind: None,
        rr_cursor: 0,
        parked_jobs: VecDeque::new(),
        pool_consecutive_failures: HashMap::new(),
        consecutive_forge_failures: 0,
        failed_reason: None,
        credentials_refreshed: false,
        draining: false,
        in_flight: JoinSet::new(),
        in_flight_ops: Arc::new(Mutex::new(HashSet::new())),
    };

    let join = tokio::spawn(manager.run(jobs_rx, cancel_rx));
    PoolManagerHandle {
        entity_id,
        jobs: jobs_tx,
        cancel: cancel_tx,
        join,
    }
}

// ---------------------------------------------------------------------------
// Task plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOp {
    Create,
    Delete,
    Ping,
}

/// What a spawned worker observed; folded into manager accounting on reap.
#[derive(Debug, Clone)]
struct TaskReport {
    op: TaskOp,
    pool_id: Option<Uuid>,
    ok: bool,
    /// A forge call succeeded during this task.
    forge_ok: bool,
    /// A forge call failed with 401/403.
    forge_auth: bool,
    /// A forge call failed transiently.
    forge_transient: bool,
}

impl TaskReport {
    fn new(op: TaskOp) -> Self {
        Self {
            op,
            pool_id: None,
            ok: false,
            forge_ok: false,
            forge_auth: false,
            forge_transient: false,
        }
    }

    fn observe_forge<T>(&mut self, result: &Result<T, ForgeError>) {
        match result {
            Ok(_) => self.forge_ok = true,
            Err(e) if e.is_auth() => self.forge_auth = true,
            Err(e) if e.is_transient() => self.forge_transient = true,
            Err(_) => {}
        }
    }
}

/// Everything a worker task needs, cloneable before spawn.
#[derive(Clone)]
struct TaskCtx {
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    bus: EventBus,
    dispatcher: Arc<Dispatcher>,
    ctx: Arc<ControllerContext>,
    entity: ForgeEntity,
    forge: Option<Arc<dyn ForgeClient>>,
    forge_kind: Option<ForgeKind>,
    in_flight_ops: Arc<Mutex<HashSet<String>>>,
}

impl TaskCtx {
    fn release(&self, instance_name: &str) {
        self.in_flight_ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_name);
    }

    fn publish_instance(&self, operation: Operation, instance_name: &str) {
        if let Ok(instance) = self.store.get_instance(instance_name) {
            self.bus
                .publish(ChangeEvent::new(operation, EventPayload::Instance(instance)));
        }
    }
}

#[derive(Debug, Clone)]
struct ParkedJob {
    event: WorkflowJobEvent,
    first_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PoolManager
// ---------------------------------------------------------------------------

struct PoolManager {
    entity_id: Uuid,
    entity: Option<ForgeEntity>,
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    bus: EventBus,
    dispatcher: Arc<Dispatcher>,
    forge_factory: Arc<dyn ForgeClientProvider>,
    ctx: Arc<ControllerContext>,
    config: PoolManagerConfig,
    forge: Option<Arc<dyn ForgeClient>>,
    forge_kind: Option<ForgeKind>,
    rr_cursor: usize,
    parked_jobs: VecDeque<ParkedJob>,
    pool_consecutive_failures: HashMap<Uuid, u32>,
    consecutive_forge_failures: u32,
    failed_reason: Option<String>,
    credentials_refreshed: bool,
    draining: bool,
    in_flight: JoinSet<TaskReport>,
    /// Instance names with a worker task in flight; guards double-scheduling.
    in_flight_ops: Arc<Mutex<HashSet<String>>>,
}

impl PoolManager {
    async fn run(
        mut self,
        mut jobs_rx: mpsc::UnboundedReceiver<WorkflowJobEvent>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        if !self.startup() {
            return;
        }

        let mut events = self.bus.subscribe_filters(vec![
            EventFilter::any().owning_entity(self.entity_id),
            EventFilter::any().entity_types([EntityType::Credentials]),
        ]);

        // Webhook deliveries missed while the controller was down: park
        // whatever the forge still reports as queued.
        self.recover_queued_jobs().await;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    if self.drained() {
                        break;
                    }
                }
                job = jobs_rx.recv() => {
                    match job {
                        Some(event) => self.handle_job(event).await,
                        None => break,
                    }
                }
                event = events.next() => {
                    match event {
                        Some(BusEvent::Change(ev)) => self.handle_event(ev).await,
                        Some(BusEvent::Lagged(skipped)) => {
                            warn!(
                                entity = %self.entity_id,
                                skipped, "event bus lagged, resyncing from store"
                            );
                            if !self.resync() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.drain_in_flight().await;
        self.mark_stopped();
        info!(entity = %self.entity_id, "pool manager stopped");
    }

    // -- lifecycle ----------------------------------------------------------

    fn startup(&mut self) -> bool {
        match self.store.get_entity(self.entity_id) {
            Ok(entity) => {
                info!(entity = %entity.forge_path(), "pool manager starting");
                self.entity = Some(entity);
            }
            Err(e) => {
                error!(entity = %self.entity_id, "cannot start pool manager: {e}");
                return false;
            }
        }
        let _ = self
            .store
            .set_pool_manager_status(self.entity_id, PoolManagerStatus::running());
        self.store.record_entity_event(
            self.entity_id,
            EventLevel::Info,
            "pool manager started".to_string(),
        );
        self.publish_entity_update();
        true
    }

    fn resync(&mut self) -> bool {
        match self.store.get_entity(self.entity_id) {
            Ok(entity) => {
                self.entity = Some(entity);
                true
            }
            // Entity is gone; nothing left to manage.
            Err(_) => false,
        }
    }

    fn drained(&self) -> bool {
        self.draining
            && self.store.list_entity_instances(self.entity_id).is_empty()
            && self.in_flight.is_empty()
    }

    fn mark_stopped(&mut self) {
        if self.draining {
            // Entity record is already deleted.
            return;
        }
        let status = match &self.failed_reason {
            Some(reason) => PoolManagerStatus::failed(reason.clone()),
            None => PoolManagerStatus::default(),
        };
        let _ = self.store.set_pool_manager_status(self.entity_id, status);
    }

    async fn drain_in_flight(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.in_flight.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        entity = %self.entity_id,
                        "shutdown grace expired, aborting in-flight dispatches"
                    );
                    self.in_flight.abort_all();
                    break;
                }
            }
        }
    }

    // -- accounting ---------------------------------------------------------

    fn reap(&mut self) {
        while let Some(result) = self.in_flight.try_join_next() {
            match result {
                Ok(report) => self.apply_report(report),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(entity = %self.entity_id, "worker task panicked: {e}"),
            }
        }
    }

    fn apply_report(&mut self, report: TaskReport) {
        if report.forge_auth {
            self.degrade("forge rejected credentials (401/403)");
        } else if report.forge_transient {
            self.consecutive_forge_failures += 1;
            if self.consecutive_forge_failures >= MAX_TRANSIENT_FORGE_FAILURES {
                self.degrade("forge unreachable");
            }
        } else if report.forge_ok {
            self.consecutive_forge_failures = 0;
            // Recovery policy: first successful forge call after a
            // credentials event flips the manager back to running.
            if self.failed_reason.is_some() && self.credentials_refreshed {
                self.recover();
            }
        }

        if report.op == TaskOp::Create {
            if let Some(pool_id) = report.pool_id {
                if report.ok {
                    self.pool_consecutive_failures.remove(&pool_id);
                } else {
                    *self.pool_consecutive_failures.entry(pool_id).or_insert(0) += 1;
                }
            }
        }
    }

    fn degrade(&mut self, reason: &str) {
        if self.failed_reason.as_deref() == Some(reason) {
            return;
        }
        warn!(entity = %self.entity_id, "pool manager degraded: {reason}");
        self.failed_reason = Some(reason.to_string());
        let _ = self
            .store
            .set_pool_manager_status(self.entity_id, PoolManagerStatus::failed(reason));
        self.store
            .record_entity_event(self.entity_id, EventLevel::Error, reason.to_string());
        self.publish_entity_update();
    }

    fn recover(&mut self) {
        info!(entity = %self.entity_id, "pool manager recovered");
        self.failed_reason = None;
        self.credentials_refreshed = false;
        self.consecutive_forge_failures = 0;
        let _ = self
            .store
            .set_pool_manager_status(self.entity_id, PoolManagerStatus::running());
        self.store.record_entity_event(
            self.entity_id,
            EventLevel::Info,
            "pool manager recovered after credentials update".to_string(),
        );
        self.publish_entity_update();
    }

    fn publish_entity_update(&self) {
        if let Ok(entity) = self.store.get_entity(self.entity_id) {
            self.bus.publish(ChangeEvent::new(
                Operation::Update,
                EventPayload::Entity(entity),
            ));
        }
    }

    // -- forge client -------------------------------------------------------

    fn forge_client(&mut self) -> Option<Arc<dyn ForgeClient>> {
        if let Some(client) = &self.forge {
            return Some(Arc::clone(client));
        }
        let entity = self.entity.clone()?;
        let creds = match self.cache.get_credentials(&entity.credentials_name) {
            Ok(creds) => creds,
            Err(e) => {
                self.degrade(&format!("credentials unavailable: {e}"));
                return None;
            }
        };
        match self.forge_factory.client_for(&entity, &creds) {
            Ok(client) => {
                self.forge = Some(Arc::clone(&client));
                self.forge_kind = Some(creds.forge_kind());
                Some(client)
            }
            Err(e) => {
                self.degrade(&format!("cannot build forge client: {e}"));
                None
            }
        }
    }

    fn task_ctx(&mut self) -> Option<TaskCtx> {
        let entity = self.entity.clone()?;
        let forge = self.forge_client();
        Some(TaskCtx {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            bus: self.bus.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            ctx: Arc::clone(&self.ctx),
            entity,
            forge,
            forge_kind: self.forge_kind,
            in_flight_ops: Arc::clone(&self.in_flight_ops),
        })
    }

    fn claim(&self, instance_name: &str) -> bool {
        self.in_flight_ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_name.to_string())
    }

    // -- tick ---------------------------------------------------------------

    async fn tick(&mut self) {
        self.reap();

        if self.draining {
            self.mark_entity_for_delete();
            self.process_deletes();
            return;
        }
        if self.failed_reason.is_some() {
            return;
        }

        let pools = self.store.list_entity_pools(self.entity_id);
        for pool in pools.iter().filter(|p| p.enabled) {
            self.age_out_creating(pool);
            self.retry_errored(pool);
            self.maintain_min_idle(pool);
        }
        self.drain_parked_jobs().await;
        self.process_deletes();
    }

    fn age_out_creating(&mut self, pool: &Pool) {
        let now = Utc::now();
        for instance in self.store.list_pool_instances(pool.id) {
            if !instance.bootstrap_expired(pool.bootstrap_timeout(), now) {
                continue;
            }
            if self.is_claimed(&instance.name) {
                continue;
            }
            match next_status(instance.status, LifecycleEvent::RequestDelete) {
                Ok(next) => {
                    warn!(
                        instance = %instance.name,
                        pool = %pool.id,
                        "bootstrap timed out, scheduling replacement"
                    );
                    let _ = self.store.set_instance_status(
                        &instance.name,
                        next,
                        Some(StatusMessage {
                            created_at: now,
                            level: EventLevel::Warning,
                            message: format!(
                                "runner failed to bootstrap within {} minutes",
                                pool.runner_bootstrap_timeout_mins
                            ),
                        }),
                    );
                    self.store.record_entity_event(
                        self.entity_id,
                        EventLevel::Warning,
                        format!("instance {} aged out during bootstrap", instance.name),
                    );
                }
                Err(e) => debug!(instance = %instance.name, "skip aging: {e}"),
            }
        }
    }

    fn is_claimed(&self, instance_name: &str) -> bool {
        self.in_flight_ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(instance_name)
    }

    fn retry_errored(&mut self, pool: &Pool) {
        if pool.failure_reason.is_some() {
            return;
        }
        let now = Utc::now();
        for instance in self.store.list_pool_instances(pool.id) {
            if instance.status != InstanceStatus::Error || self.is_claimed(&instance.name) {
                continue;
            }
            if self.config.backoff.exhausted(instance.creation_attempts) {
                let reason = format!(
                    "instance create failed {} times, last error: {}",
                    instance.creation_attempts,
                    instance
                        .last_creation_error
                        .as_deref()
                        .unwrap_or("unknown")
                );
                error!(pool = %pool.id, "{reason}");
                let _ = self
                    .store
                    .set_pool_failure_reason(pool.id, Some(reason.clone()));
                self.store
                    .record_entity_event(self.entity_id, EventLevel::Error, reason);
                if let Ok(updated) = self.store.get_pool(pool.id) {
                    self.bus
                        .publish(ChangeEvent::new(Operation::Update, EventPayload::Pool(updated)));
                }
                continue;
            }
            let Some(delay) = self.config.backoff.delay_for(instance.creation_attempts) else {
                continue;
            };
            let elapsed = now - instance.updated_at;
            let delay = match chrono::Duration::from_std(delay) {
                Ok(d) => d,
                Err(_) => continue,
            };
            if elapsed < delay {
                continue;
            }
            self.spawn_create(pool.clone(), instance.name.clone(), true);
        }
    }

    fn maintain_min_idle(&mut self, pool: &Pool) {
        if pool.failure_reason.is_some() {
            return;
        }
        let instances = self.store.list_pool_instances(pool.id);
        let live = instances.iter().filter(|i| i.status.is_live()).count();
        let idle_or_coming = instances.iter().filter(|i| is_idle_or_coming(i)).count();
        // Errored instances own their slot until the retry budget gives up
        // on them; provisioning fresh capacity on top would double-book.
        let errored = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Error)
            .count();

        let min_idle = pool.min_idle_runners as usize;
        let max = pool.max_runners as usize;
        let deficit = min_idle.saturating_sub(idle_or_coming + errored);
        let capacity = max.saturating_sub(live + errored);
        for _ in 0..deficit.min(capacity) {
            self.create_new_instance(pool);
        }
    }

    /// Insert a fresh `pending_create` record and spawn its create worker.
    fn create_new_instance(&mut self, pool: &Pool) {
        let name = format!("{}-{}", pool.runner_prefix, Uuid::new_v4());
        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4(),
            name: name.clone(),
            provider_id: None,
            parent: InstanceParent::Pool(pool.id),
            entity_id: self.entity_id,
            provider_name: pool.provider_name.clone(),
            os_type: pool.os_type,
            os_arch: pool.os_arch,
            status: InstanceStatus::PendingCreate,
            runner_status: RunnerStatus::Pending,
            addresses: vec![],
            agent_id: None,
            jit_config: None,
            token_fetched: false,
            callback_token: Uuid::new_v4().simple().to_string(),
            creation_attempts: 0,
            last_creation_error: None,
            status_messages: vec![],
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.create_instance(instance.clone()) {
            error!(pool = %pool.id, "cannot record new instance: {e}");
            return;
        }
        self.bus.publish(ChangeEvent::new(
            Operation::Create,
            EventPayload::Instance(instance),
        ));
        self.spawn_create(pool.clone(), name, false);
    }

    fn spawn_create(&mut self, pool: Pool, instance_name: String, retry: bool) {
        if !self.claim(&instance_name) {
            return;
        }
        let Some(ctx) = self.task_ctx() else {
            self.in_flight_ops
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&instance_name);
            return;
        };
        self.in_flight
            .spawn(run_create(ctx, pool, instance_name, retry));
    }

    fn process_deletes(&mut self) {
        let instances = self.store.list_entity_instances(self.entity_id);
        for instance in instances {
            let force = match instance.status {
                InstanceStatus::PendingDelete => false,
                InstanceStatus::PendingForceDelete => true,
                _ => continue,
            };
            if !self.claim(&instance.name) {
                continue;
            }
            let Some(ctx) = self.task_ctx() else {
                self.in_flight_ops
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&instance.name);
                return;
            };
            self.in_flight.spawn(run_delete(ctx, instance.name, force));
        }
    }

    fn mark_entity_for_delete(&mut self) {
        for instance in self.store.list_entity_instances(self.entity_id) {
            if matches!(
                instance.status,
                InstanceStatus::PendingDelete
                    | InstanceStatus::PendingForceDelete
                    | InstanceStatus::Deleting
                    | InstanceStatus::Deleted
            ) {
                continue;
            }
            if let Ok(next) = next_status(instance.status, LifecycleEvent::RequestDelete) {
                let _ = self.store.set_instance_status(&instance.name, next, None);
            }
        }
    }

    // -- job dispatch -------------------------------------------------------

    async fn handle_job(&mut self, event: WorkflowJobEvent) {
        match event.action {
            WorkflowJobAction::Queued => {
                let job_id = event.workflow_job.id;
                if self
                    .parked_jobs
                    .iter()
                    .any(|p| p.event.workflow_job.id == job_id)
                {
                    return;
                }
                self.parked_jobs.push_back(ParkedJob {
                    event,
                    first_seen: Utc::now(),
                });
                self.drain_parked_jobs().await;
            }
            WorkflowJobAction::InProgress => {
                self.parked_jobs
                    .retain(|p| p.event.workflow_job.id != event.workflow_job.id);
                self.mark_runner(&event, RunnerStatus::Active);
            }
            WorkflowJobAction::Completed => {
                self.parked_jobs
                    .retain(|p| p.event.workflow_job.id != event.workflow_job.id);
                self.complete_runner(&event);
            }
            WorkflowJobAction::Waiting => {}
        }
    }

    fn mark_runner(&mut self, event: &WorkflowJobEvent, status: RunnerStatus) {
        let Some(runner_name) = event.workflow_job.runner_name.as_deref() else {
            return;
        };
        let Ok(instance) = self.store.get_instance(runner_name) else {
            // Not one of ours (or another controller's runner).
            return;
        };
        let folded = apply_runner_status(instance.runner_status, status);
        if folded != instance.runner_status {
            let _ = self.store.set_instance_runner_status(&instance.name, folded);
        }
        if let Some(agent_id) = event.workflow_job.runner_id {
            if instance.agent_id.is_none() {
                let _ = self.store.set_instance_agent_id(&instance.name, agent_id);
            }
        }
    }

    /// `workflow_job.completed`: ephemeral runners are deleted after their
    /// single job. Replaying against an already-terminated instance is a
    /// no-op.
    fn complete_runner(&mut self, event: &WorkflowJobEvent) {
        let Some(runner_name) = event.workflow_job.runner_name.as_deref() else {
            return;
        };
        let Ok(instance) = self.store.get_instance(runner_name) else {
            return;
        };
        if instance.runner_status.is_terminal() && !instance.status.is_live() {
            return;
        }
        let folded = apply_runner_status(instance.runner_status, RunnerStatus::Terminated);
        if folded != instance.runner_status {
            let _ = self.store.set_instance_runner_status(&instance.name, folded);
        }
        if let Ok(next) = next_status(instance.status, LifecycleEvent::RequestDelete) {
            if next != instance.status {
                let _ = self.store.set_instance_status(&instance.name, next, None);
                self.bus.publish(ChangeEvent::new(
                    Operation::Update,
                    EventPayload::Instance(
                        self.store.get_instance(&instance.name).unwrap_or(instance),
                    ),
                ));
            }
        }
    }

    async fn drain_parked_jobs(&mut self) {
        if self.failed_reason.is_some() || self.draining {
            return;
        }
        let backoff = self.ctx.minimum_job_age_backoff();
        let now = Utc::now();
        let mut still_parked = VecDeque::new();

        while let Some(parked) = self.parked_jobs.pop_front() {
            let age = (now - parked.first_seen).to_std().unwrap_or_default();
            if age < backoff {
                still_parked.push_back(parked);
                continue;
            }
            match self.dispatch_queued_job(&parked.event) {
                DispatchOutcome::Dispatched => {}
                DispatchOutcome::NoCapacity => still_parked.push_back(parked),
                DispatchOutcome::NoPoolMatches => {
                    debug!(
                        job = parked.event.workflow_job.id,
                        labels = ?parked.event.workflow_job.labels,
                        "no pool matches job labels, ignoring"
                    );
                }
            }
        }
        self.parked_jobs = still_parked;
    }

    fn dispatch_queued_job(&mut self, event: &WorkflowJobEvent) -> DispatchOutcome {
        let job_labels = &event.workflow_job.labels;
        let mut matches: Vec<Pool> = self
            .store
            .list_entity_pools(self.entity_id)
            .into_iter()
            .filter(|p| p.enabled && p.failure_reason.is_none() && p.matches_labels(job_labels))
            .collect();
        if matches.is_empty() {
            return DispatchOutcome::NoPoolMatches;
        }
        // Priority desc; the balancer decides the starting point.
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        let balancer = self
            .entity
            .as_ref()
            .map(|e| e.balancer)
            .unwrap_or_default();
        let start = match balancer {
            PoolBalancerType::Pack => 0,
            PoolBalancerType::RoundRobin => {
                let s = self.rr_cursor % matches.len();
                self.rr_cursor = self.rr_cursor.wrapping_add(1);
                s
            }
        };

        for offset in 0..matches.len() {
            let pool = &matches[(start + offset) % matches.len()];
            let instances = self.store.list_pool_instances(pool.id);

            // An idle runner can take the job; reserve it so a second queued
            // event does not double-book.
            if let Some(idle) = instances.iter().find(|i| i.is_idle_runner()) {
                let _ = self
                    .store
                    .set_instance_runner_status(&idle.name, RunnerStatus::Active);
                debug!(job = event.workflow_job.id, runner = %idle.name, "job matched to idle runner");
                return DispatchOutcome::Dispatched;
            }

            let live = instances.iter().filter(|i| i.status.is_live()).count();
            if live < pool.max_runners as usize {
                debug!(job = event.workflow_job.id, pool = %pool.id, "scaling up for queued job");
                let pool = pool.clone();
                self.create_new_instance(&pool);
                return DispatchOutcome::Dispatched;
            }
        }
        DispatchOutcome::NoCapacity
    }

    // -- configuration events -----------------------------------------------

    async fn handle_event(&mut self, event: ChangeEvent) {
        match (&event.payload, event.operation) {
            (EventPayload::Entity(e), Operation::Delete) if e.id == self.entity_id => {
                info!(entity = %e.forge_path(), "entity deleted, draining runners");
                self.draining = true;
                self.mark_entity_for_delete();
                self.process_deletes();
            }
            (EventPayload::Entity(e), _) if e.id == self.entity_id => {
                if self
                    .entity
                    .as_ref()
                    .map(|old| old.credentials_name != e.credentials_name)
                    .unwrap_or(true)
                {
                    self.forge = None;
                    self.credentials_refreshed = true;
                }
                self.entity = Some(e.clone());
            }
            (EventPayload::Credentials(c), _) => {
                let ours = self
                    .entity
                    .as_ref()
                    .map(|e| e.credentials_name == c.name)
                    .unwrap_or(false);
                if ours {
                    info!(
                        entity = %self.entity_id,
                        credentials = %c.name,
                        "credentials changed, rebuilding forge client"
                    );
                    self.forge_factory.invalidate_credentials(&c.name);
                    // Rebuild from the event payload; the cache may not have
                    // applied this event yet.
                    self.forge = None;
                    if let Some(entity) = self.entity.clone() {
                        if let Ok(client) = self.forge_factory.client_for(&entity, c) {
                            self.forge = Some(client);
                            self.forge_kind = Some(c.forge_kind());
                        }
                    }
                    self.credentials_refreshed = true;
                    self.clear_pool_failures();
                    self.spawn_ping();
                }
            }
            (EventPayload::Pool(p), Operation::Delete) => {
                for instance in self.store.list_pool_instances(p.id) {
                    if let Ok(next) = next_status(instance.status, LifecycleEvent::RequestDelete) {
                        let _ = self.store.set_instance_status(&instance.name, next, None);
                    }
                }
                self.pool_consecutive_failures.remove(&p.id);
            }
            (EventPayload::Pool(p), _) => {
                // A configuration change restarts the retry budget.
                self.pool_consecutive_failures.remove(&p.id);
                if p.failure_reason.is_none() {
                    for instance in self.store.list_pool_instances(p.id) {
                        if instance.status == InstanceStatus::Error {
                            let _ = self.store.reset_creation_attempts(&instance.name);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Credentials changed: give every given-up pool a fresh retry budget.
    fn clear_pool_failures(&mut self) {
        for pool in self.store.list_entity_pools(self.entity_id) {
            if pool.failure_reason.is_some() {
                let _ = self.store.set_pool_failure_reason(pool.id, None);
            }
            for instance in self.store.list_pool_instances(pool.id) {
                if instance.status == InstanceStatus::Error {
                    let _ = self.store.reset_creation_attempts(&instance.name);
                }
            }
        }
        self.pool_consecutive_failures.clear();
    }

    async fn recover_queued_jobs(&mut self) {
        let Some(forge) = self.forge_client() else {
            return;
        };
        match forge.list_queued_jobs().await {
            Ok(jobs) => {
                let now = Utc::now();
                for job in jobs {
                    if self
                        .parked_jobs
                        .iter()
                        .any(|p| p.event.workflow_job.id == job.id)
                    {
                        continue;
                    }
                    debug!(job = job.id, "recovered queued job from forge");
                    self.parked_jobs.push_back(ParkedJob {
                        event: WorkflowJobEvent {
                            action: WorkflowJobAction::Queued,
                            workflow_job: job,
                            repository: None,
                            organization: None,
                            enterprise: None,
                        },
                        first_seen: now,
                    });
                }
            }
            Err(e) => debug!(entity = %self.entity_id, "queued-job recovery failed: {e}"),
        }
    }

    fn spawn_ping(&mut self) {
        let Some(client) = self.forge_client() else {
            return;
        };
        self.in_flight.spawn(async move {
            let mut report = TaskReport::new(TaskOp::Ping);
            let result = client.ping().await;
            report.observe_forge(&result);
            report.ok = result.is_ok();
            report
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Dispatched,
    NoCapacity,
    NoPoolMatches,
}

/// Counts toward the `min_idle` target: anything that is, or is about to
/// become, an idle runner.
fn is_idle_or_coming(instance: &Instance) -> bool {
    match instance.status {
        InstanceStatus::PendingCreate | InstanceStatus::Creating => true,
        InstanceStatus::Running => matches!(
            instance.runner_status,
            RunnerStatus::Pending | RunnerStatus::Installing | RunnerStatus::Idle
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Worker tasks
// ---------------------------------------------------------------------------

/// Create (or retry-create) one instance end to end: mint registration
/// material, assemble the bootstrap descriptor, call the provider, record
/// the result.
async fn run_create(
    ctx: TaskCtx,
    pool: Pool,
    instance_name: String,
    retry: bool,
) -> TaskReport {
    let mut report = TaskReport::new(TaskOp::Create);
    report.pool_id = Some(pool.id);

    let result = do_create(&ctx, &pool, &instance_name, retry, &mut report).await;
    match result {
        Ok(()) => {
            report.ok = true;
            ctx.publish_instance(Operation::Update, &instance_name);
        }
        Err(message) => {
            warn!(instance = %instance_name, "create failed: {message}");
            let _ = ctx
                .store
                .record_creation_attempt(&instance_name, Some(message.clone()));
            let _ = ctx.store.set_instance_status(
                &instance_name,
                InstanceStatus::Error,
                Some(StatusMessage {
                    created_at: Utc::now(),
                    level: EventLevel::Error,
                    message,
                }),
            );
            ctx.publish_instance(Operation::Update, &instance_name);
        }
    }
    ctx.release(&instance_name);
    report
}

async fn do_create(
    ctx: &TaskCtx,
    pool: &Pool,
    instance_name: &str,
    retry: bool,
    report: &mut TaskReport,
) -> Result<(), String> {
    let instance = ctx
        .store
        .get_instance(instance_name)
        .map_err(|e| e.to_string())?;

    if retry {
        // Clean up partial provider state from the failed attempt; a missing
        // instance is the expected case.
        if let Err(e) = ctx
            .dispatcher
            .delete_instance(&pool.provider_name, instance_name)
            .await
        {
            debug!(instance = %instance_name, "pre-retry cleanup: {e}");
        }
    }

    let next = next_status(instance.status, LifecycleEvent::PickUp).map_err(|e| e.to_string())?;
    ctx.store
        .set_instance_status(instance_name, next, None)
        .map_err(|e| e.to_string())?;

    let forge = ctx
        .forge
        .as_ref()
        .ok_or_else(|| "no forge client available".to_string())?;

    // Tools manifest: cache first, forge on miss.
    let tools = match ctx.cache.get_tools(ctx.entity.id) {
        Some(tools) => tools,
        None => {
            let result = forge.list_runner_applications().await;
            report.observe_forge(&result);
            let tools = result.map_err(|e| e.to_string())?;
            ctx.cache.set_tools(ctx.entity.id, tools.clone());
            tools
        }
    };

    let mut runner_labels = pool.tags.clone();
    runner_labels.push(labels::pool_label(pool.id));
    runner_labels.push(labels::controller_label(ctx.ctx.controller_id()));

    // JIT where the forge and provider both allow it; otherwise the runner
    // pulls a registration token from the metadata endpoint.
    let use_jit = ctx.forge_kind == Some(ForgeKind::Github)
        && !ctx.dispatcher.jit_disabled(&pool.provider_name);
    if use_jit {
        let result = forge
            .get_jit_config(instance_name, &runner_labels, "")
            .await;
        report.observe_forge(&result);
        let (files, runner) = result.map_err(|e| e.to_string())?;
        ctx.store
            .set_instance_jit_config(instance_name, files)
            .map_err(|e| e.to_string())?;
        ctx.store
            .set_instance_agent_id(instance_name, runner.id)
            .map_err(|e| e.to_string())?;
    }

    let urls = ctx.ctx.urls();
    let bootstrap = BootstrapInstance {
        name: instance_name.to_string(),
        tools,
        forge_url: forge.forge_url(),
        callback_url: urls.callback_url,
        metadata_url: urls.metadata_url,
        instance_token: instance.callback_token.clone(),
        ssh_keys: vec![],
        extra_specs: pool.extra_specs.clone(),
        labels: runner_labels,
        pool_id: pool.id.to_string(),
        flavor: pool.flavor.clone(),
        image: pool.image.clone(),
        os_type: pool.os_type,
        os_arch: pool.os_arch,
        runner_group: String::new(),
        ca_cert_bundle: None,
        jit_config_enabled: use_jit,
    };

    let created = ctx
        .dispatcher
        .create_instance(&pool.provider_name, &bootstrap)
        .await
        .map_err(|e| e.to_string())?;

    ctx.store
        .set_instance_provider_info(instance_name, created.provider_id, created.addresses)
        .map_err(|e| e.to_string())?;
    let running =
        next_status(InstanceStatus::Creating, LifecycleEvent::ProviderCreated)
            .map_err(|e| e.to_string())?;
    ctx.store
        .set_instance_status(instance_name, running, None)
        .map_err(|e| e.to_string())?;
    info!(instance = %instance_name, pool = %pool.id, "instance running");
    Ok(())
}

/// Delete one instance: forge deregistration first (unless forced), then the
/// provider, then the record.
async fn run_delete(ctx: TaskCtx, instance_name: String, force: bool) -> TaskReport {
    let mut report = TaskReport::new(TaskOp::Delete);

    let instance = match ctx.store.get_instance(&instance_name) {
        Ok(i) => i,
        Err(_) => {
            ctx.release(&instance_name);
            report.ok = true;
            return report;
        }
    };

    if let Ok(next) = next_status(instance.status, LifecycleEvent::DeleteStarted) {
        let _ = ctx.store.set_instance_status(&instance_name, next, None);
    }

    // Forge deregistration. 404 = already gone = success; auth errors stall
    // the delete unless the force path was requested.
    if !force {
        if let Some(agent_id) = instance.agent_id {
            if let Some(forge) = &ctx.forge {
                let result = forge.remove_runner(agent_id).await;
                match &result {
                    Ok(()) => report.forge_ok = true,
                    Err(e) if e.is_not_found() => report.forge_ok = true,
                    Err(e) => {
                        report.observe_forge(&result);
                        let _ = ctx.store.set_instance_status(
                            &instance_name,
                            InstanceStatus::PendingDelete,
                            Some(StatusMessage {
                                created_at: Utc::now(),
                                level: EventLevel::Warning,
                                message: format!("forge deregistration failed: {e}"),
                            }),
                        );
                        ctx.release(&instance_name);
                        return report;
                    }
                }
            }
        }
    }

    match ctx
        .dispatcher
        .delete_instance(&instance.provider_name, &instance_name)
        .await
    {
        Ok(()) => {}
        Err(e) if force => {
            // Force remove: provider errors are logged, the record goes away
            // regardless.
            warn!(instance = %instance_name, "force delete, ignoring provider error: {e}");
        }
        Err(e) if e.is_transient() => {
            let _ = ctx.store.set_instance_status(
                &instance_name,
                InstanceStatus::PendingDelete,
                None,
            );
            warn!(instance = %instance_name, "delete will retry: {e}");
            ctx.release(&instance_name);
            return report;
        }
        Err(e) => {
            let _ = ctx.store.set_instance_status(
                &instance_name,
                InstanceStatus::PendingDelete,
                Some(StatusMessage {
                    created_at: Utc::now(),
                    level: EventLevel::Error,
                    message: format!("provider delete failed: {e}"),
                }),
            );
            ctx.release(&instance_name);
            return report;
        }
    }

    let mut record = instance;
    record.status = InstanceStatus::Deleted;
    let _ = ctx.store.delete_instance(&instance_name);
    ctx.dispatcher.forget_instance(&instance_name);
    ctx.bus.publish(ChangeEvent::new(
        Operation::Delete,
        EventPayload::Instance(record),
    ));
    info!(instance = %instance_name, "instance deleted");
    report.ok = true;
    ctx.release(&instance_name);
    report
}

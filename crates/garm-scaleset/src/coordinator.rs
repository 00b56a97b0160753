//! Per-entity scale-set coordinator.
//!
//! The coordinator owns one worker task per enabled scale set of its entity.
//! Each worker holds the long-poll session, applies message deltas through
//! the shared dispatcher + store + instance state machine, and acknowledges
//! messages by id. Session-invalidating responses (401/409) drop the session
//! and re-acquire; other failures count toward a budget, after which the
//! scale set is marked failed on the entity status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use garm_events::{
    BusEvent, Cache, ChangeEvent, ControllerContext, EntityType, EventBus, EventFilter,
    EventPayload, Operation,
};
use garm_forge::{ForgeClient, ForgeClientProvider};
use garm_pool::{apply_runner_status, next_status, LifecycleEvent};
use garm_provider::Dispatcher;
use garm_schemas::{
    labels, BootstrapInstance, EventLevel, Instance, InstanceParent, InstanceStatus,
    PoolManagerStatus, RunnerStatus, ScaleSet, StatusMessage,
};
use garm_store::Store;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ScaleSetApi, ScaleSetMessage, ScaleSetSession};

// ---------------------------------------------------------------------------
// Config / params / handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScaleSetCoordinatorConfig {
    /// Server-side message wait.
    pub long_poll: Duration,
    /// Consecutive non-session failures before the scale set is failed.
    pub max_session_failures: u32,
    pub shutdown_grace: Duration,
}

impl Default for ScaleSetCoordinatorConfig {
    fn default() -> Self {
        Self {
            long_poll: Duration::from_secs(50),
            max_session_failures: 5,
            shutdown_grace: Duration::from_secs(20),
        }
    }
}

pub struct ScaleSetCoordinatorParams {
    pub entity_id: Uuid,
    pub store: Arc<dyn Store>,
    pub cache: Arc<Cache>,
    pub bus: EventBus,
    pub dispatcher: Arc<Dispatcher>,
    pub forge_factory: Arc<dyn ForgeClientProvider>,
    pub api: Arc<dyn ScaleSetApi>,
    pub ctx: Arc<ControllerContext>,
    pub config: ScaleSetCoordinatorConfig,
}

pub struct ScaleSetCoordinatorHandle {
    entity_id: Uuid,
    cancel: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl ScaleSetCoordinatorHandle {
    pub fn entity_id(&self) -> Uuid {
        self.entity_id
    }

    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.join.await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub fn start_scale_set_coordinator(params: ScaleSetCoordinatorParams) -> ScaleSetCoordinatorHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let entity_id = params.entity_id;
    let coordinator = Coordinator {
        entity_id,
        wctx: WorkerCtx {
            store: params.store,
            cache: params.cache,
            bus: params.bus,
            dispatcher: params.dispatcher,
            forge_factory: params.forge_factory,
            api: params.api,
            ctx: params.ctx,
            config: params.config,
            entity_id,
        },
        workers: HashMap::new(),
    };
    let join = tokio::spawn(coordinator.run(cancel_rx));
    ScaleSetCoordinatorHandle {
        entity_id,
        cancel: cancel_tx,
        join,
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Shared, cloneable context handed to every worker.
#[derive(Clone)]
struct WorkerCtx {
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    bus: EventBus,
    dispatcher: Arc<Dispatcher>,
    forge_factory: Arc<dyn ForgeClientProvider>,
    api: Arc<dyn ScaleSetApi>,
    ctx: Arc<ControllerContext>,
    config: ScaleSetCoordinatorConfig,
    entity_id: Uuid,
}

impl WorkerCtx {
    fn forge_client(&self) -> Option<Arc<dyn ForgeClient>> {
        let entity = self.store.get_entity(self.entity_id).ok()?;
        let creds = self.cache.get_credentials(&entity.credentials_name).ok()?;
        self.forge_factory.client_for(&entity, &creds).ok()
    }
}

struct WorkerHandle {
    cancel: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

struct Coordinator {
    entity_id: Uuid,
    wctx: WorkerCtx,
    workers: HashMap<i64, WorkerHandle>,
}

impl Coordinator {
    async fn run(mut self, mut cancel_rx: watch::Receiver<bool>) {
        let mut events = self.wctx.bus.subscribe_filters(vec![
            EventFilter::any().owning_entity(self.entity_id),
            EventFilter::any().entity_types([EntityType::Credentials]),
        ]);

        for scale_set in self.wctx.store.list_entity_scale_sets(self.entity_id) {
            if scale_set.enabled {
                self.ensure_worker(scale_set.id);
            }
        }

        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                event = events.next() => {
                    match event {
                        Some(BusEvent::Change(ev)) => {
                            if !self.handle_event(ev).await {
                                break;
                            }
                        }
                        Some(BusEvent::Lagged(skipped)) => {
                            warn!(entity = %self.entity_id, skipped, "coordinator lagged, resyncing");
                            self.resync();
                        }
                        None => break,
                    }
                }
            }
        }

        self.stop_all_workers().await;
        info!(entity = %self.entity_id, "scale set coordinator stopped");
    }

    fn resync(&mut self) {
        let wanted: HashMap<i64, ScaleSet> = self
            .wctx
            .store
            .list_entity_scale_sets(self.entity_id)
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| (s.id, s))
            .collect();
        self.workers.retain(|id, handle| {
            if wanted.contains_key(id) && !handle.join.is_finished() {
                true
            } else {
                let _ = handle.cancel.send(true);
                false
            }
        });
        for id in wanted.keys() {
            self.ensure_worker(*id);
        }
    }

    async fn handle_event(&mut self, event: ChangeEvent) -> bool {
        match (&event.payload, event.operation) {
            (EventPayload::Entity(e), Operation::Delete) if e.id == self.entity_id => {
                return false;
            }
            (EventPayload::ScaleSet(s), Operation::Delete) => {
                self.stop_worker(s.id).await;
                for instance in self.wctx.store.list_scale_set_instances(s.id) {
                    if let Ok(next) =
                        next_status(instance.status, LifecycleEvent::RequestDelete)
                    {
                        let _ = self
                            .wctx
                            .store
                            .set_instance_status(&instance.name, next, None);
                    }
                }
                // Leftover deletes are picked up by the reconciler once the
                // worker is gone.
                process_deletes(&self.wctx, s.id, false).await;
            }
            (EventPayload::ScaleSet(s), _) => {
                if s.enabled {
                    self.ensure_worker(s.id);
                } else {
                    self.stop_worker(s.id).await;
                }
            }
            (EventPayload::Credentials(c), _) => {
                let ours = self
                    .wctx
                    .store
                    .get_entity(self.entity_id)
                    .map(|e| e.credentials_name == c.name)
                    .unwrap_or(false);
                if ours {
                    info!(
                        entity = %self.entity_id,
                        "credentials changed, restarting scale set sessions"
                    );
                    self.wctx.forge_factory.invalidate_credentials(&c.name);
                    self.resync_workers().await;
                }
            }
            _ => {}
        }
        true
    }

    fn ensure_worker(&mut self, scale_set_id: i64) {
        if let Some(existing) = self.workers.get(&scale_set_id) {
            if !existing.join.is_finished() {
                return;
            }
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let wctx = self.wctx.clone();
        let join = tokio::spawn(run_worker(wctx, scale_set_id, cancel_rx));
        self.workers.insert(
            scale_set_id,
            WorkerHandle {
                cancel: cancel_tx,
                join,
            },
        );
        debug!(scale_set = scale_set_id, "scale set worker started");
    }

    async fn stop_worker(&mut self, scale_set_id: i64) {
        if let Some(handle) = self.workers.remove(&scale_set_id) {
            let _ = handle.cancel.send(true);
            let _ = handle.join.await;
        }
    }

    async fn resync_workers(&mut self) {
        let ids: Vec<i64> = self.workers.keys().copied().collect();
        for id in ids {
            self.stop_worker(id).await;
            self.ensure_worker(id);
        }
    }

    async fn stop_all_workers(&mut self) {
        for (_, handle) in self.workers.drain() {
            let _ = handle.cancel.send(true);
            let deadline = tokio::time::timeout(self.wctx.config.shutdown_grace, handle.join);
            if deadline.await.is_err() {
                warn!(entity = %self.entity_id, "scale set worker did not stop in time");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_worker(wctx: WorkerCtx, scale_set_id: i64, mut cancel_rx: watch::Receiver<bool>) {
    let mut session: Option<ScaleSetSession> = None;
    let mut failures: u32 = 0;

    loop {
        if *cancel_rx.borrow() {
            break;
        }
        let scale_set = match wctx.store.get_scale_set(scale_set_id) {
            Ok(s) if s.enabled => s,
            _ => break,
        };

        if session.is_none() {
            match wctx.api.create_session(scale_set.id).await {
                Ok(s) => {
                    info!(scale_set = scale_set.id, "scale set session acquired");
                    let _ = wctx
                        .store
                        .set_scale_set_session(scale_set.id, Some(s.session_id.clone()));
                    session = Some(s);
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= wctx.config.max_session_failures {
                        fail_scale_set(&wctx, &scale_set, &e.to_string());
                        break;
                    }
                    let pause = Duration::from_secs(2u64.saturating_mul(failures.into()));
                    tokio::select! {
                        _ = cancel_rx.changed() => break,
                        _ = tokio::time::sleep(pause) => continue,
                    }
                }
            }
        }
        let Some(current) = session.clone() else {
            continue;
        };

        housekeeping(&wctx, &scale_set).await;

        let poll = wctx
            .api
            .get_message(&current, scale_set.last_message_id, wctx.config.long_poll);
        let result = tokio::select! {
            _ = cancel_rx.changed() => break,
            r = poll => r,
        };

        match result {
            Ok(None) => {}
            Ok(Some(message)) => {
                failures = 0;
                apply_message(&wctx, &scale_set, &current, &message).await;
            }
            Err(e) if e.is_session_error() => {
                debug!(scale_set = scale_set.id, "session invalid ({e}), re-acquiring");
                let _ = wctx.store.set_scale_set_session(scale_set.id, None);
                session = None;
            }
            Err(e) => {
                failures += 1;
                warn!(scale_set = scale_set.id, "message poll failed: {e}");
                if failures >= wctx.config.max_session_failures {
                    fail_scale_set(&wctx, &scale_set, &e.to_string());
                    break;
                }
                let pause = Duration::from_secs(2u64.saturating_mul(failures.into()));
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    if let Some(s) = session {
        if let Err(e) = wctx.api.delete_session(&s).await {
            debug!(scale_set = scale_set_id, "session release failed: {e}");
        }
        let _ = wctx.store.set_scale_set_session(scale_set_id, None);
    }
}

fn fail_scale_set(wctx: &WorkerCtx, scale_set: &ScaleSet, reason: &str) {
    let reason = format!("scale set {} failed: {reason}", scale_set.name);
    error!(scale_set = scale_set.id, "{reason}");
    wctx.store
        .record_entity_event(wctx.entity_id, EventLevel::Error, reason.clone());
    let _ = wctx
        .store
        .set_pool_manager_status(wctx.entity_id, PoolManagerStatus::failed(reason));
    if let Ok(entity) = wctx.store.get_entity(wctx.entity_id) {
        wctx.bus
            .publish(ChangeEvent::new(Operation::Update, EventPayload::Entity(entity)));
    }
}

/// Between polls: process pending deletes and keep warm capacity.
async fn housekeeping(wctx: &WorkerCtx, scale_set: &ScaleSet) {
    process_deletes(wctx, scale_set.id, false).await;

    let instances = wctx.store.list_scale_set_instances(scale_set.id);
    // An errored instance means the provider is unhappy; stop topping up
    // until the reconciler has cleaned the error out.
    if instances
        .iter()
        .any(|i| i.status == InstanceStatus::Error)
    {
        return;
    }
    let live = instances.iter().filter(|i| i.status.is_live()).count();
    let idle_or_coming = instances.iter().filter(|i| is_idle_or_coming(i)).count();
    let min_idle = scale_set.min_idle_runners as usize;
    let max = scale_set.max_runners as usize;
    if idle_or_coming >= min_idle || live >= max {
        return;
    }
    let deficit = (min_idle - idle_or_coming).min(max - live);
    for _ in 0..deficit {
        create_instance(wctx, scale_set).await;
    }
}

async fn apply_message(
    wctx: &WorkerCtx,
    scale_set: &ScaleSet,
    session: &ScaleSetSession,
    message: &ScaleSetMessage,
) {
    debug!(
        scale_set = scale_set.id,
        message = message.message_id,
        kind = %message.message_type,
        "applying scale set message"
    );

    // Acquire what fits under max; the service may hand some jobs to
    // another scaler, so only the acquired ids scale up.
    if !message.body.jobs_available.is_empty() {
        let instances = wctx.store.list_scale_set_instances(scale_set.id);
        let live = instances.iter().filter(|i| i.status.is_live()).count();
        let idle = instances.iter().filter(|i| i.is_idle_runner()).count();
        let capacity = (scale_set.max_runners as usize).saturating_sub(live);
        let wanted = message
            .body
            .jobs_available
            .len()
            .saturating_sub(idle)
            .min(capacity);
        if wanted > 0 {
            let ids: Vec<i64> = message
                .body
                .jobs_available
                .iter()
                .take(wanted)
                .map(|j| j.runner_request_id)
                .collect();
            match wctx.api.acquire_jobs(session, scale_set.id, &ids).await {
                Ok(acquired) => {
                    for _ in 0..acquired.len() {
                        create_instance(wctx, scale_set).await;
                    }
                }
                Err(e) => warn!(scale_set = scale_set.id, "acquire jobs failed: {e}"),
            }
        }
    }

    for job in &message.body.jobs_started {
        let Some(runner_name) = job.runner_name.as_deref() else {
            continue;
        };
        if let Ok(instance) = wctx.store.get_instance(runner_name) {
            let folded = apply_runner_status(instance.runner_status, RunnerStatus::Active);
            if folded != instance.runner_status {
                let _ = wctx
                    .store
                    .set_instance_runner_status(&instance.name, folded);
            }
            if let (Some(agent_id), None) = (job.agent_id, instance.agent_id) {
                let _ = wctx.store.set_instance_agent_id(&instance.name, agent_id);
            }
        }
    }

    for job in &message.body.jobs_completed {
        let Some(runner_name) = job.runner_name.as_deref() else {
            continue;
        };
        if let Ok(instance) = wctx.store.get_instance(runner_name) {
            let folded = apply_runner_status(instance.runner_status, RunnerStatus::Terminated);
            if folded != instance.runner_status {
                let _ = wctx
                    .store
                    .set_instance_runner_status(&instance.name, folded);
            }
            if let Ok(next) = next_status(instance.status, LifecycleEvent::RequestDelete) {
                if next != instance.status {
                    let _ = wctx.store.set_instance_status(&instance.name, next, None);
                }
            }
        }
    }

    // Advance the high-water mark before acking so a crash between the two
    // redelivers (apply is idempotent) rather than skips.
    let _ = wctx
        .store
        .set_scale_set_last_message_id(scale_set.id, message.message_id);
    if let Err(e) = wctx.api.ack_message(session, message.message_id).await {
        warn!(scale_set = scale_set.id, "ack failed: {e}");
    }
}

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

/// Create one scale-set instance: record, JIT material, bootstrap, provider.
async fn create_instance(wctx: &WorkerCtx, scale_set: &ScaleSet) {
    let name = format!("{}-{}", scale_set.runner_prefix, Uuid::new_v4());
    let now = Utc::now();
    let instance = Instance {
        id: Uuid::new_v4(),
        name: name.clone(),
        provider_id: None,
        parent: InstanceParent::ScaleSet(scale_set.id),
        entity_id: scale_set.entity_id,
        provider_name: scale_set.provider_name.clone(),
        os_type: scale_set.os_type,
        os_arch: scale_set.os_arch,
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
    if let Err(e) = wctx.store.create_instance(instance.clone()) {
        error!(scale_set = scale_set.id, "cannot record instance: {e}");
        return;
    }
    wctx.bus.publish(ChangeEvent::new(
        Operation::Create,
        EventPayload::Instance(instance.clone()),
    ));

    match provision(wctx, scale_set, &instance).await {
        Ok(()) => {
            if let Ok(updated) = wctx.store.get_instance(&name) {
                wctx.bus.publish(ChangeEvent::new(
                    Operation::Update,
                    EventPayload::Instance(updated),
                ));
            }
        }
        Err(message) => {
            warn!(instance = %name, "scale set create failed: {message}");
            let _ = wctx
                .store
                .record_creation_attempt(&name, Some(message.clone()));
            let _ = wctx.store.set_instance_status(
                &name,
                InstanceStatus::Error,
                Some(StatusMessage {
                    created_at: Utc::now(),
                    level: EventLevel::Error,
                    message,
                }),
            );
        }
    }
}

async fn provision(
    wctx: &WorkerCtx,
    scale_set: &ScaleSet,
    instance: &Instance,
) -> Result<(), String> {
    let next =
        next_status(instance.status, LifecycleEvent::PickUp).map_err(|e| e.to_string())?;
    wctx.store
        .set_instance_status(&instance.name, next, None)
        .map_err(|e| e.to_string())?;

    let forge = wctx
        .forge_client()
        .ok_or_else(|| "no forge client available".to_string())?;

    let tools = match wctx.cache.get_tools(scale_set.entity_id) {
        Some(tools) => tools,
        None => {
            let tools = forge
                .list_runner_applications()
                .await
                .map_err(|e| e.to_string())?;
            wctx.cache.set_tools(scale_set.entity_id, tools.clone());
            tools
        }
    };

    let runner_labels = vec![labels::controller_label(wctx.ctx.controller_id())];
    // Scale set runners always register through JIT material.
    let (files, runner) = forge
        .get_jit_config(&instance.name, &runner_labels, &scale_set.runner_group)
        .await
        .map_err(|e| e.to_string())?;
    wctx.store
        .set_instance_jit_config(&instance.name, files)
        .map_err(|e| e.to_string())?;
    wctx.store
        .set_instance_agent_id(&instance.name, runner.id)
        .map_err(|e| e.to_string())?;

    let urls = wctx.ctx.urls();
    let bootstrap = BootstrapInstance {
        name: instance.name.clone(),
        tools,
        forge_url: forge.forge_url(),
        callback_url: urls.callback_url,
        metadata_url: urls.metadata_url,
        instance_token: instance.callback_token.clone(),
        ssh_keys: vec![],
        extra_specs: scale_set.extra_specs.clone(),
        labels: runner_labels,
        pool_id: scale_set.local_id.to_string(),
        flavor: scale_set.flavor.clone(),
        image: scale_set.image.clone(),
        os_type: scale_set.os_type,
        os_arch: scale_set.os_arch,
        runner_group: scale_set.runner_group.clone(),
        ca_cert_bundle: None,
        jit_config_enabled: true,
    };

    let created = wctx
        .dispatcher
        .create_instance(&scale_set.provider_name, &bootstrap)
        .await
        .map_err(|e| e.to_string())?;
    wctx.store
        .set_instance_provider_info(&instance.name, created.provider_id, created.addresses)
        .map_err(|e| e.to_string())?;
    let running = next_status(InstanceStatus::Creating, LifecycleEvent::ProviderCreated)
        .map_err(|e| e.to_string())?;
    wctx.store
        .set_instance_status(&instance.name, running, None)
        .map_err(|e| e.to_string())?;
    info!(instance = %instance.name, scale_set = scale_set.id, "scale set instance running");
    Ok(())
}

/// Drive `pending_delete` instances of one scale set to deletion.
async fn process_deletes(wctx: &WorkerCtx, scale_set_id: i64, force_all: bool) {
    for instance in wctx.store.list_scale_set_instances(scale_set_id) {
        let force = force_all
            || matches!(instance.status, InstanceStatus::PendingForceDelete);
        if !matches!(
            instance.status,
            InstanceStatus::PendingDelete | InstanceStatus::PendingForceDelete
        ) {
            continue;
        }
        if let Ok(next) = next_status(instance.status, LifecycleEvent::DeleteStarted) {
            let _ = wctx.store.set_instance_status(&instance.name, next, None);
        }

        if !force {
            if let Some(agent_id) = instance.agent_id {
                if let Some(forge) = wctx.forge_client() {
                    match forge.remove_runner(agent_id).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            warn!(instance = %instance.name, "deregistration failed: {e}");
                            let _ = wctx.store.set_instance_status(
                                &instance.name,
                                InstanceStatus::PendingDelete,
                                None,
                            );
                            continue;
                        }
                    }
                }
            }
        }

        match wctx
            .dispatcher
            .delete_instance(&instance.provider_name, &instance.name)
            .await
        {
            Ok(()) => {
                let mut record = instance.clone();
                record.status = InstanceStatus::Deleted;
                let _ = wctx.store.delete_instance(&instance.name);
                wctx.dispatcher.forget_instance(&instance.name);
                wctx.bus.publish(ChangeEvent::new(
                    Operation::Delete,
                    EventPayload::Instance(record),
                ));
            }
            Err(e) => {
                warn!(instance = %instance.name, "provider delete failed: {e}");
                let _ = wctx.store.set_instance_status(
                    &instance.name,
                    InstanceStatus::PendingDelete,
                    None,
                );
            }
        }
    }
}

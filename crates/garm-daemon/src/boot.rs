//! Controller assembly and lifecycle.
//!
//! Boot order: config → store → controller context → bus + cache →
//! dispatcher → forge factory → per-entity managers → reconciler → intake.
//! Shutdown reverses it: cancel managers (which drain their in-flight
//! dispatches within the grace window), stop the reconciler, drop the
//! intake.

use std::sync::Arc;

use anyhow::Result;
use garm_config::GarmConfig;
use garm_events::{
    spawn_invalidator, BusEvent, Cache, ChangeEvent, ControllerContext, ControllerUrls,
    EntityType, EventBus, EventFilter, EventPayload, Operation,
};
use garm_forge::{ForgeClientProvider, HttpForgeFactory};
use garm_pool::{start_pool_manager, CreateBackoff, PoolManagerConfig, PoolManagerParams};
use garm_provider::{Dispatcher, ExternalProvider, Provider};
use garm_reconcile::{start_reconciler, ReconcilerConfig, ReconcilerHandle, ReconcilerParams};
use garm_scaleset::{
    start_scale_set_coordinator, HttpScaleSetApi, ScaleSetCoordinatorConfig,
    ScaleSetCoordinatorParams,
};
use garm_store::Store;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::{AppState, BuildInfo};

pub struct Controller {
    pub state: Arc<AppState>,
    reconciler: Option<ReconcilerHandle>,
    registry_cancel: watch::Sender<bool>,
    registry_join: tokio::task::JoinHandle<()>,
}

/// Assemble the controller from configuration and a store implementation.
pub async fn boot(config: &GarmConfig, store: Arc<dyn Store>) -> Result<Controller> {
    let controller_id = store.controller_id();
    info!(%controller_id, "controller booting");

    let ctx = Arc::new(ControllerContext::new(
        controller_id,
        ControllerUrls {
            metadata_url: config.controller.metadata_url.clone(),
            callback_url: config.controller.callback_url.clone(),
            webhook_url: config.controller.webhook_url.clone(),
            agent_url: config.controller.agent_url.clone(),
            tools_url: config.controller.garm_tools_url.clone(),
        },
        config.minimum_job_age_backoff(),
    ));

    let bus = EventBus::default();
    let cache = Cache::new(Arc::clone(&store));
    spawn_invalidator(Arc::clone(&cache), bus.subscribe(EventFilter::any()));

    let providers: Vec<Arc<dyn Provider>> = config
        .providers
        .iter()
        .map(|p| {
            Arc::new(ExternalProvider::from_config(p, controller_id)) as Arc<dyn Provider>
        })
        .collect();
    let dispatcher = Arc::new(Dispatcher::new(
        providers,
        config.scheduling.max_concurrent_provider_ops,
    ));

    let forge_factory: Arc<dyn ForgeClientProvider> = Arc::new(HttpForgeFactory::default());

    let state = Arc::new(AppState {
        store,
        cache,
        bus,
        ctx,
        dispatcher,
        forge_factory,
        managers: Default::default(),
        coordinators: Default::default(),
        build: BuildInfo::default(),
    });

    // Managers for everything already in the store.
    let manager_config = manager_config(config);
    for entity in state.store.list_entities() {
        start_manager(&state, entity.id, &manager_config).await;
        start_coordinator_if_needed(&state, &entity).await;
    }

    let (registry_cancel, registry_join) =
        spawn_registry_watcher(Arc::clone(&state), manager_config.clone());

    let reconciler = start_reconciler(ReconcilerParams {
        store: Arc::clone(&state.store),
        cache: Arc::clone(&state.cache),
        dispatcher: Arc::clone(&state.dispatcher),
        forge_factory: Arc::clone(&state.forge_factory),
        ctx: Arc::clone(&state.ctx),
        config: ReconcilerConfig {
            interval: config.reconcile_interval(),
        },
    });

    Ok(Controller {
        state,
        reconciler: Some(reconciler),
        registry_cancel,
        registry_join,
    })
}

fn manager_config(config: &GarmConfig) -> PoolManagerConfig {
    PoolManagerConfig {
        tick_interval: config.pool_tick(),
        shutdown_grace: config.shutdown_grace(),
        backoff: CreateBackoff::default(),
    }
}

async fn start_manager(state: &Arc<AppState>, entity_id: Uuid, config: &PoolManagerConfig) {
    let mut managers = state.managers.write().await;
    if managers.contains_key(&entity_id) {
        return;
    }
    let handle = start_pool_manager(PoolManagerParams {
        entity_id,
        store: Arc::clone(&state.store),
        cache: Arc::clone(&state.cache),
        bus: state.bus.clone(),
        dispatcher: Arc::clone(&state.dispatcher),
        forge_factory: Arc::clone(&state.forge_factory),
        ctx: Arc::clone(&state.ctx),
        config: config.clone(),
    });
    managers.insert(entity_id, handle);
}

/// Scale sets are GitHub-only and session management authenticates with a
/// PAT; entities that do not qualify simply get no coordinator.
async fn start_coordinator_if_needed(state: &Arc<AppState>, entity: &garm_schemas::ForgeEntity) {
    if state.store.list_entity_scale_sets(entity.id).is_empty() {
        return;
    }
    let mut coordinators = state.coordinators.write().await;
    if coordinators.contains_key(&entity.id) {
        return;
    }
    let creds = match state.store.get_credentials(&entity.credentials_name) {
        Ok(c) => c,
        Err(e) => {
            warn!(entity = %entity.forge_path(), "no credentials for scale sets: {e}");
            return;
        }
    };
    if creds.endpoint.kind != garm_schemas::ForgeKind::Github {
        warn!(entity = %entity.forge_path(), "scale sets are GitHub-only, skipping");
        return;
    }
    let api = match HttpScaleSetApi::from_credentials(&creds) {
        Ok(api) => Arc::new(api) as Arc<dyn garm_scaleset::ScaleSetApi>,
        Err(e) => {
            warn!(entity = %entity.forge_path(), "cannot build scale set client: {e}");
            return;
        }
    };
    let handle = start_scale_set_coordinator(ScaleSetCoordinatorParams {
        entity_id: entity.id,
        store: Arc::clone(&state.store),
        cache: Arc::clone(&state.cache),
        bus: state.bus.clone(),
        dispatcher: Arc::clone(&state.dispatcher),
        forge_factory: Arc::clone(&state.forge_factory),
        api,
        ctx: Arc::clone(&state.ctx),
        config: ScaleSetCoordinatorConfig::default(),
    });
    coordinators.insert(entity.id, handle);
}

/// Start/stop managers as entities come and go.
fn spawn_registry_watcher(
    state: Arc<AppState>,
    manager_config: PoolManagerConfig,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let mut sub = state.bus.subscribe(
        EventFilter::any()
            .entity_types([EntityType::Entity])
            .operations([Operation::Create, Operation::Delete]),
    );
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                event = sub.next() => {
                    match event {
                        Some(BusEvent::Change(ChangeEvent {
                            operation: Operation::Create,
                            payload: EventPayload::Entity(entity),
                        })) => {
                            info!(entity = %entity.forge_path(), "starting pool manager");
                            start_manager(&state, entity.id, &manager_config).await;
                            start_coordinator_if_needed(&state, &entity).await;
                        }
                        Some(BusEvent::Change(ChangeEvent {
                            operation: Operation::Delete,
                            payload: EventPayload::Entity(_),
                        })) => {
                            // The manager drains itself on the same event;
                            // just sweep the finished handle.
                            state.sweep_finished().await;
                        }
                        Some(BusEvent::Change(_)) => {}
                        Some(BusEvent::Lagged(_)) => {
                            // Resync: make sure every stored entity has a
                            // manager.
                            for entity in state.store.list_entities() {
                                start_manager(&state, entity.id, &manager_config).await;
                            }
                            state.sweep_finished().await;
                        }
                        None => break,
                    }
                }
            }
        }
    });
    (cancel_tx, join)
}

impl Controller {
    /// Graceful shutdown: managers first (they drain in-flight provider
    /// work), then the reconciler and registry watcher.
    pub async fn shutdown(mut self) {
        info!("controller shutting down");
        let managers: Vec<_> = {
            let mut map = self.state.managers.write().await;
            map.drain().map(|(_, h)| h).collect()
        };
        for handle in managers {
            handle.shutdown().await;
        }
        let coordinators: Vec<_> = {
            let mut map = self.state.coordinators.write().await;
            map.drain().map(|(_, h)| h).collect()
        };
        for handle in coordinators {
            handle.shutdown().await;
        }
        if let Some(reconciler) = self.reconciler.take() {
            reconciler.shutdown().await;
        }
        let _ = self.registry_cancel.send(true);
        let _ = self.registry_join.await;
        info!("controller stopped");
    }
}


//! Periodic reconciliation driver.
//!
//! Every interval, for each pool and scale set: gather the three views,
//! diff them with the pure engine, and converge — stale records to
//! `pending_delete`, provider orphans deleted at the provider, labelled
//! forge orphans deregistered. Creation is never the reconciler's job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use garm_events::{Cache, ControllerContext};
use garm_forge::{ForgeClient, ForgeClientProvider, ForgeRunner};
use garm_pool::{next_status, LifecycleEvent};
use garm_provider::Dispatcher;
use garm_schemas::{EventLevel, ForgeEntity, InstanceStatus, StatusMessage};
use garm_store::Store;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::{is_clean, reconcile, ReconcileInput, ReconcileReport};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
        }
    }
}

pub struct ReconcilerParams {
    pub store: Arc<dyn Store>,
    pub cache: Arc<Cache>,
    pub dispatcher: Arc<Dispatcher>,
    pub forge_factory: Arc<dyn ForgeClientProvider>,
    pub ctx: Arc<ControllerContext>,
    pub config: ReconcilerConfig,
}

pub struct ReconcilerHandle {
    cancel: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.join.await;
    }
}

pub fn start_reconciler(params: ReconcilerParams) -> ReconcilerHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(params.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so managers settle first.
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    run_pass(&params).await;
                }
            }
        }
        info!("reconciler stopped");
    });
    ReconcilerHandle {
        cancel: cancel_tx,
        join,
    }
}

/// One reconciliation pass over every pool and scale set.
pub async fn run_pass(params: &ReconcilerParams) {
    for entity in params.store.list_entities() {
        let Some(forge) = forge_client(params, &entity) else {
            continue;
        };
        let forge_runners = match forge.list_runners().await {
            Ok(runners) => runners,
            Err(e) => {
                warn!(entity = %entity.forge_path(), "reconciler cannot list forge runners: {e}");
                continue;
            }
        };

        for pool in params.store.list_entity_pools(entity.id) {
            let recorded = params.store.list_pool_instances(pool.id);
            let observed = match params
                .dispatcher
                .list_instances(&pool.provider_name, pool.id)
                .await
            {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(pool = %pool.id, "reconciler cannot list provider instances: {e}");
                    continue;
                }
            };
            let report = reconcile(&ReconcileInput {
                recorded: &recorded,
                provider_observed: &observed,
                forge_runners: &forge_runners,
                controller_id: params.ctx.controller_id(),
                bootstrap_timeout: pool.bootstrap_timeout(),
                now: Utc::now(),
            });
            apply_report(params, &entity, &pool.provider_name, forge.as_ref(), &report).await;
        }

        for scale_set in params.store.list_entity_scale_sets(entity.id) {
            let recorded = params.store.list_scale_set_instances(scale_set.id);
            let observed = match params
                .dispatcher
                .list_instances(&scale_set.provider_name, scale_set.local_id)
                .await
            {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(scale_set = scale_set.id, "reconciler cannot list provider instances: {e}");
                    continue;
                }
            };
            let report = reconcile(&ReconcileInput {
                recorded: &recorded,
                provider_observed: &observed,
                forge_runners: &forge_runners,
                controller_id: params.ctx.controller_id(),
                bootstrap_timeout: chrono::Duration::minutes(20),
                now: Utc::now(),
            });
            apply_report(
                params,
                &entity,
                &scale_set.provider_name,
                forge.as_ref(),
                &report,
            )
            .await;
        }
    }
}

fn forge_client(
    params: &ReconcilerParams,
    entity: &ForgeEntity,
) -> Option<Arc<dyn ForgeClient>> {
    let creds = params.cache.get_credentials(&entity.credentials_name).ok()?;
    params.forge_factory.client_for(entity, &creds).ok()
}

async fn apply_report(
    params: &ReconcilerParams,
    entity: &ForgeEntity,
    provider_name: &str,
    forge: &dyn ForgeClient,
    report: &ReconcileReport,
) {
    if is_clean(report) {
        debug!(
            entity = %entity.forge_path(),
            in_sync = report.in_sync,
            "reconcile clean"
        );
        return;
    }
    info!(
        entity = %entity.forge_path(),
        stale = report.stale_recorded.len(),
        provider_orphans = report.provider_orphans.len(),
        forge_orphans = report.forge_orphans.len(),
        in_sync = report.in_sync,
        "reconcile divergence"
    );

    for name in &report.stale_recorded {
        let Ok(instance) = params.store.get_instance(name) else {
            continue;
        };
        match next_status(instance.status, LifecycleEvent::RequestDelete) {
            Ok(next) => {
                let _ = params.store.set_instance_status(
                    name,
                    next,
                    Some(StatusMessage {
                        created_at: Utc::now(),
                        level: EventLevel::Warning,
                        message: "reconciler: provider does not know this instance".to_string(),
                    }),
                );
                params.store.record_entity_event(
                    entity.id,
                    EventLevel::Warning,
                    format!("reconciler scheduled {name} for deletion (lost at provider)"),
                );
            }
            Err(e) => debug!(instance = %name, "reconciler skip: {e}"),
        }
    }

    for name in &report.provider_orphans {
        match params.dispatcher.delete_instance(provider_name, name).await {
            Ok(()) => {
                params.store.record_entity_event(
                    entity.id,
                    EventLevel::Warning,
                    format!("reconciler deleted provider orphan {name}"),
                );
            }
            Err(e) => warn!(instance = %name, "orphan delete failed: {e}"),
        }
    }

    for agent_id in &report.forge_orphans {
        match forge.remove_runner(*agent_id).await {
            Ok(()) => {
                params.store.record_entity_event(
                    entity.id,
                    EventLevel::Warning,
                    format!("reconciler deregistered orphan runner {agent_id}"),
                );
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(agent = agent_id, "orphan deregistration failed: {e}"),
        }
    }
}

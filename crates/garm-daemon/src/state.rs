//! Shared runtime state for garm-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The manager registry
//! is the only mutable piece; everything else is `Arc`-shared and internally
//! synchronized.

use std::collections::HashMap;
use std::sync::Arc;

use garm_events::{Cache, ControllerContext, EventBus};
use garm_forge::ForgeClientProvider;
use garm_pool::PoolManagerHandle;
use garm_provider::Dispatcher;
use garm_scaleset::ScaleSetCoordinatorHandle;
use garm_store::Store;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            service: "garm-daemon",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Cloneable (Arc) handle shared across all Axum handlers and the registry
/// watcher.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cache: Arc<Cache>,
    pub bus: EventBus,
    pub ctx: Arc<ControllerContext>,
    pub dispatcher: Arc<Dispatcher>,
    pub forge_factory: Arc<dyn ForgeClientProvider>,
    /// Per-entity pool managers, keyed by entity id.
    pub managers: RwLock<HashMap<Uuid, PoolManagerHandle>>,
    /// Per-entity scale-set coordinators.
    pub coordinators: RwLock<HashMap<Uuid, ScaleSetCoordinatorHandle>>,
    pub build: BuildInfo,
}

impl AppState {
    /// Remove registry entries whose task has already finished (an entity
    /// delete drains its own manager).
    pub async fn sweep_finished(&self) {
        self.managers.write().await.retain(|_, h| !h.is_finished());
        self.coordinators
            .write()
            .await
            .retain(|_, h| !h.is_finished());
    }
}

//! Read-through cache over the store.
//!
//! Services the hot paths (webhook routing, dispatch) without a store
//! round-trip. Invalidation is event-driven — no TTL: the invalidator task
//! applies every bus event to the cached maps, and a lagged bus receiver
//! clears the whole cache so the next read repopulates from the store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use garm_schemas::{ForgeCredentials, ForgeEntity, Pool, RunnerApplication, ScaleSet};
use garm_store::{Store, StoreResult};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::{BusEvent, ChangeEvent, EventPayload, EventSubscriber, Operation};

#[derive(Clone)]
struct ToolsEntry {
    tools: Vec<RunnerApplication>,
    fetched_at: DateTime<Utc>,
}

pub struct Cache {
    store: Arc<dyn Store>,
    entities: RwLock<HashMap<Uuid, ForgeEntity>>,
    credentials: RwLock<HashMap<String, ForgeCredentials>>,
    pools: RwLock<HashMap<Uuid, Pool>>,
    scale_sets: RwLock<HashMap<i64, ScaleSet>>,
    tools: RwLock<HashMap<Uuid, ToolsEntry>>,
}

impl Cache {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            entities: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            scale_sets: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
        })
    }

    // -- read-through lookups ----------------------------------------------

    pub fn get_entity(&self, id: Uuid) -> StoreResult<ForgeEntity> {
        if let Some(hit) = self.entities.read().unwrap_or_else(|e| e.into_inner()).get(&id) {
            return Ok(hit.clone());
        }
        let entity = self.store.get_entity(id)?;
        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entity.clone());
        Ok(entity)
    }

    pub fn get_credentials(&self, name: &str) -> StoreResult<ForgeCredentials> {
        if let Some(hit) = self
            .credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Ok(hit.clone());
        }
        let creds = self.store.get_credentials(name)?;
        self.credentials
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), creds.clone());
        Ok(creds)
    }

    pub fn get_pool(&self, id: Uuid) -> StoreResult<Pool> {
        if let Some(hit) = self.pools.read().unwrap_or_else(|e| e.into_inner()).get(&id) {
            return Ok(hit.clone());
        }
        let pool = self.store.get_pool(id)?;
        self.pools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, pool.clone());
        Ok(pool)
    }

    pub fn get_scale_set(&self, id: i64) -> StoreResult<ScaleSet> {
        if let Some(hit) = self
            .scale_sets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            return Ok(hit.clone());
        }
        let scale_set = self.store.get_scale_set(id)?;
        self.scale_sets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, scale_set.clone());
        Ok(scale_set)
    }

    // -- tools manifest ------------------------------------------------------

    pub fn set_tools(&self, entity_id: Uuid, tools: Vec<RunnerApplication>) {
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                entity_id,
                ToolsEntry {
                    tools,
                    fetched_at: Utc::now(),
                },
            );
    }

    pub fn get_tools(&self, entity_id: Uuid) -> Option<Vec<RunnerApplication>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&entity_id)
            .map(|e| e.tools.clone())
    }

    pub fn tools_age(&self, entity_id: Uuid) -> Option<chrono::Duration> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&entity_id)
            .map(|e| Utc::now() - e.fetched_at)
    }

    // -- invalidation --------------------------------------------------------

    /// Apply one mutation event. Updates refresh the cached copy in place;
    /// deletes evict.
    pub fn apply(&self, event: &ChangeEvent) {
        match (&event.payload, event.operation) {
            (EventPayload::Entity(e), Operation::Delete) => {
                self.entities
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&e.id);
                self.tools
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&e.id);
            }
            (EventPayload::Entity(e), _) => {
                self.entities
                    .write()
                    .unwrap_or_else(|er| er.into_inner())
                    .insert(e.id, e.clone());
            }
            (EventPayload::Credentials(c), Operation::Delete) => {
                self.credentials
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&c.name);
            }
            (EventPayload::Credentials(c), _) => {
                self.credentials
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(c.name.clone(), c.clone());
            }
            (EventPayload::Pool(p), Operation::Delete) => {
                self.pools
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&p.id);
            }
            (EventPayload::Pool(p), _) => {
                self.pools
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(p.id, p.clone());
            }
            (EventPayload::ScaleSet(s), Operation::Delete) => {
                self.scale_sets
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&s.id);
            }
            (EventPayload::ScaleSet(s), _) => {
                self.scale_sets
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(s.id, s.clone());
            }
            // Instances and templates are not cached here.
            (EventPayload::Instance(_) | EventPayload::Template(_) | EventPayload::Endpoint(_), _) => {}
        }
    }

    /// Drop everything; next reads repopulate from the store.
    pub fn clear(&self) {
        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.credentials
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.pools.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.scale_sets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Drive cache invalidation from a bus subscription.
pub fn spawn_invalidator(cache: Arc<Cache>, mut sub: EventSubscriber) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = sub.next().await {
            match event {
                BusEvent::Change(ev) => cache.apply(&ev),
                BusEvent::Lagged(skipped) => {
                    debug!("cache invalidator lagged by {skipped} events, clearing");
                    cache.clear();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use garm_schemas::{
        AuthKind, EntityKind, ForgeEndpoint, ForgeKind, PatCredentials, PoolBalancerType,
        PoolManagerStatus,
    };
    use garm_store::MemoryStore;

    fn seeded_store() -> (Arc<MemoryStore>, ForgeEntity) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_endpoint(ForgeEndpoint {
                name: "github.com".into(),
                description: String::new(),
                kind: ForgeKind::Github,
                base_url: "https://github.com".into(),
                api_base_url: "https://api.github.com".into(),
                upload_base_url: None,
                ca_cert_bundle: None,
            })
            .unwrap();
        store
            .create_credentials(ForgeCredentials {
                id: 0,
                name: "c1".into(),
                description: String::new(),
                endpoint: store.get_endpoint("github.com").unwrap(),
                auth_kind: AuthKind::Pat,
                pat: Some(PatCredentials {
                    token: "t".into(),
                }),
                app: None,
            })
            .unwrap();
        let entity = ForgeEntity {
            id: Uuid::new_v4(),
            kind: EntityKind::Repository,
            owner: "acme".into(),
            name: Some("svc".into()),
            credentials_name: "c1".into(),
            endpoint_name: "github.com".into(),
            webhook_secret: "s".into(),
            balancer: PoolBalancerType::RoundRobin,
            pool_manager_status: PoolManagerStatus::default(),
        };
        store.create_entity(entity.clone()).unwrap();
        (store, entity)
    }

    #[test]
    fn read_through_populates() {
        let (store, entity) = seeded_store();
        let cache = Cache::new(store);
        assert_eq!(cache.get_entity(entity.id).unwrap().owner, "acme");
        // Second read is served from cache (same value).
        assert_eq!(cache.get_entity(entity.id).unwrap().id, entity.id);
    }

    #[test]
    fn update_event_refreshes_cached_copy() {
        let (store, mut entity) = seeded_store();
        let cache = Cache::new(store);
        cache.get_entity(entity.id).unwrap();

        entity.webhook_secret = "rotated".into();
        cache.apply(&ChangeEvent::new(
            Operation::Update,
            EventPayload::Entity(entity.clone()),
        ));
        assert_eq!(cache.get_entity(entity.id).unwrap().webhook_secret, "rotated");
    }

    #[test]
    fn delete_event_evicts() {
        let (store, entity) = seeded_store();
        let cache = Cache::new(Arc::clone(&store) as Arc<dyn Store>);
        cache.get_entity(entity.id).unwrap();
        cache.apply(&ChangeEvent::new(
            Operation::Delete,
            EventPayload::Entity(entity.clone()),
        ));
        store.delete_entity(entity.id).unwrap();
        assert!(cache.get_entity(entity.id).is_err());
    }

    #[test]
    fn tools_cache_round_trip() {
        let (store, entity) = seeded_store();
        let cache = Cache::new(store);
        assert!(cache.get_tools(entity.id).is_none());
        cache.set_tools(
            entity.id,
            vec![RunnerApplication {
                os: "linux".into(),
                architecture: "x64".into(),
                download_url: "https://example/tools.tgz".into(),
                filename: "tools.tgz".into(),
                sha256_checksum: None,
                temp_download_token: None,
            }],
        );
        assert_eq!(cache.get_tools(entity.id).unwrap().len(), 1);
    }
}

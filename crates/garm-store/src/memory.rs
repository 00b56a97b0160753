//! In-memory [`Store`] implementation.
//!
//! Backs the daemon and every test harness. A single `RwLock` over the whole
//! record set gives the serializable isolation the orchestrator's critical
//! entity + pool + instance updates expect.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::Utc;
use garm_schemas::{
    Address, EventLevel, ForgeCredentials, ForgeEndpoint, ForgeEntity, Instance, InstanceParent,
    InstanceStatus, Pool, PoolManagerStatus, RunnerStatus, ScaleSet, StatusMessage, Template,
};
use uuid::Uuid;

use crate::{EntityEvent, Store, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    controller_id: Option<Uuid>,
    endpoints: BTreeMap<String, ForgeEndpoint>,
    credentials: BTreeMap<String, ForgeCredentials>,
    next_credentials_id: i64,
    entities: BTreeMap<Uuid, ForgeEntity>,
    pools: BTreeMap<Uuid, Pool>,
    scale_sets: BTreeMap<i64, ScaleSet>,
    /// Keyed by instance name (unique).
    instances: BTreeMap<String, Instance>,
    templates: BTreeMap<i64, Template>,
    next_template_id: i64,
    entity_events: BTreeMap<Uuid, Vec<EntityEvent>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn with_instance<R>(
    inner: &mut Inner,
    name: &str,
    f: impl FnOnce(&mut Instance) -> R,
) -> StoreResult<R> {
    let instance = inner
        .instances
        .get_mut(name)
        .ok_or_else(|| StoreError::NotFound(format!("instance {name}")))?;
    let out = f(instance);
    instance.updated_at = Utc::now();
    Ok(out)
}

impl Store for MemoryStore {
    // -- controller ---------------------------------------------------------

    fn controller_id(&self) -> Uuid {
        let mut inner = self.write();
        *inner.controller_id.get_or_insert_with(Uuid::new_v4)
    }

    // -- endpoints ----------------------------------------------------------

    fn create_endpoint(&self, endpoint: ForgeEndpoint) -> StoreResult<()> {
        let mut inner = self.write();
        if inner.endpoints.contains_key(&endpoint.name) {
            return Err(StoreError::Conflict(format!(
                "endpoint {} already exists",
                endpoint.name
            )));
        }
        inner.endpoints.insert(endpoint.name.clone(), endpoint);
        Ok(())
    }

    fn get_endpoint(&self, name: &str) -> StoreResult<ForgeEndpoint> {
        self.read()
            .endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("endpoint {name}")))
    }

    fn list_endpoints(&self) -> Vec<ForgeEndpoint> {
        self.read().endpoints.values().cloned().collect()
    }

    // -- credentials --------------------------------------------------------

    fn create_credentials(&self, mut creds: ForgeCredentials) -> StoreResult<ForgeCredentials> {
        let mut inner = self.write();
        if inner.credentials.contains_key(&creds.name) {
            return Err(StoreError::Conflict(format!(
                "credentials {} already exist",
                creds.name
            )));
        }
        if !inner.endpoints.contains_key(&creds.endpoint.name) {
            return Err(StoreError::Invalid(format!(
                "credentials {} reference unknown endpoint {}",
                creds.name, creds.endpoint.name
            )));
        }
        inner.next_credentials_id += 1;
        creds.id = inner.next_credentials_id;
        inner.credentials.insert(creds.name.clone(), creds.clone());
        Ok(creds)
    }

    fn get_credentials(&self, name: &str) -> StoreResult<ForgeCredentials> {
        self.read()
            .credentials
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("credentials {name}")))
    }

    fn update_credentials(&self, creds: ForgeCredentials) -> StoreResult<()> {
        let mut inner = self.write();
        if !inner.credentials.contains_key(&creds.name) {
            return Err(StoreError::NotFound(format!("credentials {}", creds.name)));
        }
        inner.credentials.insert(creds.name.clone(), creds);
        Ok(())
    }

    fn delete_credentials(&self, name: &str) -> StoreResult<()> {
        let mut inner = self.write();
        if inner
            .entities
            .values()
            .any(|e| e.credentials_name == name)
        {
            return Err(StoreError::Conflict(format!(
                "credentials {name} are still referenced by an entity"
            )));
        }
        inner
            .credentials
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("credentials {name}")))
    }

    fn list_credentials(&self) -> Vec<ForgeCredentials> {
        self.read().credentials.values().cloned().collect()
    }

    // -- entities -----------------------------------------------------------

    fn create_entity(&self, entity: ForgeEntity) -> StoreResult<()> {
        let mut inner = self.write();
        let creds = inner
            .credentials
            .get(&entity.credentials_name)
            .ok_or_else(|| {
                StoreError::Invalid(format!(
                    "entity references unknown credentials {}",
                    entity.credentials_name
                ))
            })?;
        if creds.endpoint.name != entity.endpoint_name {
            return Err(StoreError::Invalid(format!(
                "credentials {} belong to endpoint {}, entity is on {}",
                entity.credentials_name, creds.endpoint.name, entity.endpoint_name
            )));
        }
        // (endpoint, owner, name) must be unique per entity kind.
        let duplicate = inner.entities.values().any(|e| {
            e.kind == entity.kind
                && e.endpoint_name == entity.endpoint_name
                && e.owner == entity.owner
                && e.name == entity.name
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "entity {} already exists on {}",
                entity.forge_path(),
                entity.endpoint_name
            )));
        }
        inner.entities.insert(entity.id, entity);
        Ok(())
    }

    fn get_entity(&self, id: Uuid) -> StoreResult<ForgeEntity> {
        self.read()
            .entities
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("entity {id}")))
    }

    fn find_entity_by_path(&self, path: &str) -> StoreResult<ForgeEntity> {
        self.read()
            .entities
            .values()
            .find(|e| e.forge_path().eq_ignore_ascii_case(path))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("entity for path {path}")))
    }

    fn update_entity(&self, entity: ForgeEntity) -> StoreResult<()> {
        let mut inner = self.write();
        if !inner.entities.contains_key(&entity.id) {
            return Err(StoreError::NotFound(format!("entity {}", entity.id)));
        }
        inner.entities.insert(entity.id, entity);
        Ok(())
    }

    fn delete_entity(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.write();
        inner
            .entities
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("entity {id}")))?;
        inner.pools.retain(|_, p| p.entity_id != id);
        inner.scale_sets.retain(|_, s| s.entity_id != id);
        Ok(())
    }

    fn list_entities(&self) -> Vec<ForgeEntity> {
        self.read().entities.values().cloned().collect()
    }

    fn set_pool_manager_status(&self, id: Uuid, status: PoolManagerStatus) -> StoreResult<()> {
        let mut inner = self.write();
        let entity = inner
            .entities
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("entity {id}")))?;
        entity.pool_manager_status = status;
        Ok(())
    }

    // -- pools --------------------------------------------------------------

    fn create_pool(&self, pool: Pool) -> StoreResult<()> {
        pool.validate().map_err(StoreError::Invalid)?;
        let mut inner = self.write();
        if !inner.entities.contains_key(&pool.entity_id) {
            return Err(StoreError::Invalid(format!(
                "pool references unknown entity {}",
                pool.entity_id
            )));
        }
        if inner.pools.contains_key(&pool.id) {
            return Err(StoreError::Conflict(format!("pool {} already exists", pool.id)));
        }
        inner.pools.insert(pool.id, pool);
        Ok(())
    }

    fn get_pool(&self, id: Uuid) -> StoreResult<Pool> {
        self.read()
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("pool {id}")))
    }

    fn update_pool(&self, mut pool: Pool) -> StoreResult<()> {
        pool.validate().map_err(StoreError::Invalid)?;
        let mut inner = self.write();
        if !inner.pools.contains_key(&pool.id) {
            return Err(StoreError::NotFound(format!("pool {}", pool.id)));
        }
        pool.updated_at = Utc::now();
        inner.pools.insert(pool.id, pool);
        Ok(())
    }

    fn delete_pool(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.write();
        inner
            .pools
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("pool {id}")))
    }

    fn list_entity_pools(&self, entity_id: Uuid) -> Vec<Pool> {
        self.read()
            .pools
            .values()
            .filter(|p| p.entity_id == entity_id)
            .cloned()
            .collect()
    }

    fn list_all_pools(&self) -> Vec<Pool> {
        self.read().pools.values().cloned().collect()
    }

    fn set_pool_failure_reason(&self, id: Uuid, reason: Option<String>) -> StoreResult<()> {
        let mut inner = self.write();
        let pool = inner
            .pools
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("pool {id}")))?;
        pool.failure_reason = reason;
        pool.updated_at = Utc::now();
        Ok(())
    }

    // -- scale sets ---------------------------------------------------------

    fn create_scale_set(&self, scale_set: ScaleSet) -> StoreResult<()> {
        scale_set.validate().map_err(StoreError::Invalid)?;
        let mut inner = self.write();
        if !inner.entities.contains_key(&scale_set.entity_id) {
            return Err(StoreError::Invalid(format!(
                "scale set references unknown entity {}",
                scale_set.entity_id
            )));
        }
        if inner.scale_sets.contains_key(&scale_set.id) {
            return Err(StoreError::Conflict(format!(
                "scale set {} already exists",
                scale_set.id
            )));
        }
        inner.scale_sets.insert(scale_set.id, scale_set);
        Ok(())
    }

    fn get_scale_set(&self, id: i64) -> StoreResult<ScaleSet> {
        self.read()
            .scale_sets
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("scale set {id}")))
    }

    fn update_scale_set(&self, mut scale_set: ScaleSet) -> StoreResult<()> {
        scale_set.validate().map_err(StoreError::Invalid)?;
        let mut inner = self.write();
        if !inner.scale_sets.contains_key(&scale_set.id) {
            return Err(StoreError::NotFound(format!("scale set {}", scale_set.id)));
        }
        scale_set.updated_at = Utc::now();
        inner.scale_sets.insert(scale_set.id, scale_set);
        Ok(())
    }

    fn delete_scale_set(&self, id: i64) -> StoreResult<()> {
        let mut inner = self.write();
        inner
            .scale_sets
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("scale set {id}")))
    }

    fn list_entity_scale_sets(&self, entity_id: Uuid) -> Vec<ScaleSet> {
        self.read()
            .scale_sets
            .values()
            .filter(|s| s.entity_id == entity_id)
            .cloned()
            .collect()
    }

    fn set_scale_set_last_message_id(&self, id: i64, message_id: i64) -> StoreResult<()> {
        let mut inner = self.write();
        let scale_set = inner
            .scale_sets
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("scale set {id}")))?;
        scale_set.last_message_id = message_id;
        scale_set.updated_at = Utc::now();
        Ok(())
    }

    fn set_scale_set_session(&self, id: i64, session_id: Option<String>) -> StoreResult<()> {
        let mut inner = self.write();
        let scale_set = inner
            .scale_sets
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("scale set {id}")))?;
        scale_set.session_id = session_id;
        scale_set.updated_at = Utc::now();
        Ok(())
    }

    // -- instances ----------------------------------------------------------

    fn create_instance(&self, instance: Instance) -> StoreResult<()> {
        let mut inner = self.write();
        if inner.instances.contains_key(&instance.name) {
            return Err(StoreError::Conflict(format!(
                "instance {} already exists",
                instance.name
            )));
        }
        match instance.parent {
            InstanceParent::Pool(pool_id) => {
                if !inner.pools.contains_key(&pool_id) {
                    return Err(StoreError::Invalid(format!(
                        "instance {} references unknown pool {pool_id}",
                        instance.name
                    )));
                }
            }
            InstanceParent::ScaleSet(id) => {
                if !inner.scale_sets.contains_key(&id) {
                    return Err(StoreError::Invalid(format!(
                        "instance {} references unknown scale set {id}",
                        instance.name
                    )));
                }
            }
        }
        inner.instances.insert(instance.name.clone(), instance);
        Ok(())
    }

    fn get_instance(&self, name: &str) -> StoreResult<Instance> {
        self.read()
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("instance {name}")))
    }

    fn get_instance_by_id(&self, id: Uuid) -> StoreResult<Instance> {
        self.read()
            .instances
            .values()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("instance {id}")))
    }

    fn get_instance_by_token(&self, callback_token: &str) -> StoreResult<Instance> {
        self.read()
            .instances
            .values()
            .find(|i| i.callback_token == callback_token)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("instance for token".to_string()))
    }

    fn list_pool_instances(&self, pool_id: Uuid) -> Vec<Instance> {
        self.read()
            .instances
            .values()
            .filter(|i| i.pool_id() == Some(pool_id))
            .cloned()
            .collect()
    }

    fn list_scale_set_instances(&self, scale_set_id: i64) -> Vec<Instance> {
        self.read()
            .instances
            .values()
            .filter(|i| i.scale_set_id() == Some(scale_set_id))
            .cloned()
            .collect()
    }

    fn list_entity_instances(&self, entity_id: Uuid) -> Vec<Instance> {
        self.read()
            .instances
            .values()
            .filter(|i| i.entity_id == entity_id)
            .cloned()
            .collect()
    }

    fn list_all_instances(&self) -> Vec<Instance> {
        self.read().instances.values().cloned().collect()
    }

    fn delete_instance(&self, name: &str) -> StoreResult<()> {
        let mut inner = self.write();
        inner
            .instances
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("instance {name}")))
    }

    fn set_instance_status(
        &self,
        name: &str,
        status: InstanceStatus,
        message: Option<StatusMessage>,
    ) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| {
            i.status = status;
            if let Some(m) = message {
                i.status_messages.push(m);
            }
        })
    }

    fn set_instance_runner_status(&self, name: &str, status: RunnerStatus) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| i.runner_status = status)
    }

    fn set_instance_provider_info(
        &self,
        name: &str,
        provider_id: String,
        addresses: Vec<Address>,
    ) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| {
            i.provider_id = Some(provider_id);
            i.addresses = addresses;
        })
    }

    fn set_instance_agent_id(&self, name: &str, agent_id: i64) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| i.agent_id = Some(agent_id))
    }

    fn set_instance_jit_config(
        &self,
        name: &str,
        jit_config: BTreeMap<String, String>,
    ) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| i.jit_config = Some(jit_config))
    }

    fn mark_token_fetched(&self, name: &str) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| i.token_fetched = true)
    }

    fn record_creation_attempt(&self, name: &str, error: Option<String>) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| {
            i.creation_attempts += 1;
            i.last_creation_error = error;
        })
    }

    fn reset_creation_attempts(&self, name: &str) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| {
            i.creation_attempts = 0;
            i.last_creation_error = None;
        })
    }

    fn add_status_message(&self, name: &str, message: StatusMessage) -> StoreResult<()> {
        with_instance(&mut self.write(), name, |i| i.status_messages.push(message))
    }

    // -- templates ----------------------------------------------------------

    fn create_template(&self, mut template: Template) -> StoreResult<Template> {
        let mut inner = self.write();
        inner.next_template_id += 1;
        template.id = inner.next_template_id;
        inner.templates.insert(template.id, template.clone());
        Ok(template)
    }

    fn get_template(&self, id: i64) -> StoreResult<Template> {
        self.read()
            .templates
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("template {id}")))
    }

    fn list_templates(&self) -> Vec<Template> {
        self.read().templates.values().cloned().collect()
    }

    // -- audit trail --------------------------------------------------------

    fn record_entity_event(&self, entity_id: Uuid, level: EventLevel, message: String) {
        let mut inner = self.write();
        inner
            .entity_events
            .entry(entity_id)
            .or_default()
            .push(EntityEvent {
                entity_id,
                created_at: Utc::now(),
                level,
                message,
            });
    }

    fn list_entity_events(&self, entity_id: Uuid) -> Vec<EntityEvent> {
        self.read()
            .entity_events
            .get(&entity_id)
            .cloned()
            .unwrap_or_default()
    }
}

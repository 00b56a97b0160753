//! Store contract for the orchestrator.
//!
//! The orchestrator treats persistence as an external collaborator: this
//! crate defines the contract ([`Store`]) plus an in-memory implementation
//! ([`MemoryStore`]) backing the daemon and every test harness. The store is
//! the source of persistent truth; managers are authoritative for in-flight
//! state only.
//!
//! Contract notes:
//! - Every mutation is atomic with respect to a single record.
//! - Instance writes are keyed by instance *name* (unique).
//! - `create_instance` enforces the one-parent invariant structurally
//!   (`InstanceParent` is an enum) and referentially (the parent must exist).

mod memory;

use chrono::{DateTime, Utc};
use garm_schemas::{
    Address, EventLevel, ForgeCredentials, ForgeEndpoint, ForgeEntity, Instance, InstanceStatus,
    Pool, PoolManagerStatus, RunnerStatus, ScaleSet, StatusMessage, Template,
};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist.
    NotFound(String),
    /// A uniqueness or referential constraint failed.
    Conflict(String),
    /// The record is not valid for insertion.
    Invalid(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {what}"),
            StoreError::Conflict(what) => write!(f, "conflict: {what}"),
            StoreError::Invalid(what) => write!(f, "invalid: {what}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// Operator-visible audit record appended to an entity's trail.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvent {
    pub entity_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Persistence contract. Implementations must be `Send + Sync`; callers hold
/// an `Arc<dyn Store>`. All calls are blocking map operations — deadlines
/// belong to the backing store, not this interface.
pub trait Store: Send + Sync {
    // -- controller ---------------------------------------------------------

    /// Stable controller UUID, seeded on first access.
    fn controller_id(&self) -> Uuid;

    // -- endpoints ----------------------------------------------------------

    fn create_endpoint(&self, endpoint: ForgeEndpoint) -> StoreResult<()>;
    fn get_endpoint(&self, name: &str) -> StoreResult<ForgeEndpoint>;
    fn list_endpoints(&self) -> Vec<ForgeEndpoint>;

    // -- credentials --------------------------------------------------------

    fn create_credentials(&self, creds: ForgeCredentials) -> StoreResult<ForgeCredentials>;
    fn get_credentials(&self, name: &str) -> StoreResult<ForgeCredentials>;
    fn update_credentials(&self, creds: ForgeCredentials) -> StoreResult<()>;
    fn delete_credentials(&self, name: &str) -> StoreResult<()>;
    fn list_credentials(&self) -> Vec<ForgeCredentials>;

    // -- entities -----------------------------------------------------------

    fn create_entity(&self, entity: ForgeEntity) -> StoreResult<()>;
    fn get_entity(&self, id: Uuid) -> StoreResult<ForgeEntity>;
    /// Webhook routing: find the entity registered under a forge path.
    fn find_entity_by_path(&self, path: &str) -> StoreResult<ForgeEntity>;
    fn update_entity(&self, entity: ForgeEntity) -> StoreResult<()>;
    fn delete_entity(&self, id: Uuid) -> StoreResult<()>;
    fn list_entities(&self) -> Vec<ForgeEntity>;
    fn set_pool_manager_status(&self, id: Uuid, status: PoolManagerStatus) -> StoreResult<()>;

    // -- pools --------------------------------------------------------------

    fn create_pool(&self, pool: Pool) -> StoreResult<()>;
    fn get_pool(&self, id: Uuid) -> StoreResult<Pool>;
    fn update_pool(&self, pool: Pool) -> StoreResult<()>;
    fn delete_pool(&self, id: Uuid) -> StoreResult<()>;
    fn list_entity_pools(&self, entity_id: Uuid) -> Vec<Pool>;
    fn list_all_pools(&self) -> Vec<Pool>;
    /// Record (or clear) the reason a pool stopped scaling.
    fn set_pool_failure_reason(&self, id: Uuid, reason: Option<String>) -> StoreResult<()>;

    // -- scale sets ---------------------------------------------------------

    fn create_scale_set(&self, scale_set: ScaleSet) -> StoreResult<()>;
    fn get_scale_set(&self, id: i64) -> StoreResult<ScaleSet>;
    fn update_scale_set(&self, scale_set: ScaleSet) -> StoreResult<()>;
    fn delete_scale_set(&self, id: i64) -> StoreResult<()>;
    fn list_entity_scale_sets(&self, entity_id: Uuid) -> Vec<ScaleSet>;
    fn set_scale_set_last_message_id(&self, id: i64, message_id: i64) -> StoreResult<()>;
    /// Persist (or clear) the session handle held for a scale set.
    fn set_scale_set_session(&self, id: i64, session_id: Option<String>) -> StoreResult<()>;

    // -- instances ----------------------------------------------------------

    fn create_instance(&self, instance: Instance) -> StoreResult<()>;
    fn get_instance(&self, name: &str) -> StoreResult<Instance>;
    fn get_instance_by_id(&self, id: Uuid) -> StoreResult<Instance>;
    fn get_instance_by_token(&self, callback_token: &str) -> StoreResult<Instance>;
    fn list_pool_instances(&self, pool_id: Uuid) -> Vec<Instance>;
    fn list_scale_set_instances(&self, scale_set_id: i64) -> Vec<Instance>;
    fn list_entity_instances(&self, entity_id: Uuid) -> Vec<Instance>;
    fn list_all_instances(&self) -> Vec<Instance>;
    fn delete_instance(&self, name: &str) -> StoreResult<()>;

    /// Atomic status upsert, optionally appending a status message.
    fn set_instance_status(
        &self,
        name: &str,
        status: InstanceStatus,
        message: Option<StatusMessage>,
    ) -> StoreResult<()>;
    fn set_instance_runner_status(&self, name: &str, status: RunnerStatus) -> StoreResult<()>;
    fn set_instance_provider_info(
        &self,
        name: &str,
        provider_id: String,
        addresses: Vec<Address>,
    ) -> StoreResult<()>;
    fn set_instance_agent_id(&self, name: &str, agent_id: i64) -> StoreResult<()>;
    fn set_instance_jit_config(
        &self,
        name: &str,
        jit_config: BTreeMap<String, String>,
    ) -> StoreResult<()>;
    fn mark_token_fetched(&self, name: &str) -> StoreResult<()>;
    fn record_creation_attempt(&self, name: &str, error: Option<String>) -> StoreResult<()>;
    /// Restart the retry budget after a configuration change.
    fn reset_creation_attempts(&self, name: &str) -> StoreResult<()>;
    fn add_status_message(&self, name: &str, message: StatusMessage) -> StoreResult<()>;

    // -- templates ----------------------------------------------------------

    fn create_template(&self, template: Template) -> StoreResult<Template>;
    fn get_template(&self, id: i64) -> StoreResult<Template>;
    fn list_templates(&self) -> Vec<Template>;

    // -- audit trail --------------------------------------------------------

    fn record_entity_event(&self, entity_id: Uuid, level: EventLevel, message: String);
    fn list_entity_events(&self, entity_id: Uuid) -> Vec<EntityEvent>;
}

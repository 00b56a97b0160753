//! Instance records: the orchestrator's view of one runner VM/container.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{OsArch, OsType};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Orchestrator-side lifecycle state of an instance.
///
/// `pending_create → creating → running → {pending_delete |
/// pending_force_delete} → deleting → deleted`, with `error` reachable from
/// any state on fatal provider failure. The legal-transition table lives in
/// the pool crate's state machine; this enum only carries identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    PendingCreate,
    Creating,
    Running,
    PendingDelete,
    /// Delete skipping forge deregistration (credentials known-bad).
    PendingForceDelete,
    Deleting,
    Deleted,
    Error,
}

impl InstanceStatus {
    /// Live = counts against `max_runners`.
    pub fn is_live(self) -> bool {
        !matches!(self, InstanceStatus::Deleted | InstanceStatus::Error)
    }

    /// States from which a delete may be requested.
    pub fn is_deletable(self) -> bool {
        !matches!(
            self,
            InstanceStatus::Deleting | InstanceStatus::Deleted
        )
    }
}

/// Runner-agent-side state, driven by instance callbacks and forge webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Pending,
    Installing,
    Idle,
    Active,
    Terminated,
    Failed,
}

impl RunnerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerStatus::Terminated | RunnerStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Addresses / status messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub kind: AddressType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// Operator-visible event recorded against an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub created_at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Which fleet owns an instance. Exactly one parent, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceParent {
    Pool(Uuid),
    ScaleSet(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    /// Unique instance/runner name, `<prefix>-<uuid>`.
    pub name: String,
    /// Provider-assigned identifier, recorded once the create succeeds.
    pub provider_id: Option<String>,
    pub parent: InstanceParent,
    pub entity_id: Uuid,
    pub provider_name: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub status: InstanceStatus,
    pub runner_status: RunnerStatus,
    pub addresses: Vec<Address>,
    /// Forge-side numeric runner id, recorded at registration.
    pub agent_id: Option<i64>,
    /// JIT registration files keyed by filename, base64 bodies.
    pub jit_config: Option<BTreeMap<String, String>>,
    /// Set once the single-use registration token has been served.
    pub token_fetched: bool,
    /// Bearer the instance presents on callback/metadata requests.
    pub callback_token: String,
    pub creation_attempts: u32,
    pub last_creation_error: Option<String>,
    pub status_messages: Vec<StatusMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn pool_id(&self) -> Option<Uuid> {
        match self.parent {
            InstanceParent::Pool(id) => Some(id),
            InstanceParent::ScaleSet(_) => None,
        }
    }

    pub fn scale_set_id(&self) -> Option<i64> {
        match self.parent {
            InstanceParent::Pool(_) => None,
            InstanceParent::ScaleSet(id) => Some(id),
        }
    }

    /// An idle runner that can take a job right now.
    pub fn is_idle_runner(&self) -> bool {
        self.status == InstanceStatus::Running && self.runner_status == RunnerStatus::Idle
    }

    /// True once `creating` has outlived the pool's bootstrap window.
    pub fn bootstrap_expired(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            InstanceStatus::Creating | InstanceStatus::PendingCreate
        ) && now - self.created_at > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_excludes_deleted_and_error() {
        assert!(InstanceStatus::Running.is_live());
        assert!(InstanceStatus::PendingCreate.is_live());
        assert!(InstanceStatus::Deleting.is_live());
        assert!(!InstanceStatus::Deleted.is_live());
        assert!(!InstanceStatus::Error.is_live());
    }

    #[test]
    fn parent_is_exclusive() {
        let p = InstanceParent::Pool(Uuid::new_v4());
        match p {
            InstanceParent::Pool(_) => {}
            InstanceParent::ScaleSet(_) => panic!("wrong parent"),
        }
    }
}

//! Pool, scale set and template records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ForgeKind;

// ---------------------------------------------------------------------------
// OS coordinates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsType {
    Linux,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsArch {
    Amd64,
    Arm64,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Default bootstrap window: a runner that has not reported within this many
/// minutes of its provider create is considered lost.
pub const DEFAULT_BOOTSTRAP_TIMEOUT_MINS: u32 = 20;

/// Default runner name prefix.
pub const DEFAULT_RUNNER_PREFIX: &str = "garm";

/// A label-matched runner template plus its scaling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,
    pub entity_id: Uuid,
    /// Name of the provider that creates this pool's instances.
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    /// Label set a job must be a subset of to match this pool.
    pub tags: Vec<String>,
    pub min_idle_runners: u32,
    pub max_runners: u32,
    pub enabled: bool,
    /// Higher wins when several pools match a job.
    pub priority: u32,
    /// Opaque provider-specific JSON, passed through on create.
    pub extra_specs: serde_json::Value,
    /// Minutes an instance may sit in `creating` before it is aged out.
    pub runner_bootstrap_timeout_mins: u32,
    pub runner_prefix: String,
    pub template_id: Option<i64>,
    /// Set when create retries are exhausted; scaling stops until the pool's
    /// configuration changes.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    /// `min_idle_runners ≤ max_runners` must hold for every pool.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_idle_runners > self.max_runners {
            return Err(format!(
                "pool {}: min_idle_runners ({}) exceeds max_runners ({})",
                self.id, self.min_idle_runners, self.max_runners
            ));
        }
        if self.tags.is_empty() {
            return Err(format!("pool {}: tag set must not be empty", self.id));
        }
        Ok(())
    }

    /// A pool matches a job iff the job's labels are a subset of the pool
    /// tags (case-insensitive, as forge labels are).
    pub fn matches_labels<S: AsRef<str>>(&self, job_labels: &[S]) -> bool {
        job_labels.iter().all(|l| {
            self.tags
                .iter()
                .any(|t| t.eq_ignore_ascii_case(l.as_ref()))
        })
    }

    pub fn bootstrap_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.runner_bootstrap_timeout_mins))
    }
}

// ---------------------------------------------------------------------------
// ScaleSet
// ---------------------------------------------------------------------------

/// A forge-native named runner group (GitHub only). GARM holds a long-poll
/// session per scale set and applies the deltas the session delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSet {
    /// Forge-assigned scale set id.
    pub id: i64,
    /// GARM-side identity, stable across forge re-creation.
    pub local_id: Uuid,
    pub entity_id: Uuid,
    pub name: String,
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub min_idle_runners: u32,
    pub max_runners: u32,
    pub enabled: bool,
    pub extra_specs: serde_json::Value,
    pub runner_prefix: String,
    pub runner_group: String,
    pub template_id: Option<i64>,
    /// High-water mark of acknowledged session messages.
    pub last_message_id: i64,
    /// Session handle while a coordinator holds the long-poll session.
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScaleSet {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_idle_runners > self.max_runners {
            return Err(format!(
                "scale set {}: min_idle_runners ({}) exceeds max_runners ({})",
                self.id, self.min_idle_runners, self.max_runners
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Cloud-init / setup script template referenced by pools and scale sets.
/// Updates take effect on the next instance create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub forge_kind: ForgeKind,
    pub os_type: OsType,
    pub body: String,
}

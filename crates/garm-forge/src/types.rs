//! Forge REST response shapes the orchestrator consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classic runner registration token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A runner as the forge reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeRunner {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub os: Option<String>,
    /// "online" | "offline" | "idle" (gitea); opaque to the orchestrator
    /// beyond equality checks.
    pub status: String,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// An installed webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookInfo {
    pub id: i64,
    pub url: String,
    pub active: bool,
    #[serde(default)]
    pub events: Vec<String>,
}

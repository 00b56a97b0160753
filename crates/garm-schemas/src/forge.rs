//! Forge-side records: endpoints, credentials, entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ForgeKind / AuthKind
// ---------------------------------------------------------------------------

/// The Git hosting product behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeKind {
    Github,
    Gitea,
}

/// How a set of credentials authenticates against its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// Static personal access token. Rotated only by admin update.
    Pat,
    /// GitHub App: short-lived installation tokens minted from a signed JWT.
    App,
}

// ---------------------------------------------------------------------------
// ForgeEndpoint
// ---------------------------------------------------------------------------

/// A forge API endpoint (github.com, a GHES install, a Gitea install).
///
/// Immutable while any credentials reference it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeEndpoint {
    /// Unique endpoint name, e.g. `"github.com"`.
    pub name: String,
    pub description: String,
    pub kind: ForgeKind,
    /// Browser-facing base URL, e.g. `https://github.com`.
    pub base_url: String,
    /// REST API base URL, e.g. `https://api.github.com`.
    pub api_base_url: String,
    /// Upload URL (GitHub only; `None` for Gitea).
    pub upload_base_url: Option<String>,
    /// Optional PEM bundle for self-signed installs.
    pub ca_cert_bundle: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Static PAT material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatCredentials {
    pub token: String,
}

/// GitHub App material. The private key signs the app JWT used to mint
/// installation tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppCredentials {
    pub app_id: i64,
    pub installation_id: i64,
    pub private_key_pem: String,
}

/// A named set of forge credentials bound to one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeCredentials {
    pub id: i64,
    /// Unique credentials name; entities reference credentials by name.
    pub name: String,
    pub description: String,
    pub endpoint: ForgeEndpoint,
    pub auth_kind: AuthKind,
    pub pat: Option<PatCredentials>,
    pub app: Option<AppCredentials>,
}

impl ForgeCredentials {
    pub fn forge_kind(&self) -> ForgeKind {
        self.endpoint.kind
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// The forge-side scope a fleet of runners registers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Repository,
    Organization,
    Enterprise,
}

/// How jobs are spread across matching pools of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolBalancerType {
    /// Rotate across matching pools, maintaining a per-entity cursor.
    #[default]
    RoundRobin,
    /// Always pick the highest-priority match.
    Pack,
}

/// Health of the per-entity manager, surfaced to the API.
///
/// `running == true` implies `failure_reason` is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolManagerStatus {
    pub running: bool,
    pub failure_reason: Option<String>,
}

impl PoolManagerStatus {
    pub fn running() -> Self {
        Self {
            running: true,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            running: false,
            failure_reason: Some(reason.into()),
        }
    }
}

/// A repository, organization or enterprise that owns pools and scale sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeEntity {
    pub id: Uuid,
    pub kind: EntityKind,
    /// Repo owner, organization name, or enterprise slug.
    pub owner: String,
    /// Repository name; `None` for organizations and enterprises.
    pub name: Option<String>,
    /// Name of the [`ForgeCredentials`] this entity authenticates with.
    pub credentials_name: String,
    /// Endpoint name the credentials must belong to.
    pub endpoint_name: String,
    /// Per-entity secret for webhook signature validation.
    pub webhook_secret: String,
    pub balancer: PoolBalancerType,
    pub pool_manager_status: PoolManagerStatus,
}

impl ForgeEntity {
    /// The forge path runners register under: `owner/name` for repositories,
    /// the bare owner for organizations and enterprises.
    pub fn forge_path(&self) -> String {
        match &self.name {
            Some(name) => format!("{}/{}", self.owner, name),
            None => self.owner.clone(),
        }
    }
}

//! Forge clients: the orchestrator's window onto GitHub and Gitea.
//!
//! A [`ForgeClient`] is produced per `(entity, credentials)` pair by a
//! [`ForgeClientProvider`]. HTTP errors are classified into the four
//! retry-policy classes the orchestrator acts on; token handling (PAT vs
//! GitHub App installation tokens) is internal to the client.

mod auth;
mod factory;
mod gitea;
mod github;
mod types;

use async_trait::async_trait;
use garm_schemas::{ForgeEntity, RunnerApplication, WorkflowJob};
use std::collections::BTreeMap;

pub use auth::AppTokenCache;
pub use factory::{ForgeClientProvider, HttpForgeFactory};
pub use gitea::GiteaClient;
pub use github::GithubClient;
pub use types::{ForgeRunner, HookInfo, RegistrationToken};

// ---------------------------------------------------------------------------
// ForgeError
// ---------------------------------------------------------------------------

/// HTTP failures folded into the classes callers have policies for.
#[derive(Debug, Clone)]
pub enum ForgeError {
    /// 5xx, network, timeout — retry with jittered backoff.
    Transient(String),
    /// 401/403 — rotate (App) and retry once, else credentials are bad.
    Auth(String),
    /// 404 — success for removal paths, an error elsewhere.
    NotFound(String),
    /// 409 — lost a race (another session holder); re-acquire and retry.
    Conflict(String),
    /// Other 4xx — the request itself is wrong, never retried.
    Validation(String),
    /// Response body did not match the expected shape.
    Decode(String),
}

impl ForgeError {
    /// Classify an HTTP status with its body as diagnostic.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => ForgeError::Auth(format!("{status}: {body}")),
            404 => ForgeError::NotFound(format!("{status}: {body}")),
            409 => ForgeError::Conflict(format!("{status}: {body}")),
            400..=499 => ForgeError::Validation(format!("{status}: {body}")),
            _ => ForgeError::Transient(format!("{status}: {body}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ForgeError::Auth(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ForgeError::NotFound(_))
    }

    /// Session-invalidating: the holder must re-acquire before retrying.
    pub fn is_session_error(&self) -> bool {
        matches!(self, ForgeError::Auth(_) | ForgeError::Conflict(_))
    }
}

impl std::fmt::Display for ForgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForgeError::Transient(msg) => write!(f, "transient forge error: {msg}"),
            ForgeError::Auth(msg) => write!(f, "forge auth error: {msg}"),
            ForgeError::NotFound(msg) => write!(f, "forge not found: {msg}"),
            ForgeError::Conflict(msg) => write!(f, "forge conflict: {msg}"),
            ForgeError::Validation(msg) => write!(f, "forge validation error: {msg}"),
            ForgeError::Decode(msg) => write!(f, "forge response decode error: {msg}"),
        }
    }
}

impl std::error::Error for ForgeError {}

impl From<reqwest::Error> for ForgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ForgeError::Transient(e.to_string())
        } else if e.is_decode() {
            ForgeError::Decode(e.to_string())
        } else {
            ForgeError::Transient(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// ForgeClient trait
// ---------------------------------------------------------------------------

/// The operations the orchestrator needs from a forge, scoped to one entity.
#[async_trait]
pub trait ForgeClient: std::fmt::Debug + Send + Sync {
    fn entity(&self) -> &ForgeEntity;

    /// Browser-facing URL the runner agent registers against.
    fn forge_url(&self) -> String;

    /// Classic registration token (single-use at the metadata endpoint).
    async fn get_registration_token(&self) -> Result<RegistrationToken, ForgeError>;

    /// JIT registration material plus the pre-registered runner record.
    /// GitHub only; Gitea returns a validation error.
    async fn get_jit_config(
        &self,
        runner_name: &str,
        labels: &[String],
        runner_group: &str,
    ) -> Result<(BTreeMap<String, String>, ForgeRunner), ForgeError>;

    /// Tools manifest: downloadable runner-agent builds.
    async fn list_runner_applications(&self) -> Result<Vec<RunnerApplication>, ForgeError>;

    async fn list_runners(&self) -> Result<Vec<ForgeRunner>, ForgeError>;

    /// Jobs currently queued at the forge. Used on manager startup to
    /// recover deliveries missed while GARM was down; scopes without a
    /// job-listing API return an empty set.
    async fn list_queued_jobs(&self) -> Result<Vec<WorkflowJob>, ForgeError>;

    /// Deregister a runner. 404 means it is already gone, which callers
    /// treat as success.
    async fn remove_runner(&self, agent_id: i64) -> Result<(), ForgeError>;

    async fn install_webhook(&self, url: &str, secret: &str) -> Result<HookInfo, ForgeError>;

    async fn uninstall_webhook(&self, hook_id: i64) -> Result<(), ForgeError>;

    async fn get_webhook(&self, target_url: &str) -> Result<Option<HookInfo>, ForgeError>;

    /// Cheap authenticated call to verify the credentials still work.
    async fn ping(&self) -> Result<(), ForgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ForgeError::from_status(500, "boom").is_transient());
        assert!(ForgeError::from_status(502, "").is_transient());
        assert!(ForgeError::from_status(401, "bad creds").is_auth());
        assert!(ForgeError::from_status(403, "forbidden").is_auth());
        assert!(ForgeError::from_status(404, "nope").is_not_found());
        assert!(ForgeError::from_status(409, "session taken").is_session_error());
        assert!(matches!(
            ForgeError::from_status(422, "invalid"),
            ForgeError::Validation(_)
        ));
    }
}

//! Provider dispatch: the single seam between the orchestrator and the
//! compute substrate.
//!
//! A [`Provider`] creates and destroys runner instances. The production
//! implementation is [`ExternalProvider`] — a subprocess speaking interface
//! v0.1.0 — but the trait is object-safe so tests can substitute in-process
//! mocks. All calls go through the [`Dispatcher`], which serializes
//! operations per instance and bounds process-wide concurrency.

mod dispatcher;
mod external;

use async_trait::async_trait;
use garm_schemas::{BootstrapInstance, ProviderInstance};
use uuid::Uuid;

pub use dispatcher::{Dispatcher, OperationCount};
pub use external::{ExternalProvider, EXIT_CODE_NOT_FOUND, INTERFACE_VERSION};

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Errors a provider operation may surface, classified for retry policy.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Worth retrying: subprocess spawn/IO failure, signal kill.
    Transient(String),
    /// The instance does not exist at the provider.
    NotFound(String),
    /// Provider rejected the operation; retrying the same call will not help.
    Fatal(String),
    /// The provider produced output the orchestrator cannot decode.
    Decode(String),
    /// Operation exceeded its deadline; the subprocess was killed.
    Timeout { operation: String, secs: u64 },
    /// The provider is not configured / not registered.
    Config(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    /// Retryable = transient failure or timeout.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::Timeout { .. }
        )
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transient(msg) => write!(f, "transient provider error: {msg}"),
            ProviderError::NotFound(msg) => write!(f, "instance not found: {msg}"),
            ProviderError::Fatal(msg) => write!(f, "provider error: {msg}"),
            ProviderError::Decode(msg) => write!(f, "provider output decode error: {msg}"),
            ProviderError::Timeout { operation, secs } => {
                write!(f, "provider {operation} timed out after {secs}s")
            }
            ProviderError::Config(msg) => write!(f, "provider config error: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// One IaaS provider. Implementations must be `Send + Sync` and object-safe
/// so the dispatcher can hold a registry of `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Configured provider name (pools reference providers by name).
    fn name(&self) -> &str;

    /// When set, pools on this provider never use JIT registration even if
    /// the forge supports it.
    fn disable_jit_config(&self) -> bool {
        false
    }

    /// Create one instance. NOT idempotent — the caller must hold the
    /// in-flight lock for this instance name.
    async fn create_instance(
        &self,
        bootstrap: &BootstrapInstance,
    ) -> Result<ProviderInstance, ProviderError>;

    async fn get_instance(&self, instance_name: &str) -> Result<ProviderInstance, ProviderError>;

    /// Must tolerate *not found*: deleting an absent instance is an error
    /// here, mapped to success by the dispatcher.
    async fn delete_instance(&self, instance_name: &str) -> Result<(), ProviderError>;

    async fn list_instances(&self, pool_id: Uuid) -> Result<Vec<ProviderInstance>, ProviderError>;

    async fn remove_all_instances(&self, pool_id: Uuid) -> Result<(), ProviderError>;

    async fn start_instance(&self, instance_name: &str) -> Result<(), ProviderError>;

    async fn stop_instance(&self, instance_name: &str) -> Result<(), ProviderError>;
}

//! Shared data model for the GARM control plane.
//!
//! Plain serde structs only. No IO, no async, no policy — every decision
//! about *what to do* with these records lives in the owning subsystem
//! (pool manager, dispatcher, reconciler). Wire-contract types for the
//! external provider ABI live in [`wire`].

mod forge;
mod instance;
mod pool;
mod webhook;
mod wire;

pub use forge::*;
pub use instance::*;
pub use pool::*;
pub use webhook::*;
pub use wire::*;

/// Runner label helpers.
///
/// Every runner GARM creates carries two controller-scoped labels in
/// addition to the pool tags, so that forge-side runners can be matched
/// back to the pool and controller that own them.
pub mod labels {
    use uuid::Uuid;

    pub const POOL_ID_PREFIX: &str = "runner-pool-id=";
    pub const CONTROLLER_ID_PREFIX: &str = "runner-controller-id=";

    pub fn pool_label(pool_id: Uuid) -> String {
        format!("{POOL_ID_PREFIX}{pool_id}")
    }

    pub fn controller_label(controller_id: Uuid) -> String {
        format!("{CONTROLLER_ID_PREFIX}{controller_id}")
    }

    /// Extract the controller id from a runner's label set, if present.
    pub fn controller_id_from_labels<S: AsRef<str>>(labels: &[S]) -> Option<Uuid> {
        labels.iter().find_map(|l| {
            l.as_ref()
                .strip_prefix(CONTROLLER_ID_PREFIX)
                .and_then(|v| v.parse().ok())
        })
    }

    /// Extract the pool id from a runner's label set, if present.
    pub fn pool_id_from_labels<S: AsRef<str>>(labels: &[S]) -> Option<Uuid> {
        labels.iter().find_map(|l| {
            l.as_ref()
                .strip_prefix(POOL_ID_PREFIX)
                .and_then(|v| v.parse().ok())
        })
    }

}

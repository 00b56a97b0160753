//! Per-entity pool management.
//!
//! One [`PoolManager`] task per forge entity owns every pool under that
//! entity: idle-capacity maintenance, webhook-driven job dispatch, bootstrap
//! aging, create retries with backoff, and the instance lifecycle state
//! machine. The manager is authoritative for in-flight state; the store is
//! authoritative for persistent state.

mod backoff;
mod manager;
mod statemachine;

pub use backoff::CreateBackoff;
pub use manager::{
    start_pool_manager, PoolManagerConfig, PoolManagerHandle, PoolManagerParams,
};
pub use statemachine::{
    apply_runner_status, next_status, LifecycleEvent, TransitionError,
};

//! Scale-set coordination (GitHub only).
//!
//! Scale sets bypass webhooks: GARM holds a long-lived *session* against the
//! forge's runner-scale-set service and receives *messages* describing
//! desired deltas (jobs available to acquire, jobs started, jobs finished).
//! The coordinator applies those deltas through the same dispatcher, store
//! and instance state machine the pool manager uses, and acknowledges each
//! message by id so the forge can advance the queue.

mod api;
mod coordinator;

pub use api::{
    HttpScaleSetApi, ScaleSetApi, ScaleSetJob, ScaleSetMessage, ScaleSetMessageBody,
    ScaleSetSession, ScaleSetStatistics,
};
pub use coordinator::{
    start_scale_set_coordinator, ScaleSetCoordinatorConfig, ScaleSetCoordinatorHandle,
    ScaleSetCoordinatorParams,
};

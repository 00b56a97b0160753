//! Instance lifecycle state machine.
//!
//! # Design
//!
//! Two parallel tracks per instance:
//!
//! 1. **Orchestrator status** ([`InstanceStatus`]) — what GARM is doing with
//!    the instance. Driven by the pool manager and the reconciler through
//!    [`next_status`], which enforces legal transitions.
//! 2. **Runner status** ([`RunnerStatus`]) — what the runner agent reports,
//!    via instance callbacks and forge webhooks. Applied through
//!    [`apply_runner_status`], which is tolerant: duplicate and stale
//!    reports (including a `workflow_job.completed` replay against a
//!    terminated runner) are silent no-ops.
//!
//! ```text
//!  pending_create ──► creating ──► running ──► pending_delete ─► deleting ─► deleted
//!        │               │  │                  pending_force_delete ─┘          ▲
//!        │               │  └── timeout ───────────► (same delete path) ────────┘
//!        └───────────────┴── provider failure ──► error ──► pending_delete
//! ```

use garm_schemas::{InstanceStatus, RunnerStatus};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Orchestrator-side events that move an instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Pool manager picked the instance up and holds the in-flight lock.
    PickUp,
    /// Provider create returned success.
    ProviderCreated,
    /// Provider create returned a fatal error (partial state possible).
    ProviderFailed,
    /// Ephemeral runner finished, manual delete, reconciler orphan, or
    /// bootstrap timeout.
    RequestDelete,
    /// Delete skipping forge deregistration.
    RequestForceDelete,
    /// Delete worker started (forge deregistration + provider delete).
    DeleteStarted,
    /// Provider delete succeeded (or instance was already gone).
    DeleteFinished,
    /// Delete failed with a retryable error; back to the queue.
    DeleteFailed,
}

impl LifecycleEvent {
    fn name(self) -> &'static str {
        match self {
            LifecycleEvent::PickUp => "PickUp",
            LifecycleEvent::ProviderCreated => "ProviderCreated",
            LifecycleEvent::ProviderFailed => "ProviderFailed",
            LifecycleEvent::RequestDelete => "RequestDelete",
            LifecycleEvent::RequestForceDelete => "RequestForceDelete",
            LifecycleEvent::DeleteStarted => "DeleteStarted",
            LifecycleEvent::DeleteFinished => "DeleteFinished",
            LifecycleEvent::DeleteFailed => "DeleteFailed",
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// An event arrived that is illegal in the current state. Callers treat this
/// as a bug in the scheduling logic, log it, and leave the record untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: InstanceStatus,
    pub event: &'static str,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal instance transition: {:?} + {}", self.from, self.event)
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// Orchestrator-status transitions
// ---------------------------------------------------------------------------

/// Compute the next orchestrator status. Idempotent where replays are
/// expected (re-requesting a delete of an already-queued instance).
pub fn next_status(
    from: InstanceStatus,
    event: LifecycleEvent,
) -> Result<InstanceStatus, TransitionError> {
    use InstanceStatus::*;
    use LifecycleEvent::*;

    let next = match (from, event) {
        (PendingCreate, PickUp) => Creating,
        (Creating, ProviderCreated) => Running,

        // Fatal provider error before the instance ever ran.
        (PendingCreate | Creating, ProviderFailed) => Error,
        // Retry path: an errored instance is picked up again.
        (Error, PickUp) => Creating,

        // Delete requests are accepted from every pre-delete state; the
        // bootstrap-timeout path arrives here from Creating.
        (PendingCreate | Creating | Running | Error, RequestDelete) => PendingDelete,
        (PendingDelete, RequestDelete) => PendingDelete,
        (PendingCreate | Creating | Running | Error, RequestForceDelete) => PendingForceDelete,
        (PendingDelete, RequestForceDelete) => PendingForceDelete,
        (PendingForceDelete, RequestDelete | RequestForceDelete) => PendingForceDelete,

        (PendingDelete | PendingForceDelete, DeleteStarted) => Deleting,
        (Deleting, DeleteFinished) => Deleted,
        (Deleting, DeleteFailed) => PendingDelete,

        // Replays against a finished instance are no-ops.
        (Deleted, RequestDelete | RequestForceDelete | DeleteFinished) => Deleted,

        (from, event) => {
            return Err(TransitionError {
                from,
                event: event.name(),
            })
        }
    };
    Ok(next)
}

// ---------------------------------------------------------------------------
// Runner-status transitions
// ---------------------------------------------------------------------------

fn runner_rank(status: RunnerStatus) -> u8 {
    match status {
        RunnerStatus::Pending => 0,
        RunnerStatus::Installing => 1,
        RunnerStatus::Idle | RunnerStatus::Active => 2,
        RunnerStatus::Terminated | RunnerStatus::Failed => 3,
    }
}

/// Fold a reported runner status into the current one.
///
/// Rules:
/// - terminal states are sticky: any report against `terminated`/`failed`
///   is ignored (webhook replay idempotence);
/// - `idle` ⇄ `active` flips freely (job pickup / completion);
/// - otherwise the report must move forward; a stale report (e.g. a late
///   `installing` after `idle`) is ignored.
///
/// Returns the status to store — possibly unchanged.
pub fn apply_runner_status(current: RunnerStatus, reported: RunnerStatus) -> RunnerStatus {
    if current == reported || current.is_terminal() {
        return current;
    }
    // idle <-> active flips both ways.
    if matches!(
        (current, reported),
        (RunnerStatus::Idle, RunnerStatus::Active) | (RunnerStatus::Active, RunnerStatus::Idle)
    ) {
        return reported;
    }
    if runner_rank(reported) > runner_rank(current) {
        reported
    } else {
        current
    }
}

//! Deterministic test doubles and a scenario harness.
//!
//! The harness wires the *real* store, bus, cache, dispatcher, pool manager,
//! scale-set coordinator and reconciler against an in-process mock provider
//! and mock forge. No network, no subprocesses — scenarios in `tests/`
//! exercise the orchestrator end to end with scripted failures.

mod harness;
mod mock_forge;
mod mock_provider;
mod mock_scaleset;

pub use harness::{TestBed, TEST_PAT};
pub use mock_forge::{ForgeState, MockForgeClient, MockForgeFactory};
pub use mock_provider::MockProvider;
pub use mock_scaleset::MockScaleSetApi;

//! In-process event bus, read-through cache and controller context.
//!
//! Control flow glue: state-changing callers publish exactly one
//! [`ChangeEvent`] after the store write commits; pool managers, scale-set
//! coordinators and the cache invalidator consume them. Publishing is
//! fan-out and non-blocking — a slow subscriber can only lag itself, and a
//! lagged subscriber is told to resync from the store.

mod bus;
mod cache;
mod controller;

pub use bus::*;
pub use cache::*;
pub use controller::*;

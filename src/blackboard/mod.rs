//! Blackboard: the shared-state environment agents coordinate through.
//!
//! Two stores live here:
//!
//! - [`ResourceRegistry`] owns named resources and decides who may hold them.
//!   Exclusive resources admit one holder, shared resources up to their
//!   capacity. Waiters are granted in arrival order.
//! - [`SharedState`] is a keyed value store. Every write is versioned and
//!   published to the [`EventLog`](crate::events::EventLog).
//!
//! Neither store is reachable except through its own methods; agents never
//! assume ownership of a resource without a granted request.

pub mod registry;
pub mod resource;
pub mod state;

pub use registry::ResourceRegistry;
pub use resource::{AccessMode, Resource, ResourceKind, ResourceSpec};
pub use state::{SharedState, StateEntry};

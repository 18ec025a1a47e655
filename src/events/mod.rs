//! Event/Knowledge Log: the append-only record of everything the
//! coordination services mutate.
//!
//! Every resource grant, state write, task transition and protocol outcome
//! is published here. Subscribers are invoked synchronously on the
//! publishing thread; a panicking subscriber is isolated and logged so it
//! can never stop delivery to the others or unwind into the publisher.

pub mod event;
pub mod event_log;

pub use event::{EventFilter, EventKind, LoggedEvent};
pub use event_log::{EventLog, SubscriptionId};

//! Message Router: priority-ordered delivery of typed messages between agents.
//!
//! Messages are queued by `(priority, arrival)` with priority 1 highest and
//! drained either explicitly through [`MessageRouter::deliver`] or by a
//! [`DeliveryLoop`] thread. Delivery is at-most-once: a message whose
//! recipient has no registered endpoint at delivery time is dropped and
//! counted, never retried.
//!
//! ```text
//! sender ──send──► [ priority queue ] ──deliver──► handler / inbox
//!                        │
//!                        └──► conversation history
//! ```

pub mod message;
pub mod router;

pub use message::{Message, MessageKind, MessagePayload, TaskOutcome, DEFAULT_PRIORITY};
pub use router::{DeliveryLoop, MessageHandler, MessageRouter, RouterMetrics};

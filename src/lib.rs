//! # Agora
//!
//! A coordination substrate for multi-agent systems. Agents share state and
//! capacity-limited resources on a blackboard, exchange prioritized messages,
//! receive tasks and workflows from a dispatcher, settle disputes through
//! negotiation, auctions and votes, and pool their knowledge into collective
//! aggregates. Every state change is recorded on a shared event log.
//!
//! ```no_run
//! use agora::{Coordinator, CoordinatorConfig};
//!
//! let coordinator = Coordinator::new(CoordinatorConfig::default())?;
//! coordinator.start_delivery()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod blackboard;
pub mod collective;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod messaging;
pub mod negotiation;

pub use blackboard::{AccessMode, Resource, ResourceKind, ResourceRegistry, ResourceSpec, SharedState};
pub use collective::{AggregatedKnowledge, AggregationMethod, CollectiveIntelligence, Contribution};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, SweepReport, COORDINATOR_ID};
pub use dispatch::{AgentRecord, Task, TaskDispatcher, TaskStatus, WorkflowEngine, WorkflowStatus};
pub use errors::{ConfigError, CoordinationError, Result};
pub use events::{EventKind, EventLog, LoggedEvent};
pub use messaging::{Message, MessageKind, MessagePayload, MessageRouter, TaskOutcome};
pub use negotiation::{AuctionHouse, NegotiationManager, VotingBooth};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

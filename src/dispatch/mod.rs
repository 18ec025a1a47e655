//! Task Dispatcher and Workflow Engine.
//!
//! Agents register with a capability set. The dispatcher matches each task
//! to the best live agent whose capabilities cover the task's requirements
//! and sends it a REQUEST message; the workflow engine releases dependent
//! tasks as their dependencies complete.

pub mod agent;
pub mod dispatcher;
pub mod task;
pub mod workflow;

pub use agent::{AgentRecord, AgentRegistry};
pub use dispatcher::{TaskDispatcher, DISPATCHER_ID};
pub use task::{Task, TaskStatus};
pub use workflow::{Workflow, WorkflowEngine, WorkflowProgress, WorkflowStatus};

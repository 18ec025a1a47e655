//! Error types for coordination operations.
//!
//! Only configuration-class failures are errors. Contention outcomes
//! (resource at capacity, reserve not met, negotiation expired, too few
//! contributions) are returned as plain values the caller branches on.

use thiserror::Error;

/// Failures surfaced immediately to the caller of a coordination operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinationError {
    /// A resource with this name already exists.
    #[error("Resource already exists: {name}")]
    DuplicateResource { name: String },

    /// No resource is registered under this id.
    #[error("Resource not found: {resource_id}")]
    UnknownResource { resource_id: String },

    /// Shared resources need a capacity of at least one.
    #[error("Invalid capacity {capacity} for resource {name}")]
    InvalidCapacity { name: String, capacity: usize },

    /// No agent is registered under this id.
    #[error("Agent not found: {agent_id}")]
    UnknownAgent { agent_id: String },

    /// An agent with this id is already registered.
    #[error("Agent already registered: {agent_id}")]
    DuplicateAgent { agent_id: String },

    /// No live agent declares every capability the task requires.
    #[error("No capable agent for task {task_id} (requires {required:?})")]
    NoCapableAgent {
        task_id: String,
        required: Vec<String>,
    },

    /// No task is registered under this id.
    #[error("Task not found: {task_id}")]
    UnknownTask { task_id: String },

    /// A task with this id is already registered.
    #[error("Task already registered: {task_id}")]
    DuplicateTask { task_id: String },

    /// The task still has dependencies that have not completed.
    #[error("Task {task_id} has unmet dependencies: {pending:?}")]
    DependenciesUnmet {
        task_id: String,
        pending: Vec<String>,
    },

    /// A dependency names a task that is not part of the workflow.
    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency involving tasks {tasks:?}")]
    CyclicDependency { tasks: Vec<String> },

    /// The requested state transition is not defined.
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// No workflow is registered under this id.
    #[error("Workflow not found: {workflow_id}")]
    UnknownWorkflow { workflow_id: String },

    /// No negotiation, auction or vote is registered under this id.
    #[error("Session not found: {session_id}")]
    UnknownSession { session_id: String },

    /// The agent is not a participant of the session.
    #[error("Agent {agent_id} is not a participant of session {session_id}")]
    NotParticipant {
        session_id: String,
        agent_id: String,
    },

    /// The session already reached a terminal state.
    #[error("Session {session_id} is closed")]
    SessionClosed { session_id: String },

    /// A score was outside `[0, 1]` or not finite.
    #[error("Invalid {field}: {value} (expected a value in [0, 1])")]
    InvalidScore { field: &'static str, value: f64 },

    /// A vote was opened without any options, or a ballot named an unknown option.
    #[error("Invalid option {option:?} for vote {session_id}")]
    InvalidOption {
        session_id: String,
        option: Option<String>,
    },

    /// A negotiation exceeded the configured number of counter-offers.
    #[error("Negotiation {session_id} exhausted its {max_rounds} rounds")]
    RoundsExhausted {
        session_id: String,
        max_rounds: u32,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The YAML document could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A field holds an out-of-range value.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Reject scores outside `[0, 1]`.
pub(crate) fn check_unit_score(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CoordinationError::InvalidScore { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_score_bounds() {
        assert!(check_unit_score("quality", 0.0).is_ok());
        assert!(check_unit_score("quality", 1.0).is_ok());
        assert!(check_unit_score("quality", 1.01).is_err());
        assert!(check_unit_score("confidence", f64::NAN).is_err());
    }

    #[test]
    fn test_error_messages() {
        let err = CoordinationError::DuplicateResource {
            name: "dataset".into(),
        };
        assert_eq!(err.to_string(), "Resource already exists: dataset");

        let err = CoordinationError::NoCapableAgent {
            task_id: "t1".into(),
            required: vec!["analysis".into()],
        };
        assert!(err.to_string().contains("t1"));
    }
}

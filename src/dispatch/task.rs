//! Task records and their lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{CoordinationError, Result};
use crate::messaging::DEFAULT_PRIORITY;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or for distribution.
    Pending,
    /// Handed to an agent.
    Assigned,
    /// The agent reported it started.
    InProgress,
    Completed,
    Failed,
    /// A dependency failed or was cancelled.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a defined transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned) | (Pending, Failed) | (Pending, Cancelled) => true,
            (Assigned, InProgress) | (Assigned, Completed) | (Assigned, Failed) => true,
            (Assigned, Cancelled) => true,
            (InProgress, Completed) | (InProgress, Failed) | (InProgress, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work distributed to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub input: Value,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Priority of the REQUEST message sent on assignment (1 is highest).
    pub priority: u8,
    #[serde(default)]
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Workflow this task belongs to, if any.
    pub workflow_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            required_capabilities: Vec::new(),
            input: Value::Null,
            dependencies: Vec::new(),
            priority: DEFAULT_PRIORITY,
            status: TaskStatus::Pending,
            assigned_agent: None,
            result: None,
            error: None,
            workflow_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A task with a generated id.
    pub fn with_generated_id(description: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), description)
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.max(1);
        self
    }

    /// Move to `next`, or fail with `InvalidTransition`.
    pub(crate) fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoordinationError::InvalidTransition {
                entity: "task",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

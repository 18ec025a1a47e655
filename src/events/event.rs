//! Logged event record and its kind discriminator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a logged event records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateUpdated,
    ResourceCreated,
    ResourceLocked,
    ResourceReleased,
    ResourceRequestTimedOut,
    MessageSent,
    MessageDropped,
    AgentRegistered,
    AgentExpired,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    WorkflowCreated,
    NegotiationClosed,
    AuctionClosed,
    VoteClosed,
    ContributionAdded,
    KnowledgeAggregated,
    /// Domain events published by hosting code.
    Custom(String),
}

impl EventKind {
    /// Stable string key, e.g. `"resource_locked"` or `"custom:report_ready"`.
    pub fn key(&self) -> String {
        match self {
            Self::Custom(name) => format!("custom:{name}"),
            other => match serde_json::to_value(other) {
                Ok(Value::String(s)) => s,
                _ => format!("{other:?}"),
            },
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Selects which events a subscriber or query sees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Only events of one kind.
    Kind(EventKind),
}

impl EventFilter {
    pub fn matches(&self, kind: &EventKind) -> bool {
        match self {
            Self::All => true,
            Self::Kind(k) => k == kind,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}

/// One immutable entry of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// Generated unique id (UUID v4).
    pub id: String,
    /// Position in the log, starting at 1.
    pub sequence: u64,
    pub kind: EventKind,
    /// Event data; the schema depends on `kind`.
    pub data: Value,
    /// Agent that caused the event, when there is one.
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_keys() {
        assert_eq!(EventKind::ResourceLocked.key(), "resource_locked");
        assert_eq!(EventKind::TaskCancelled.to_string(), "task_cancelled");
        assert_eq!(
            EventKind::Custom("report_ready".into()).key(),
            "custom:report_ready"
        );
    }

    #[test]
    fn test_filter_matching() {
        let filter = EventFilter::from(EventKind::TaskCompleted);
        assert!(filter.matches(&EventKind::TaskCompleted));
        assert!(!filter.matches(&EventKind::TaskFailed));
        assert!(EventFilter::All.matches(&EventKind::Custom("x".into())));
    }
}

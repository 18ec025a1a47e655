//! Message envelope and typed payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Priority given to messages that do not set one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Performative of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Inform,
    Query,
    Propose,
    Accept,
    Reject,
    Delegate,
    Complete,
    Negotiate,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Inform => "inform",
            Self::Query => "query",
            Self::Propose => "propose",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Delegate => "delegate",
            Self::Complete => "complete",
            Self::Negotiate => "negotiate",
        };
        f.write_str(s)
    }
}

/// Result a worker reports for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { result: Value },
    Failure { error: String },
}

/// Message body. Free-form JSON is confined to the `input`, `result`,
/// `terms` and `Data` fields at the edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Empty,
    Text { text: String },
    /// Work handed to an agent by the dispatcher.
    TaskRequest {
        task_id: String,
        required_capabilities: Vec<String>,
        input: Value,
    },
    /// A worker's report on a task it was assigned.
    TaskResult { task_id: String, outcome: TaskOutcome },
    /// An offer within a negotiation session.
    Offer {
        session_id: String,
        amount: f64,
        terms: Value,
    },
    Data { value: Value },
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn data(value: Value) -> Self {
        Self::Data { value }
    }
}

/// An immutable message between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub kind: MessageKind,
    pub payload: MessagePayload,
    /// 1 is the highest priority.
    pub priority: u8,
    pub conversation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Messages still queued after this instant are dropped at delivery.
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageKind,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            payload,
            priority: DEFAULT_PRIORITY,
            conversation_id: None,
            reply_to: None,
            deadline: None,
            created_at: Utc::now(),
        }
    }

    /// Builder: set priority (values below 1 are raised to 1).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.max(1);
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A reply addressed back to the sender, in the same conversation and
    /// with the same priority.
    pub fn reply(&self, kind: MessageKind, payload: MessagePayload) -> Self {
        let mut reply = Message::new(self.recipient.clone(), self.sender.clone(), kind, payload)
            .with_priority(self.priority)
            .replying_to(self.id.clone());
        reply.conversation_id = self.conversation_id.clone();
        reply
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |d| now > d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builder() {
        let msg = Message::new("a", "b", MessageKind::Query, MessagePayload::text("status?"))
            .with_priority(0)
            .in_conversation("conv-1");
        assert_eq!(msg.priority, 1);
        assert_eq!(msg.conversation_id.as_deref(), Some("conv-1"));
        assert!(!msg.is_expired(Utc::now()));
    }

    #[test]
    fn test_reply_swaps_parties() {
        let msg = Message::new("a", "b", MessageKind::Query, MessagePayload::Empty)
            .with_priority(2)
            .in_conversation("c");
        let reply = msg.reply(MessageKind::Response, MessagePayload::text("ok"));
        assert_eq!(reply.sender, "b");
        assert_eq!(reply.recipient, "a");
        assert_eq!(reply.reply_to.as_deref(), Some(msg.id.as_str()));
        assert_eq!(reply.conversation_id.as_deref(), Some("c"));
        assert_eq!(reply.priority, 2);
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        let payload = MessagePayload::TaskResult {
            task_id: "t1".into(),
            outcome: TaskOutcome::Success { result: json!(42) },
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "task_result");
        assert_eq!(value["outcome"]["status"], "success");
    }

    #[test]
    fn test_expiry() {
        let past = Utc::now() - chrono::Duration::seconds(1);
        let msg = Message::new("a", "b", MessageKind::Inform, MessagePayload::Empty).with_deadline(past);
        assert!(msg.is_expired(Utc::now()));
    }
}

//! Append-only event log with synchronous keyed subscriptions.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::event::{EventFilter, EventKind, LoggedEvent};

/// Callback invoked for every matching published event.
pub type Subscriber = Arc<dyn Fn(&LoggedEvent) + Send + Sync>;

/// Handle returned by [`EventLog::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct SubscriberEntry {
    id: SubscriptionId,
    filter: EventFilter,
    callback: Subscriber,
}

/// Process-lifetime, append-only log of coordination events.
///
/// Appends are serialized so sequence numbers follow append order.
/// Subscribers run after the append lock is released, so a subscriber may
/// itself publish without deadlocking.
pub struct EventLog {
    events: RwLock<Vec<LoggedEvent>>,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    next_subscription: AtomicU64,
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("events", &self.events.read().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Append an event, then invoke every subscriber whose filter matches.
    ///
    /// Returns the appended event. Subscriber panics are caught and logged.
    pub fn publish(&self, kind: EventKind, data: Value, agent_id: Option<&str>) -> LoggedEvent {
        let event = {
            let mut events = self.events.write();
            let event = LoggedEvent {
                id: Uuid::new_v4().to_string(),
                sequence: events.len() as u64 + 1,
                kind,
                data,
                agent_id: agent_id.map(str::to_string),
                timestamp: Utc::now(),
            };
            events.push(event.clone());
            event
        };

        log::trace!("[EventLog] #{} {}", event.sequence, event.kind);

        let targets: Vec<SubscriberEntry> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.filter.matches(&event.kind))
            .cloned()
            .collect();

        for entry in targets {
            let callback = entry.callback;
            let result = catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if let Err(panic) = result {
                log::error!(
                    "[EventLog] Subscriber {:?} panicked on {}: {}",
                    entry.id,
                    event.kind,
                    panic_message(&panic)
                );
            }
        }

        event
    }

    /// Register a callback for every future event matching `filter`.
    pub fn subscribe(
        &self,
        filter: impl Into<EventFilter>,
        callback: impl Fn(&LoggedEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(SubscriberEntry {
            id,
            filter: filter.into(),
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// The last `limit` events (optionally of one kind), oldest first.
    pub fn recent(&self, limit: usize, kind: Option<&EventKind>) -> Vec<LoggedEvent> {
        let events = self.events.read();
        let mut selected: Vec<LoggedEvent> = events
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| &e.kind == k))
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    /// Every event appended after `sequence`, oldest first.
    pub fn since(&self, sequence: u64) -> Vec<LoggedEvent> {
        let events = self.events.read();
        let start = (sequence as usize).min(events.len());
        events[start..].to_vec()
    }

    /// Events caused by one agent, oldest first.
    pub fn by_agent(&self, agent_id: &str) -> Vec<LoggedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

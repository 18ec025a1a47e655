//! Priority message router with per-agent endpoints.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::message::Message;
use crate::events::event_log::panic_message;
use crate::events::{EventKind, EventLog};

/// Inbound handler an agent exposes to the router.
///
/// Closures `Fn(&Message) + Send + Sync` implement this trait.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

#[derive(Clone)]
enum Endpoint {
    Handler(Arc<dyn MessageHandler>),
    Inbox(UnboundedSender<Message>),
}

/// Queue entry; the heap pops the lowest `(priority, sequence)` first.
struct Queued {
    priority: u8,
    sequence: u64,
    message: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Snapshot of router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterMetrics {
    pub sent: u64,
    pub delivered: u64,
    pub dropped_unknown_recipient: u64,
    pub dropped_expired: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped_unknown_recipient: AtomicU64,
    dropped_expired: AtomicU64,
    handler_failures: AtomicU64,
}

/// Routes messages between agents in `(priority, arrival)` order.
pub struct MessageRouter {
    queue: Mutex<BinaryHeap<Queued>>,
    queued: Condvar,
    sequence: AtomicU64,
    endpoints: DashMap<String, Endpoint>,
    conversations: DashMap<String, Vec<Message>>,
    counters: Counters,
    log: Arc<EventLog>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("pending", &self.pending())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

impl MessageRouter {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            queued: Condvar::new(),
            sequence: AtomicU64::new(0),
            endpoints: DashMap::new(),
            conversations: DashMap::new(),
            counters: Counters::default(),
            log,
        }
    }

    // -----------------------------------------------------------------------
    // Endpoints
    // -----------------------------------------------------------------------

    /// Register (or replace) the inbound handler for `agent_id`.
    pub fn register_handler(&self, agent_id: impl Into<String>, handler: impl MessageHandler + 'static) {
        self.endpoints
            .insert(agent_id.into(), Endpoint::Handler(Arc::new(handler)));
    }

    /// Register a channel inbox for `agent_id` and return its receiving end.
    ///
    /// Worker threads block on `blocking_recv()`; dropping the receiver
    /// unregisters the agent at the next delivery attempt.
    pub fn register_inbox(&self, agent_id: impl Into<String>) -> UnboundedReceiver<Message> {
        let (tx, rx) = unbounded_channel();
        self.endpoints.insert(agent_id.into(), Endpoint::Inbox(tx));
        rx
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        self.endpoints.remove(agent_id).is_some()
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.endpoints.contains_key(agent_id)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue a message for delivery and return its id.
    pub fn send(&self, message: Message) -> String {
        let id = message.id.clone();
        if let Some(conversation) = &message.conversation_id {
            self.conversations
                .entry(conversation.clone())
                .or_default()
                .push(message.clone());
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        {
            let mut queue = self.queue.lock();
            queue.push(Queued {
                priority: message.priority,
                sequence,
                message,
            });
        }
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.queued.notify_one();
        id
    }

    /// Send a copy of `template` to every registered agent except its sender.
    /// Returns the ids of the queued copies.
    pub fn broadcast(&self, template: &Message) -> Vec<String> {
        let recipients: Vec<String> = self
            .endpoints
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| *id != template.sender)
            .collect();

        recipients
            .into_iter()
            .map(|recipient| {
                let mut copy = template.clone();
                copy.id = uuid::Uuid::new_v4().to_string();
                copy.recipient = recipient;
                self.send(copy)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Pop up to `max_messages` in priority order and hand each to its
    /// recipient. Returns how many reached a recipient.
    pub fn deliver(&self, max_messages: usize) -> usize {
        let batch: Vec<Message> = {
            let mut queue = self.queue.lock();
            let take = max_messages.min(queue.len());
            (0..take).filter_map(|_| queue.pop().map(|q| q.message)).collect()
        };

        let now = Utc::now();
        let mut delivered = 0;
        for message in batch {
            if message.is_expired(now) {
                self.counters.dropped_expired.fetch_add(1, Ordering::Relaxed);
                self.record_drop(&message, "expired");
                continue;
            }

            // Clone the endpoint out so the map is not borrowed while the
            // handler runs (handlers may register or send).
            let endpoint = self.endpoints.get(&message.recipient).map(|e| e.value().clone());
            match endpoint {
                None => {
                    self.counters
                        .dropped_unknown_recipient
                        .fetch_add(1, Ordering::Relaxed);
                    self.record_drop(&message, "unknown_recipient");
                }
                Some(Endpoint::Handler(handler)) => {
                    let result = catch_unwind(AssertUnwindSafe(|| handler.handle(&message)));
                    match result {
                        Ok(()) => {
                            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                            delivered += 1;
                        }
                        Err(panic) => {
                            self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "[MessageRouter] Handler for {} panicked on {} message {}: {}",
                                message.recipient,
                                message.kind,
                                message.id,
                                panic_message(&panic)
                            );
                        }
                    }
                }
                Some(Endpoint::Inbox(tx)) => {
                    let recipient = message.recipient.clone();
                    match tx.send(message) {
                        Ok(()) => {
                            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                            delivered += 1;
                        }
                        Err(err) => {
                            log::warn!("[MessageRouter] Inbox of {} is closed; unregistering", recipient);
                            self.endpoints.remove(&recipient);
                            self.counters
                                .dropped_unknown_recipient
                                .fetch_add(1, Ordering::Relaxed);
                            self.record_drop(&err.0, "inbox_closed");
                        }
                    }
                }
            }
        }
        delivered
    }

    /// Deliver until the queue is empty. Returns the number delivered.
    pub fn deliver_all(&self) -> usize {
        let mut total = 0;
        while self.pending() > 0 {
            total += self.deliver(usize::MAX);
        }
        total
    }

    /// Block until a message is queued or `timeout` elapses.
    /// Returns whether messages are pending.
    pub fn wait_for_messages(&self, timeout: Duration) -> bool {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.queued.wait_for(&mut queue, timeout);
        }
        !queue.is_empty()
    }

    /// Start a background thread that drains the queue in batches.
    pub fn spawn_delivery_loop(
        self: &Arc<Self>,
        batch_size: usize,
        interval: Duration,
    ) -> io::Result<DeliveryLoop> {
        let router = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("agora-delivery".to_string())
            .spawn(move || {
                log::debug!("[MessageRouter] Delivery loop started");
                while !stop_flag.load(Ordering::SeqCst) {
                    if router.wait_for_messages(interval) {
                        router.deliver(batch_size);
                    }
                }
                log::debug!("[MessageRouter] Delivery loop stopped");
            })?;

        Ok(DeliveryLoop {
            stop,
            handle: Some(handle),
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Ordered history of a conversation (send order).
    pub fn conversation(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.value().clone())
            .unwrap_or_default()
    }

    /// Messages queued but not yet delivered.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn metrics(&self) -> RouterMetrics {
        RouterMetrics {
            sent: self.counters.sent.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped_unknown_recipient: self.counters.dropped_unknown_recipient.load(Ordering::Relaxed),
            dropped_expired: self.counters.dropped_expired.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self, message: &Message, reason: &str) {
        log::debug!(
            "[MessageRouter] Dropped {} message {} to {} ({})",
            message.kind,
            message.id,
            message.recipient,
            reason
        );
        self.log.publish(
            EventKind::MessageDropped,
            json!({
                "message_id": message.id,
                "recipient": message.recipient,
                "kind": message.kind,
                "reason": reason,
            }),
            Some(&message.sender),
        );
    }
}

/// Handle to a running delivery thread; stops and joins it on drop.
pub struct DeliveryLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryLoop {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[MessageRouter] Delivery loop panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for DeliveryLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::{MessageKind, MessagePayload};
    use std::time::Instant;

    fn router() -> MessageRouter {
        MessageRouter::new(Arc::new(EventLog::new()))
    }

    fn msg(to: &str, priority: u8, text: &str) -> Message {
        Message::new("sender", to, MessageKind::Inform, MessagePayload::text(text)).with_priority(priority)
    }

    fn texts(received: &Mutex<Vec<Message>>) -> Vec<String> {
        received
            .lock()
            .iter()
            .map(|m| match &m.payload {
                MessagePayload::Text { text } => text.clone(),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_priority_then_arrival_order() {
        let router = router();
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        router.register_handler("worker", move |m: &Message| r.lock().push(m.clone()));

        router.send(msg("worker", 5, "low-1"));
        router.send(msg("worker", 1, "urgent-1"));
        router.send(msg("worker", 5, "low-2"));
        router.send(msg("worker", 1, "urgent-2"));
        router.send(msg("worker", 3, "mid"));

        assert_eq!(router.deliver(10), 5);
        assert_eq!(
            texts(&received),
            vec!["urgent-1", "urgent-2", "mid", "low-1", "low-2"]
        );
    }

    #[test]
    fn test_deliver_respects_max() {
        let router = router();
        router.register_handler("w", |_: &Message| {});
        for i in 0..5 {
            router.send(msg("w", 5, &i.to_string()));
        }
        assert_eq!(router.deliver(2), 2);
        assert_eq!(router.pending(), 3);
        assert_eq!(router.deliver_all(), 3);
    }

    #[test]
    fn test_unknown_recipient_dropped_and_counted() {
        let log = Arc::new(EventLog::new());
        let router = MessageRouter::new(log.clone());
        router.send(msg("ghost", 5, "hello"));

        assert_eq!(router.deliver(10), 0);
        let metrics = router.metrics();
        assert_eq!(metrics.sent, 1);
        assert_eq!(metrics.dropped_unknown_recipient, 1);
        assert_eq!(log.recent(1, Some(&EventKind::MessageDropped)).len(), 1);
    }

    #[test]
    fn test_expired_messages_dropped() {
        let router = router();
        router.register_handler("w", |_: &Message| {});
        let past = Utc::now() - chrono::Duration::milliseconds(5);
        router.send(msg("w", 5, "stale").with_deadline(past));
        router.send(msg("w", 5, "fresh"));

        assert_eq!(router.deliver(10), 1);
        assert_eq!(router.metrics().dropped_expired, 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let router = router();
        let received = Arc::new(Mutex::new(Vec::new()));
        router.register_handler("faulty", |_: &Message| panic!("boom"));
        let r = received.clone();
        router.register_handler("good", move |m: &Message| r.lock().push(m.clone()));

        router.send(msg("faulty", 1, "first"));
        router.send(msg("good", 2, "second"));

        assert_eq!(router.deliver(10), 1);
        assert_eq!(texts(&received), vec!["second"]);
        assert_eq!(router.metrics().handler_failures, 1);
    }

    #[test]
    fn test_conversation_history() {
        let router = router();
        let first = msg("b", 5, "q").in_conversation("conv");
        let reply = first.reply(MessageKind::Response, MessagePayload::text("a"));
        router.send(first);
        router.send(reply);
        router.send(msg("b", 5, "unrelated"));

        let history = router.conversation("conv");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].kind, MessageKind::Response);
        assert!(router.conversation("none").is_empty());
    }

    #[test]
    fn test_inbox_delivery() {
        let router = router();
        let mut inbox = router.register_inbox("worker");
        router.send(msg("worker", 5, "job"));
        assert_eq!(router.deliver(1), 1);
        let received = inbox.try_recv().unwrap();
        assert_eq!(received.recipient, "worker");
    }

    #[test]
    fn test_closed_inbox_unregisters() {
        let router = router();
        let inbox = router.register_inbox("worker");
        drop(inbox);
        router.send(msg("worker", 5, "job"));
        assert_eq!(router.deliver(1), 0);
        assert!(!router.is_registered("worker"));
        assert_eq!(router.metrics().dropped_unknown_recipient, 1);
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let router = router();
        let _a = router.register_inbox("a");
        let mut b = router.register_inbox("b");
        let mut c = router.register_inbox("c");
        let template = Message::new("a", "", MessageKind::Inform, MessagePayload::text("hi"));
        assert_eq!(router.broadcast(&template).len(), 2);
        router.deliver_all();
        assert!(b.try_recv().is_ok());
        assert!(c.try_recv().is_ok());
    }

    #[test]
    fn test_delivery_loop() {
        let router = Arc::new(router());
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        router.register_handler("w", move |m: &Message| r.lock().push(m.clone()));

        let mut delivery = router
            .spawn_delivery_loop(8, Duration::from_millis(5))
            .unwrap();
        for i in 0..20 {
            router.send(msg("w", 5, &i.to_string()));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while received.lock().len() < 20 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        delivery.stop();
        assert!(!delivery.is_running());
        assert_eq!(received.lock().len(), 20);
    }
}

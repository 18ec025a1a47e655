//! Deadline-bound session table shared by the negotiation protocols.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::Value;

use crate::errors::{CoordinationError, Result};
use crate::events::{EventKind, EventLog};

/// A protocol session that reaches a terminal outcome exactly once.
pub(crate) trait Session {
    type Outcome: Clone + Serialize;

    fn initiator(&self) -> &str;
    fn deadline(&self) -> DateTime<Utc>;
    /// `Some` once the session is terminal.
    fn outcome(&self) -> Option<Self::Outcome>;
    /// Move to the terminal state reached when the deadline fires.
    fn finalize_at_deadline(&mut self);
    fn closed_event() -> EventKind;

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline()
    }
}

/// Sessions keyed by id behind one mutex, with a condvar signalled on every
/// terminal transition.
///
/// Deadlines are enforced lazily: any access after the deadline first
/// finalizes the session, so an action arriving late is rejected rather
/// than applied.
pub(crate) struct SessionTable<S: Session> {
    sessions: Mutex<HashMap<String, S>>,
    closed: Condvar,
    log: Arc<EventLog>,
    label: &'static str,
}

impl<S: Session + Clone> SessionTable<S> {
    pub(crate) fn new(log: Arc<EventLog>, label: &'static str) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            closed: Condvar::new(),
            log,
            label,
        }
    }

    pub(crate) fn insert(&self, id: String, session: S) {
        self.sessions.lock().insert(id, session);
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Snapshot of a session, finalizing it first if its deadline passed.
    pub(crate) fn get(&self, id: &str) -> Option<S> {
        self.with_session(id, |s| Ok(s.clone())).ok()
    }

    /// Outcome if the session is terminal (after a lazy deadline check).
    pub(crate) fn outcome(&self, id: &str) -> Result<Option<S::Outcome>> {
        self.with_session(id, |s| Ok(s.outcome()))
    }

    /// Run `action` against an open session.
    ///
    /// Fails with `SessionClosed` if the session is terminal, including when
    /// the deadline has just passed. If `action` drives the session to a
    /// terminal state the outcome is published after the lock is released.
    pub(crate) fn with_open<T>(&self, id: &str, action: impl FnOnce(&mut S) -> Result<T>) -> Result<T> {
        self.with_session(id, |session| {
            if session.outcome().is_some() {
                return Err(CoordinationError::SessionClosed {
                    session_id: id.to_string(),
                });
            }
            action(session)
        })
    }

    fn with_session<T>(&self, id: &str, action: impl FnOnce(&mut S) -> Result<T>) -> Result<T> {
        let (result, closed) = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| CoordinationError::UnknownSession {
                    session_id: id.to_string(),
                })?;
            let was_open = session.outcome().is_none();
            if was_open && session.is_due(Utc::now()) {
                session.finalize_at_deadline();
            }
            let result = action(&mut *session);
            let closed = if was_open {
                session
                    .outcome()
                    .map(|o| (o, session.initiator().to_string()))
            } else {
                None
            };
            (result, closed)
        };

        if let Some((outcome, initiator)) = closed {
            self.announce(id, &outcome, &initiator);
        }
        result
    }

    /// Block until the session is terminal or `timeout` elapses.
    ///
    /// A session whose deadline falls inside the wait is finalized when the
    /// deadline fires. Returns `None` on timeout.
    pub(crate) fn wait_for_outcome(&self, id: &str, timeout: Duration) -> Result<Option<S::Outcome>> {
        // `None` means the timeout is too long to represent: wait for the deadline.
        let give_up = Instant::now().checked_add(timeout);
        let mut sessions = self.sessions.lock();
        loop {
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| CoordinationError::UnknownSession {
                    session_id: id.to_string(),
                })?;
            if let Some(outcome) = session.outcome() {
                return Ok(Some(outcome));
            }

            let now = Utc::now();
            if session.is_due(now) {
                session.finalize_at_deadline();
                let outcome = session.outcome();
                let initiator = session.initiator().to_string();
                drop(sessions);
                if let Some(outcome) = &outcome {
                    self.announce(id, outcome, &initiator);
                }
                return Ok(outcome);
            }

            if give_up.is_some_and(|g| Instant::now() >= g) {
                return Ok(None);
            }
            let until_deadline = (session.deadline() - now).to_std().unwrap_or_default();
            let wake = [Instant::now().checked_add(until_deadline), give_up]
                .into_iter()
                .flatten()
                .min();
            match wake {
                Some(wake) => {
                    self.closed.wait_until(&mut sessions, wake);
                }
                None => self.closed.wait(&mut sessions),
            }
        }
    }

    /// Finalize every open session whose deadline has passed.
    pub(crate) fn sweep_expired(&self) -> Vec<S::Outcome> {
        let now = Utc::now();
        let closed: Vec<(String, S::Outcome, String)> = {
            let mut sessions = self.sessions.lock();
            sessions
                .iter_mut()
                .filter(|(_, s)| s.outcome().is_none() && s.is_due(now))
                .filter_map(|(id, s)| {
                    s.finalize_at_deadline();
                    s.outcome().map(|o| (id.clone(), o, s.initiator().to_string()))
                })
                .collect()
        };

        closed
            .into_iter()
            .map(|(id, outcome, initiator)| {
                self.announce(&id, &outcome, &initiator);
                outcome
            })
            .collect()
    }

    fn announce(&self, id: &str, outcome: &S::Outcome, initiator: &str) {
        self.closed.notify_all();
        log::info!("[{}] Session {} closed", self.label, id);
        let data = serde_json::to_value(outcome).unwrap_or(Value::Null);
        self.log.publish(S::closed_event(), data, Some(initiator));
    }
}

/// Deadline `duration` from now, saturating at the latest representable time.
pub(crate) fn deadline_after(duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

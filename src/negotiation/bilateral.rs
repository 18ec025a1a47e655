//! Two-party offer/counter-offer negotiation.
//!
//! ```text
//! propose ──► Open ──counter──► Countered ──counter──► Countered ...
//!              │                   │
//!              ├── accept ──► Accepted
//!              ├── reject ──► Rejected
//!              └── deadline ► Expired
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::session::{deadline_after, Session, SessionTable};
use crate::errors::{CoordinationError, Result};
use crate::events::{EventKind, EventLog};

/// State of a bilateral negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Open,
    Countered,
    Accepted,
    Rejected,
    Expired,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Expired)
    }
}

/// One offer made during a negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub from: String,
    pub amount: f64,
    #[serde(default)]
    pub terms: Value,
    /// 0 for the opening proposal, then 1, 2, ... per counter-offer.
    pub round: u32,
    pub made_at: DateTime<Utc>,
}

/// A negotiation between an initiator and a responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Negotiation {
    pub id: String,
    pub initiator: String,
    pub responder: String,
    pub subject: String,
    pub state: NegotiationState,
    /// Every offer in order; the last one is live.
    pub offers: Vec<Offer>,
    pub max_rounds: u32,
    pub deadline: DateTime<Utc>,
    pub agreement: Option<Offer>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Terminal result of a negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationOutcome {
    pub session_id: String,
    pub subject: String,
    pub state: NegotiationState,
    /// The agreed offer when `state` is `Accepted`.
    pub agreement: Option<Offer>,
    pub rounds: u32,
}

impl Negotiation {
    /// The offer currently awaiting a response.
    pub fn live_offer(&self) -> Option<&Offer> {
        self.offers.last()
    }

    pub fn counter_rounds(&self) -> u32 {
        self.offers.last().map_or(0, |o| o.round)
    }

    fn is_party(&self, agent_id: &str) -> bool {
        self.initiator == agent_id || self.responder == agent_id
    }

    /// Only the party that did not make the live offer may respond to it.
    fn check_responder(&self, agent_id: &str, action: &str) -> Result<()> {
        if !self.is_party(agent_id) {
            return Err(CoordinationError::NotParticipant {
                session_id: self.id.clone(),
                agent_id: agent_id.to_string(),
            });
        }
        if self.live_offer().map_or(false, |o| o.from == agent_id) {
            return Err(CoordinationError::InvalidTransition {
                entity: "negotiation",
                id: self.id.clone(),
                from: format!("{:?} (own offer)", self.state),
                to: action.to_string(),
            });
        }
        Ok(())
    }

    fn close(&mut self, state: NegotiationState, agreement: Option<Offer>) {
        self.state = state;
        self.agreement = agreement;
        self.closed_at = Some(Utc::now());
    }
}

impl Session for Negotiation {
    type Outcome = NegotiationOutcome;

    fn initiator(&self) -> &str {
        &self.initiator
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    fn outcome(&self) -> Option<NegotiationOutcome> {
        self.state.is_terminal().then(|| NegotiationOutcome {
            session_id: self.id.clone(),
            subject: self.subject.clone(),
            state: self.state,
            agreement: self.agreement.clone(),
            rounds: self.counter_rounds(),
        })
    }

    fn finalize_at_deadline(&mut self) {
        self.close(NegotiationState::Expired, None);
    }

    fn closed_event() -> EventKind {
        EventKind::NegotiationClosed
    }
}

/// Runs bilateral negotiations.
pub struct NegotiationManager {
    sessions: SessionTable<Negotiation>,
    max_rounds: u32,
}

impl std::fmt::Debug for NegotiationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationManager")
            .field("sessions", &self.sessions.len())
            .field("max_rounds", &self.max_rounds)
            .finish()
    }
}

impl NegotiationManager {
    pub fn new(log: Arc<EventLog>, max_rounds: u32) -> Self {
        Self {
            sessions: SessionTable::new(log, "NegotiationManager"),
            max_rounds,
        }
    }

    /// Open a negotiation with an initial offer. Returns the session id.
    pub fn propose(
        &self,
        initiator: &str,
        responder: &str,
        subject: impl Into<String>,
        amount: f64,
        terms: Value,
        timeout: Duration,
    ) -> Result<String> {
        if initiator == responder {
            return Err(CoordinationError::NotParticipant {
                session_id: String::new(),
                agent_id: responder.to_string(),
            });
        }
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let negotiation = Negotiation {
            id: id.clone(),
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            subject: subject.into(),
            state: NegotiationState::Open,
            offers: vec![Offer {
                from: initiator.to_string(),
                amount,
                terms,
                round: 0,
                made_at: now,
            }],
            max_rounds: self.max_rounds,
            deadline: deadline_after(timeout),
            agreement: None,
            closed_at: None,
        };
        log::debug!(
            "[NegotiationManager] {} proposed {} to {} on {}",
            initiator,
            amount,
            responder,
            negotiation.subject
        );
        self.sessions.insert(id.clone(), negotiation);
        Ok(id)
    }

    /// Replace the live offer with a counter-offer.
    pub fn counter_offer(&self, session_id: &str, agent_id: &str, amount: f64, terms: Value) -> Result<u32> {
        self.sessions.with_open(session_id, |n| {
            n.check_responder(agent_id, "countered")?;
            let round = n.counter_rounds() + 1;
            if round > n.max_rounds {
                return Err(CoordinationError::RoundsExhausted {
                    session_id: n.id.clone(),
                    max_rounds: n.max_rounds,
                });
            }
            n.offers.push(Offer {
                from: agent_id.to_string(),
                amount,
                terms,
                round,
                made_at: Utc::now(),
            });
            n.state = NegotiationState::Countered;
            Ok(round)
        })
    }

    /// Accept and close the negotiation.
    ///
    /// With `accept_counter` the agreement is the most recent offer; without
    /// it, the opening proposal.
    pub fn accept(&self, session_id: &str, agent_id: &str, accept_counter: bool) -> Result<NegotiationOutcome> {
        self.sessions.with_open(session_id, |n| {
            n.check_responder(agent_id, "accepted")?;
            let agreed = if accept_counter {
                n.live_offer().cloned()
            } else {
                n.offers.first().cloned()
            };
            if agreed.as_ref().map_or(false, |o| o.from == agent_id) {
                return Err(CoordinationError::InvalidTransition {
                    entity: "negotiation",
                    id: n.id.clone(),
                    from: "own offer".to_string(),
                    to: "accepted".to_string(),
                });
            }
            n.close(NegotiationState::Accepted, agreed);
            n.outcome().ok_or_else(|| CoordinationError::SessionClosed {
                session_id: n.id.clone(),
            })
        })
    }

    pub fn reject(&self, session_id: &str, agent_id: &str) -> Result<NegotiationOutcome> {
        self.sessions.with_open(session_id, |n| {
            n.check_responder(agent_id, "rejected")?;
            n.close(NegotiationState::Rejected, None);
            n.outcome().ok_or_else(|| CoordinationError::SessionClosed {
                session_id: n.id.clone(),
            })
        })
    }

    pub fn negotiation(&self, session_id: &str) -> Option<Negotiation> {
        self.sessions.get(session_id)
    }

    pub fn outcome(&self, session_id: &str) -> Result<Option<NegotiationOutcome>> {
        self.sessions.outcome(session_id)
    }

    /// Block until the negotiation is terminal (it expires at its deadline)
    /// or `timeout` elapses.
    pub fn wait_for_outcome(&self, session_id: &str, timeout: Duration) -> Result<Option<NegotiationOutcome>> {
        self.sessions.wait_for_outcome(session_id, timeout)
    }

    pub fn sweep_expired(&self) -> Vec<NegotiationOutcome> {
        self.sessions.sweep_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn manager() -> (NegotiationManager, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        (NegotiationManager::new(log.clone(), 3), log)
    }

    const LONG: Duration = Duration::from_secs(60);

    #[test]
    fn test_unbounded_waits_do_not_overflow() {
        let (m, _) = manager();
        let open_ended = m.propose("a", "b", "slot", 10.0, Value::Null, Duration::MAX).unwrap();
        m.reject(&open_ended, "b").unwrap();
        let outcome = m.wait_for_outcome(&open_ended, Duration::MAX).unwrap().unwrap();
        assert_eq!(outcome.state, NegotiationState::Rejected);

        let short = m
            .propose("a", "b", "slot", 10.0, Value::Null, Duration::from_millis(20))
            .unwrap();
        let outcome = m.wait_for_outcome(&short, Duration::MAX).unwrap().unwrap();
        assert_eq!(outcome.state, NegotiationState::Expired);
    }

    #[test]
    fn test_counter_then_accept_uses_latest_offer() {
        let (m, log) = manager();
        let id = m.propose("buyer", "seller", "dataset license", 100.0, json!({"months": 12}), LONG).unwrap();
        assert_eq!(m.counter_offer(&id, "seller", 150.0, json!({"months": 12})).unwrap(), 1);
        assert_eq!(m.counter_offer(&id, "buyer", 125.0, json!({"months": 12})).unwrap(), 2);

        let outcome = m.accept(&id, "seller", true).unwrap();
        assert_eq!(outcome.state, NegotiationState::Accepted);
        let agreement = outcome.agreement.unwrap();
        assert_eq!(agreement.amount, 125.0);
        assert_eq!(agreement.from, "buyer");
        assert_eq!(outcome.rounds, 2);
        assert_eq!(m.negotiation(&id).unwrap().offers.len(), 3);
        assert_eq!(log.recent(5, Some(&EventKind::NegotiationClosed)).len(), 1);
    }

    #[test]
    fn test_accept_opening_proposal() {
        let (m, _) = manager();
        let id = m.propose("a", "b", "slot", 10.0, Value::Null, LONG).unwrap();
        let outcome = m.accept(&id, "b", false).unwrap();
        assert_eq!(outcome.agreement.unwrap().amount, 10.0);
    }

    #[test]
    fn test_cannot_answer_own_offer() {
        let (m, _) = manager();
        let id = m.propose("a", "b", "slot", 10.0, Value::Null, LONG).unwrap();
        assert!(matches!(
            m.accept(&id, "a", true),
            Err(CoordinationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            m.counter_offer(&id, "mallory", 1.0, Value::Null),
            Err(CoordinationError::NotParticipant { .. })
        ));
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let (m, _) = manager();
        let id = m.propose("a", "b", "slot", 10.0, Value::Null, LONG).unwrap();
        m.reject(&id, "b").unwrap();
        assert!(matches!(
            m.accept(&id, "b", true),
            Err(CoordinationError::SessionClosed { .. })
        ));
        assert_eq!(m.outcome(&id).unwrap().unwrap().state, NegotiationState::Rejected);
    }

    #[test]
    fn test_round_limit() {
        let (m, _) = manager();
        let id = m.propose("a", "b", "slot", 1.0, Value::Null, LONG).unwrap();
        m.counter_offer(&id, "b", 2.0, Value::Null).unwrap();
        m.counter_offer(&id, "a", 3.0, Value::Null).unwrap();
        m.counter_offer(&id, "b", 4.0, Value::Null).unwrap();
        assert!(matches!(
            m.counter_offer(&id, "a", 5.0, Value::Null),
            Err(CoordinationError::RoundsExhausted { max_rounds: 3, .. })
        ));
    }

    #[test]
    fn test_expiry_rejects_late_actions() {
        let (m, log) = manager();
        let id = m.propose("a", "b", "slot", 1.0, Value::Null, Duration::from_millis(20)).unwrap();
        let outcome = m.wait_for_outcome(&id, Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(outcome.state, NegotiationState::Expired);
        assert!(matches!(
            m.accept(&id, "b", true),
            Err(CoordinationError::SessionClosed { .. })
        ));
        assert_eq!(log.recent(5, Some(&EventKind::NegotiationClosed)).len(), 1);
    }

    #[test]
    fn test_sweep_expired() {
        let (m, _) = manager();
        let id = m.propose("a", "b", "slot", 1.0, Value::Null, Duration::from_millis(1)).unwrap();
        thread::sleep(Duration::from_millis(10));
        let swept = m.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].session_id, id);
        assert!(m.sweep_expired().is_empty());
    }

    #[test]
    fn test_wait_wakes_on_accept() {
        let (m, _) = manager();
        let m = Arc::new(m);
        let id = m.propose("a", "b", "slot", 1.0, Value::Null, LONG).unwrap();
        let waiter = {
            let m = m.clone();
            let id = id.clone();
            thread::spawn(move || m.wait_for_outcome(&id, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        m.accept(&id, "b", true).unwrap();
        let outcome = waiter.join().unwrap().unwrap().unwrap();
        assert_eq!(outcome.state, NegotiationState::Accepted);
    }

    #[test]
    fn test_unknown_session() {
        let (m, _) = manager();
        assert!(matches!(
            m.reject("nope", "a"),
            Err(CoordinationError::UnknownSession { .. })
        ));
    }
}

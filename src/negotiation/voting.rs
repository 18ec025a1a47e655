//! Consensus votes over a fixed set of options.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::{deadline_after, Session, SessionTable};
use crate::errors::{CoordinationError, Result};
use crate::events::{EventKind, EventLog};

/// How the leading option becomes the decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum VotingMethod {
    /// Plurality of cast ballots.
    Majority,
    /// The leader needs at least `threshold` of cast ballots.
    Supermajority { threshold: f64 },
    /// Every cast ballot names the same option.
    Unanimous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteState {
    Open,
    Closed,
}

/// Parameters for opening a vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteSpec {
    pub topic: String,
    pub initiator: String,
    pub options: Vec<String>,
    pub eligible_voters: Vec<String>,
    pub method: VotingMethod,
    /// Minimum participation rate for any decision.
    pub quorum: Option<f64>,
    /// Wins ties it is part of; otherwise ties go to the lexically smallest option.
    pub preferred_option: Option<String>,
}

impl VoteSpec {
    pub fn new<O, V, S1, S2>(
        topic: impl Into<String>,
        initiator: impl Into<String>,
        options: O,
        eligible_voters: V,
    ) -> Self
    where
        O: IntoIterator<Item = S1>,
        S1: Into<String>,
        V: IntoIterator<Item = S2>,
        S2: Into<String>,
    {
        Self {
            topic: topic.into(),
            initiator: initiator.into(),
            options: options.into_iter().map(Into::into).collect(),
            eligible_voters: eligible_voters.into_iter().map(Into::into).collect(),
            method: VotingMethod::Majority,
            quorum: None,
            preferred_option: None,
        }
    }

    pub fn with_method(mut self, method: VotingMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_quorum(mut self, quorum: f64) -> Self {
        self.quorum = Some(quorum);
        self
    }

    pub fn with_preferred_option(mut self, option: impl Into<String>) -> Self {
        self.preferred_option = Some(option.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub voter: String,
    pub option: String,
    pub cast_at: DateTime<Utc>,
}

/// Tally computed once when the vote closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub vote_id: String,
    pub topic: String,
    /// `None` when no option met the method's bar or quorum failed.
    pub decision: Option<String>,
    /// Ballots per option, including options nobody chose.
    pub tally: BTreeMap<String, usize>,
    pub cast: usize,
    pub eligible: usize,
    /// `cast / eligible`.
    pub participation_rate: f64,
    pub quorum_met: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub spec: VoteSpec,
    pub state: VoteState,
    /// One ballot per voter; a later ballot replaces the earlier one.
    pub ballots: BTreeMap<String, Ballot>,
    pub deadline: DateTime<Utc>,
    pub result: Option<VoteOutcome>,
    close_when_complete: bool,
}

impl Vote {
    fn tally(&mut self) {
        let mut tally: BTreeMap<String, usize> =
            self.spec.options.iter().map(|o| (o.clone(), 0)).collect();
        for ballot in self.ballots.values() {
            *tally.entry(ballot.option.clone()).or_insert(0) += 1;
        }

        let cast = self.ballots.len();
        let eligible = self.spec.eligible_voters.len();
        let participation_rate = if eligible == 0 {
            0.0
        } else {
            cast as f64 / eligible as f64
        };
        let quorum_met = self.spec.quorum.map_or(true, |q| participation_rate >= q);

        let top = tally.values().copied().max().unwrap_or(0);
        let tied: Vec<&String> = tally
            .iter()
            .filter(|(_, count)| **count == top)
            .map(|(option, _)| option)
            .collect();
        // BTreeMap iteration already yields the lexically smallest first.
        let leader = self
            .spec
            .preferred_option
            .as_ref()
            .filter(|p| tied.contains(p))
            .or_else(|| tied.first().copied())
            .cloned();

        let passes = cast > 0
            && match self.spec.method {
                VotingMethod::Majority => true,
                VotingMethod::Supermajority { threshold } => top as f64 / cast as f64 >= threshold,
                VotingMethod::Unanimous => top == cast,
            };
        let decision = if passes && quorum_met { leader } else { None };

        log::debug!(
            "[VotingBooth] Vote {} tallied {:?} -> {:?}",
            self.id,
            tally,
            decision
        );
        self.state = VoteState::Closed;
        self.result = Some(VoteOutcome {
            vote_id: self.id.clone(),
            topic: self.spec.topic.clone(),
            decision,
            tally,
            cast,
            eligible,
            participation_rate,
            quorum_met,
        });
    }
}

impl Session for Vote {
    type Outcome = VoteOutcome;

    fn initiator(&self) -> &str {
        &self.spec.initiator
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    fn outcome(&self) -> Option<VoteOutcome> {
        self.result.clone()
    }

    fn finalize_at_deadline(&mut self) {
        self.tally();
    }

    fn closed_event() -> EventKind {
        EventKind::VoteClosed
    }
}

/// Runs consensus votes.
pub struct VotingBooth {
    sessions: SessionTable<Vote>,
    close_when_complete: bool,
}

impl std::fmt::Debug for VotingBooth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VotingBooth")
            .field("votes", &self.sessions.len())
            .field("close_when_complete", &self.close_when_complete)
            .finish()
    }
}

impl VotingBooth {
    pub fn new(log: Arc<EventLog>, close_when_complete: bool) -> Self {
        Self {
            sessions: SessionTable::new(log, "VotingBooth"),
            close_when_complete,
        }
    }

    /// Open a vote that closes after `duration`. Returns its id.
    pub fn open(&self, spec: VoteSpec, duration: Duration) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        if spec.options.is_empty() {
            return Err(CoordinationError::InvalidOption {
                session_id: id,
                option: None,
            });
        }
        if let Some(preferred) = &spec.preferred_option {
            if !spec.options.contains(preferred) {
                return Err(CoordinationError::InvalidOption {
                    session_id: id,
                    option: Some(preferred.clone()),
                });
            }
        }
        if let VotingMethod::Supermajority { threshold } = spec.method {
            crate::errors::check_unit_score("threshold", threshold)?;
        }
        if let Some(quorum) = spec.quorum {
            crate::errors::check_unit_score("quorum", quorum)?;
        }

        log::debug!(
            "[VotingBooth] {} opened vote {} on {} ({} voters)",
            spec.initiator,
            id,
            spec.topic,
            spec.eligible_voters.len()
        );
        let vote = Vote {
            id: id.clone(),
            spec,
            state: VoteState::Open,
            ballots: BTreeMap::new(),
            deadline: deadline_after(duration),
            result: None,
            close_when_complete: self.close_when_complete,
        };
        self.sessions.insert(id.clone(), vote);
        Ok(id)
    }

    /// Cast or replace `voter`'s ballot.
    ///
    /// Returns the outcome when this ballot completed the electorate and the
    /// vote closed early.
    pub fn cast_vote(&self, vote_id: &str, voter: &str, option: &str) -> Result<Option<VoteOutcome>> {
        self.sessions.with_open(vote_id, |vote| {
            if !vote.spec.eligible_voters.iter().any(|v| v == voter) {
                return Err(CoordinationError::NotParticipant {
                    session_id: vote_id.to_string(),
                    agent_id: voter.to_string(),
                });
            }
            if !vote.spec.options.iter().any(|o| o == option) {
                return Err(CoordinationError::InvalidOption {
                    session_id: vote_id.to_string(),
                    option: Some(option.to_string()),
                });
            }
            vote.ballots.insert(
                voter.to_string(),
                Ballot {
                    voter: voter.to_string(),
                    option: option.to_string(),
                    cast_at: Utc::now(),
                },
            );
            if vote.close_when_complete && vote.ballots.len() == vote.spec.eligible_voters.len() {
                vote.tally();
            }
            Ok(vote.result.clone())
        })
    }

    /// Close before the deadline. Only the initiator may do this.
    pub fn close(&self, vote_id: &str, agent_id: &str) -> Result<VoteOutcome> {
        self.sessions.with_open(vote_id, |vote| {
            if vote.spec.initiator != agent_id {
                return Err(CoordinationError::NotParticipant {
                    session_id: vote_id.to_string(),
                    agent_id: agent_id.to_string(),
                });
            }
            vote.tally();
            vote.result.clone().ok_or_else(|| CoordinationError::SessionClosed {
                session_id: vote_id.to_string(),
            })
        })
    }

    pub fn vote(&self, vote_id: &str) -> Option<Vote> {
        self.sessions.get(vote_id)
    }

    pub fn outcome(&self, vote_id: &str) -> Result<Option<VoteOutcome>> {
        self.sessions.outcome(vote_id)
    }

    /// Block until the vote closes (at its deadline at the latest) or
    /// `timeout` elapses.
    pub fn wait_for_outcome(&self, vote_id: &str, timeout: Duration) -> Result<Option<VoteOutcome>> {
        self.sessions.wait_for_outcome(vote_id, timeout)
    }

    pub fn sweep_expired(&self) -> Vec<VoteOutcome> {
        self.sessions.sweep_expired()
    }
}
